use std::{collections::HashSet, sync::Arc};

use tracing::{debug, error};

use crate::{
    data_model::NodeLabel,
    protocol::{NodeHeartbeatResponse, RegisterNodeManagerResponse},
    utils::time::get_epoch_time_in_ms,
};

const MAX_LABEL_LENGTH: usize = 255;

/// Source of this node's labels in distributed label configurations, e.g. a
/// script or config-file provider. Out of scope here beyond this seam.
pub trait NodeLabelsProvider: Send + Sync {
    fn node_labels(&self) -> Option<HashSet<NodeLabel>>;
}

/// Capability set shared by the two label configurations. In centralized mode
/// the controller owns labels and the node stays silent; in distributed mode
/// the node pushes provider labels and checks the controller's verdict.
pub trait NodeLabelsHandler: Send {
    /// Labels to attach to the registration request, or `None` to send none.
    fn labels_for_registration(&mut self) -> Option<HashSet<NodeLabel>>;

    /// Returns a fragment for the registration success log; rejections are
    /// logged here and yield an empty fragment.
    fn verify_registration_ack(&mut self, response: &RegisterNodeManagerResponse) -> String;

    /// Labels to attach to the next heartbeat. `None` means nothing changed
    /// (or validation failed), so the controller keeps the previous set.
    fn labels_for_heartbeat(&mut self) -> Option<HashSet<NodeLabel>>;

    /// Checks whether labels sent on the last heartbeat were accepted.
    fn verify_heartbeat_ack(&mut self, response: &NodeHeartbeatResponse);
}

pub fn create_node_labels_handler(
    provider: Option<Arc<dyn NodeLabelsProvider>>,
    resync_interval_ms: u64,
) -> Box<dyn NodeLabelsHandler> {
    match provider {
        None => Box::new(CentralizedNodeLabelsHandler),
        Some(provider) => Box::new(DistributedNodeLabelsHandler::new(
            provider,
            resync_interval_ms,
        )),
    }
}

/// With centralized labels the node neither sends labels nor processes the
/// controller's acceptance fields.
pub struct CentralizedNodeLabelsHandler;

impl NodeLabelsHandler for CentralizedNodeLabelsHandler {
    fn labels_for_registration(&mut self) -> Option<HashSet<NodeLabel>> {
        None
    }

    fn verify_registration_ack(&mut self, _response: &RegisterNodeManagerResponse) -> String {
        String::new()
    }

    fn labels_for_heartbeat(&mut self) -> Option<HashSet<NodeLabel>> {
        None
    }

    fn verify_heartbeat_ack(&mut self, _response: &NodeHeartbeatResponse) {}
}

pub struct DistributedNodeLabelsHandler {
    provider: Arc<dyn NodeLabelsProvider>,
    resync_interval_ms: u64,
    previous_labels: HashSet<NodeLabel>,
    labels_sent: bool,
    last_send_ms: u64,
}

impl DistributedNodeLabelsHandler {
    pub fn new(provider: Arc<dyn NodeLabelsProvider>, resync_interval_ms: u64) -> Self {
        Self {
            provider,
            resync_interval_ms,
            previous_labels: HashSet::new(),
            labels_sent: false,
            last_send_ms: 0,
        }
    }

    fn provider_labels(&self) -> HashSet<NodeLabel> {
        // A provider returning nothing means the node has an empty label set.
        self.provider.node_labels().unwrap_or_default()
    }

    fn resync_interval_elapsed(&self) -> bool {
        get_epoch_time_in_ms() - self.last_send_ms > self.resync_interval_ms
    }

    fn joined(labels: &HashSet<NodeLabel>) -> String {
        let mut names: Vec<&str> = labels.iter().map(|label| label.name()).collect();
        names.sort_unstable();
        names.join(",")
    }
}

impl NodeLabelsHandler for DistributedNodeLabelsHandler {
    fn labels_for_registration(&mut self) -> Option<HashSet<NodeLabel>> {
        let labels = self.provider_labels();
        self.previous_labels = labels.clone();
        match validate_node_labels(&labels) {
            Ok(()) => Some(labels),
            Err(message) => {
                error!(error = %message, "invalid node labels from provider");
                None
            }
        }
    }

    fn verify_registration_ack(&mut self, response: &RegisterNodeManagerResponse) -> String {
        if response.are_node_labels_accepted {
            format!(
                " and with following node label(s): {{{}}}",
                Self::joined(&self.previous_labels)
            )
        } else {
            match &response.diagnostics_message {
                Some(message) => error!(
                    diagnostics = %message,
                    "node labels sent at registration were rejected by the controller"
                ),
                None => error!(
                    "node labels sent at registration were rejected by the controller; \
                     it seems to be configured with centralized labels"
                ),
            }
            String::new()
        }
    }

    fn labels_for_heartbeat(&mut self) -> Option<HashSet<NodeLabel>> {
        let labels = self.provider_labels();
        let labels_updated = labels.len() != self.previous_labels.len()
            || !labels
                .iter()
                .all(|label| self.previous_labels.contains(label));

        self.labels_sent = false;
        if !labels_updated && !self.resync_interval_elapsed() {
            // Unchanged labels are not re-sent until the resync interval
            // elapses.
            return None;
        }

        self.previous_labels = labels.clone();
        let result = match validate_node_labels(&labels) {
            Ok(()) => {
                debug!(labels = %Self::joined(&labels), "sending labels from provider");
                self.labels_sent = true;
                Some(labels)
            }
            Err(message) => {
                // Keep the invalid set as "previous" so it is not re-validated
                // every round; sending nothing leaves the controller on the
                // earlier accepted set.
                error!(error = %message, "invalid node labels from provider");
                None
            }
        };
        self.last_send_ms = get_epoch_time_in_ms();
        result
    }

    fn verify_heartbeat_ack(&mut self, response: &NodeHeartbeatResponse) {
        if !self.labels_sent {
            return;
        }
        if response.are_node_labels_accepted {
            debug!(
                labels = %Self::joined(&self.previous_labels),
                "node labels were accepted by the controller"
            );
        } else {
            error!(
                labels = %Self::joined(&self.previous_labels),
                diagnostics = response.diagnostics_message.as_deref().unwrap_or(""),
                "node labels were not accepted by the controller"
            );
        }
    }
}

/// Syntactic label check: labels start alphanumeric, continue with
/// alphanumerics, `-` or `_`, and stay within the length cap.
fn check_label_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_LABEL_LENGTH {
        return Err(format!(
            "label \"{name}\" must be between 1 and {MAX_LABEL_LENGTH} characters"
        ));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric()
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(format!(
            "label \"{name}\" must start with an alphanumeric character and contain only \
             alphanumerics, '-' or '_'"
        ));
    }
    Ok(())
}

fn validate_node_labels(labels: &HashSet<NodeLabel>) -> Result<(), String> {
    let errors: Vec<String> = labels
        .iter()
        .filter_map(|label| check_label_name(label.name()).err())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use mock_instant::global::MockClock;

    use super::*;

    struct ScriptedProvider {
        labels: Mutex<Option<HashSet<NodeLabel>>>,
    }

    impl ScriptedProvider {
        fn new(labels: Option<HashSet<NodeLabel>>) -> Arc<Self> {
            Arc::new(Self {
                labels: Mutex::new(labels),
            })
        }

        fn set(&self, labels: Option<HashSet<NodeLabel>>) {
            *self.labels.lock().unwrap() = labels;
        }
    }

    impl NodeLabelsProvider for ScriptedProvider {
        fn node_labels(&self) -> Option<HashSet<NodeLabel>> {
            self.labels.lock().unwrap().clone()
        }
    }

    fn labels(names: &[&str]) -> HashSet<NodeLabel> {
        names.iter().map(|name| NodeLabel::new(*name)).collect()
    }

    #[test]
    fn test_centralized_handler_stays_silent() {
        let mut handler = CentralizedNodeLabelsHandler;
        assert!(handler.labels_for_registration().is_none());
        assert!(handler.labels_for_heartbeat().is_none());
        assert_eq!(
            handler.verify_registration_ack(&RegisterNodeManagerResponse::default()),
            ""
        );
    }

    #[test]
    fn test_provider_null_becomes_empty_set() {
        let provider = ScriptedProvider::new(None);
        let mut handler = DistributedNodeLabelsHandler::new(provider, 120_000);
        assert_eq!(handler.labels_for_registration(), Some(HashSet::new()));
    }

    #[test]
    fn test_unchanged_labels_are_not_resent() {
        let provider = ScriptedProvider::new(Some(labels(&["gpu"])));
        let mut handler = DistributedNodeLabelsHandler::new(provider.clone(), u64::MAX);
        assert_eq!(handler.labels_for_registration(), Some(labels(&["gpu"])));

        // Same set again, within the resync interval: silence.
        assert!(handler.labels_for_heartbeat().is_none());
        assert!(!handler.labels_sent);

        // A change is sent immediately.
        provider.set(Some(labels(&["gpu", "ssd"])));
        assert_eq!(handler.labels_for_heartbeat(), Some(labels(&["gpu", "ssd"])));
        assert!(handler.labels_sent);
    }

    #[test]
    fn test_resync_interval_forces_resend() {
        let provider = ScriptedProvider::new(Some(labels(&["gpu"])));
        let mut handler = DistributedNodeLabelsHandler::new(provider, 120_000);
        handler.labels_for_registration();
        handler.last_send_ms = get_epoch_time_in_ms();

        assert!(handler.labels_for_heartbeat().is_none());

        MockClock::advance_system_time(Duration::from_millis(121_000));
        assert_eq!(handler.labels_for_heartbeat(), Some(labels(&["gpu"])));
    }

    #[test]
    fn test_invalid_labels_send_nothing_and_are_remembered() {
        let provider = ScriptedProvider::new(Some(labels(&["gpu"])));
        let mut handler = DistributedNodeLabelsHandler::new(provider.clone(), u64::MAX);
        handler.labels_for_registration();

        provider.set(Some(labels(&["-bad-label"])));
        assert!(handler.labels_for_heartbeat().is_none());
        assert!(!handler.labels_sent);
        // The invalid set became "previous", so it is not re-validated every
        // round.
        assert_eq!(handler.previous_labels, labels(&["-bad-label"]));
        assert!(handler.labels_for_heartbeat().is_none());
    }

    #[test]
    fn test_rejected_labels_stay_previous() {
        let provider = ScriptedProvider::new(Some(labels(&[])));
        let mut handler = DistributedNodeLabelsHandler::new(provider.clone(), u64::MAX);
        handler.labels_for_registration();

        provider.set(Some(labels(&["x"])));
        assert_eq!(handler.labels_for_heartbeat(), Some(labels(&["x"])));

        let response = NodeHeartbeatResponse {
            are_node_labels_accepted: false,
            diagnostics_message: Some("centralized".to_string()),
            ..Default::default()
        };
        handler.verify_heartbeat_ack(&response);
        // They were sent, so they remain the previous set and the next
        // heartbeat within the resync interval carries nothing.
        assert_eq!(handler.previous_labels, labels(&["x"]));
        assert!(handler.labels_for_heartbeat().is_none());
    }

    #[test]
    fn test_label_name_rules() {
        assert!(check_label_name("gpu").is_ok());
        assert!(check_label_name("has-ssd_2").is_ok());
        assert!(check_label_name("").is_err());
        assert!(check_label_name("-leading-dash").is_err());
        assert!(check_label_name("white space").is_err());
        assert!(check_label_name(&"x".repeat(256)).is_err());
    }
}
