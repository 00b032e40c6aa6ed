use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use tokio::{sync::Notify, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    config::NodeAgentConfig,
    context::{NodeContext, NodeHealthChecker, ResourcePlugin},
    data_model::{
        ApplicationId, ContainerId, ContainerLifecycle, ContainerReport, ContainerState,
        ContainerStatus, NodeStatus, NodeStatusBuilder, Resource, UpdatedContainer,
    },
    events::{CompletionReason, Dispatcher, NodeEvent},
    hardware::HardwareProbe,
    keep_alive::KeepAliveTracker,
    metrics::NodeAgentMetrics,
    node_labels::{create_node_labels_handler, NodeLabelsHandler, NodeLabelsProvider},
    protocol::{
        NodeAction, NodeHeartbeatRequest, NodeHeartbeatResponse, RegisterNodeManagerRequest,
        ResourceTracker, TrackerConnector, TrackerError, UnRegisterNodeManagerRequest,
        INVALID_CONTROLLER_IDENTIFIER,
    },
    stopped_containers::RecentlyStoppedCache,
};

/// State owned by the heartbeat loop. `last_heartbeat_id` advances only from
/// acknowledged controller responses; `missed_heartbeat` keeps completed
/// container reports alive across a failed round.
struct HeartbeatLoopState {
    last_heartbeat_id: i32,
    missed_heartbeat: bool,
}

/// The node's side of the node↔controller control-plane conversation: one-time
/// registration, the periodic heartbeat loop, directive dispatch onto the
/// local event bus, master-key rotation and orderly shutdown/resync.
pub struct NodeStatusUpdater {
    config: NodeAgentConfig,
    context: Arc<NodeContext>,
    dispatcher: Dispatcher,
    health_checker: Arc<NodeHealthChecker>,
    connector: Arc<dyn TrackerConnector>,
    metrics: Arc<NodeAgentMetrics>,

    tracker: Mutex<Option<Arc<dyn ResourceTracker>>>,
    node_labels_handler: Mutex<Box<dyn NodeLabelsHandler>>,
    recently_stopped: RecentlyStoppedCache,
    keep_alive: KeepAliveTracker,

    // Reported completed containers are saved until a successful heartbeat
    // acknowledges them, then re-sent on every round in between.
    pending_completed_containers: Mutex<HashMap<ContainerId, ContainerStatus>>,
    // Containers the controller asked to remove that are not yet locally done.
    pending_containers_to_remove: Mutex<HashSet<ContainerId>>,
    log_aggregation_temp: Mutex<Vec<crate::data_model::LogAggregationReport>>,

    total_resource: Mutex<Resource>,
    physical_resource: Resource,
    node_manager_version: String,

    rm_identifier: AtomicI64,
    registered: AtomicBool,
    stopped: AtomicBool,
    failed_to_connect: AtomicBool,
    next_heartbeat_interval_ms: AtomicI64,

    heartbeat_monitor: Notify,
    shutdown_monitor: tokio::sync::Mutex<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NodeStatusUpdater {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NodeAgentConfig,
        context: Arc<NodeContext>,
        dispatcher: Dispatcher,
        health_checker: Arc<NodeHealthChecker>,
        connector: Arc<dyn TrackerConnector>,
        node_labels_provider: Option<Arc<dyn NodeLabelsProvider>>,
        resource_plugins: Vec<Arc<dyn ResourcePlugin>>,
        metrics: Arc<NodeAgentMetrics>,
    ) -> Result<Self> {
        config.validate()?;

        let probe = HardwareProbe::new();
        let physical_resource = probe.physical_resource();
        let mut total_resource = Resource::new(
            config.memory_mb.unwrap_or(physical_resource.memory_mb),
            config.vcores.unwrap_or(physical_resource.vcores),
        );
        for plugin in &resource_plugins {
            plugin.update_configured_resource(&mut total_resource);
        }
        let virtual_memory_mb =
            (total_resource.memory_mb as f64 * config.vmem_pmem_ratio as f64).ceil() as u64;
        info!(
            memory_mb = total_resource.memory_mb,
            virtual_memory_mb,
            vcores = total_resource.vcores,
            "node resources initialized"
        );
        metrics.set_total_resource(&total_resource);

        let node_labels_handler = create_node_labels_handler(
            node_labels_provider,
            config.node_labels_resync_interval_ms,
        );

        Ok(Self {
            recently_stopped: RecentlyStoppedCache::new(
                config.duration_to_track_stopped_containers_ms as u64,
            ),
            keep_alive: KeepAliveTracker::new(
                config.token_keep_alive_enabled(),
                config.controller_expiry_interval_ms,
            ),
            next_heartbeat_interval_ms: AtomicI64::new(config.heartbeat_interval_ms as i64),
            node_manager_version: env!("CARGO_PKG_VERSION").to_string(),
            total_resource: Mutex::new(total_resource),
            physical_resource,
            rm_identifier: AtomicI64::new(INVALID_CONTROLLER_IDENTIFIER),
            registered: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            failed_to_connect: AtomicBool::new(false),
            pending_completed_containers: Mutex::new(HashMap::new()),
            pending_containers_to_remove: Mutex::new(HashSet::new()),
            log_aggregation_temp: Mutex::new(Vec::new()),
            node_labels_handler: Mutex::new(node_labels_handler),
            tracker: Mutex::new(None),
            heartbeat_monitor: Notify::new(),
            shutdown_monitor: tokio::sync::Mutex::new(()),
            loop_handle: Mutex::new(None),
            config,
            context,
            dispatcher,
            health_checker,
            connector,
            metrics,
        })
    }

    /// Runs last in the enclosing agent, once the node id is known: connects
    /// the tracker, registers so the containment subsystem gets the per-node
    /// token keys it needs, then starts the heartbeat loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let node_id = self
            .context
            .node_id()
            .ok_or_else(|| anyhow!("node id must be assigned before the status updater starts"))?;
        info!(node_id = %node_id, "node id assigned");

        let tracker = self
            .connector
            .connect()
            .await
            .context("connecting to the controller resource tracker")?;
        *self.tracker.lock().unwrap() = Some(tracker);

        self.register_with_controller()
            .await
            .context("unexpected error starting the node status updater")?;
        self.spawn_heartbeat_loop();
        Ok(())
    }

    pub async fn stop(&self) {
        let _shutdown = self.shutdown_monitor.lock().await;
        // The stopped check avoids multiple unregistrations.
        if self.registered.load(Ordering::SeqCst)
            && !self.stopped.load(Ordering::SeqCst)
            && !self.is_under_supervision_with_recovery_enabled()
            && !self.context.get_decommissioned()
            && !self.failed_to_connect.load(Ordering::SeqCst)
        {
            self.unregister().await;
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.heartbeat_monitor.notify_one();
        // Dropping the handle tears down the transport-owned proxy.
        *self.tracker.lock().unwrap() = None;
        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                error!(error = %error, "heartbeat loop task failed");
            }
        }
    }

    /// Tears down the heartbeat loop, re-registers with the controller and
    /// starts a fresh loop. Driven by whoever observes a `Resync` event.
    pub async fn reboot_and_reregister(self: &Arc<Self>) -> Result<()> {
        let _shutdown = self.shutdown_monitor.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            info!("currently being shut down, aborting reboot");
            return Ok(());
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.send_out_of_band_heartbeat();
        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|error| anyhow!("joining the heartbeat loop: {error}"))?;
        }
        self.register_with_controller()
            .await
            .context("unexpected error rebooting the node status updater")?;
        self.stopped.store(false, Ordering::SeqCst);
        self.spawn_heartbeat_loop();
        info!("heartbeat loop re-registered with the controller and restarted");
        Ok(())
    }

    /// Wakes the heartbeat loop before its interval elapses.
    pub fn send_out_of_band_heartbeat(&self) {
        self.heartbeat_monitor.notify_one();
    }

    /// Records a fatal local exception on the health checker and pushes the
    /// news to the controller without waiting for the next tick.
    pub fn report_exception(&self, error: &anyhow::Error) {
        self.health_checker.report_exception(error);
        self.send_out_of_band_heartbeat();
    }

    pub fn rm_identifier(&self) -> i64 {
        self.rm_identifier.load(Ordering::SeqCst)
    }

    pub fn is_container_recently_stopped(&self, container_id: &ContainerId) -> bool {
        self.recently_stopped.contains(container_id)
    }

    pub fn clear_finished_containers_from_cache(&self) {
        self.recently_stopped.clear();
    }

    /// Remembers a completed container so a late stop request for it does not
    /// read as "no such container".
    pub fn add_completed_container(&self, container_id: &ContainerId) {
        self.remove_very_old_stopped_containers();
        self.recently_stopped.insert(container_id);
    }

    /// Garbage-collects expired recently-stopped entries whose container left
    /// the live map and whose application stopped, tombstoning each in the
    /// state store.
    pub fn remove_very_old_stopped_containers(&self) {
        let context = self.context.clone();
        self.recently_stopped.gc(
            |container_id| {
                !context.containers().contains_key(container_id)
                    && context.is_application_stopped(container_id.application_id())
            },
            |container_id| {
                if let Err(error) = context.state_store().remove_container(container_id) {
                    error!(
                        container_id = %container_id,
                        error = %error,
                        "unable to remove container from the state store"
                    );
                }
            },
        );
    }

    fn is_under_supervision_with_recovery_enabled(&self) -> bool {
        self.config.recovery_enabled && self.config.recovery_supervised
    }

    fn tracker(&self) -> Result<Arc<dyn ResourceTracker>> {
        self.tracker
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("resource tracker is not connected"))
    }

    async fn unregister(&self) {
        let Some(node_id) = self.context.node_id() else {
            return;
        };
        let Ok(tracker) = self.tracker() else {
            return;
        };
        let request = UnRegisterNodeManagerRequest {
            node_id: node_id.clone(),
        };
        match tracker.unregister_node_manager(request).await {
            Ok(()) => {
                info!(node_id = %node_id, "successfully unregistered the node with the controller")
            }
            Err(error) => {
                warn!(node_id = %node_id, error = %error, "unregistration of the node failed")
            }
        }
    }

    pub async fn register_with_controller(&self) -> Result<()> {
        let node_id = self
            .context
            .node_id()
            .ok_or_else(|| anyhow!("node id is not assigned"))?;
        let node_labels = self
            .node_labels_handler
            .lock()
            .unwrap()
            .labels_for_registration();
        let tracker = self.tracker()?;

        // Registration serializes with concurrent container admissions so a
        // container started during registration is either in the report or
        // admitted after the controller's recovery cut.
        let response = {
            let _admission = self.context.admission_lock().lock().await;
            let container_reports = self.container_reports_for_registration();
            let running_applications: Vec<ApplicationId> =
                self.context.applications().keys().cloned().collect();
            info!(
                node_id = %node_id,
                containers = container_reports.len(),
                "registering with the controller"
            );
            let request = RegisterNodeManagerRequest {
                node_id: node_id.clone(),
                http_port: self.context.http_port(),
                total_resource: *self.total_resource.lock().unwrap(),
                node_manager_version: self.node_manager_version.clone(),
                container_reports,
                running_applications,
                node_labels,
                physical_resource: self.physical_resource,
            };
            let response = tracker
                .register_node_manager(request)
                .await
                .map_err(|error| anyhow!(error))
                .context("registering the node with the controller")?;
            // The controller epoch must be readable by other components
            // before admissions resume.
            self.rm_identifier
                .store(response.rm_identifier, Ordering::SeqCst);
            response
        };

        if response.node_action == NodeAction::Shutdown {
            anyhow::bail!(
                "received SHUTDOWN signal from the controller, registration of the node failed: {}",
                response.diagnostics_message.as_deref().unwrap_or("")
            );
        }

        self.check_controller_version(response.controller_version.as_deref())?;
        self.registered.store(true, Ordering::SeqCst);
        self.metrics.set_registered(true);

        // Keys must be in place before the first heartbeat goes out.
        if let Some(key) = response.container_token_master_key.clone() {
            self.context
                .container_token_secret_manager()
                .set_master_key(key);
        }
        if let Some(key) = response.nm_token_master_key.clone() {
            self.context.nm_token_secret_manager().set_master_key(key);
        }

        let mut message = String::new();
        if let Some(resource) = response.resource {
            self.update_total_resource(resource);
            message.push_str(&format!(" with updated total resource of {resource}"));
        } else {
            message.push_str(&format!(
                " with total resource of {}",
                *self.total_resource.lock().unwrap()
            ));
        }
        message.push_str(
            &self
                .node_labels_handler
                .lock()
                .unwrap()
                .verify_registration_ack(&response),
        );
        info!(
            node_id = %node_id,
            rm_identifier = response.rm_identifier,
            "registered with the controller{message}"
        );
        Ok(())
    }

    fn check_controller_version(&self, controller_version: Option<&str>) -> Result<()> {
        let minimum = self.config.minimum_controller_version.as_str();
        if minimum == "NONE" {
            return Ok(());
        }
        let required = if minimum == "EqualToNM" {
            self.node_manager_version.as_str()
        } else {
            minimum
        };
        let Some(controller_version) = controller_version else {
            anyhow::bail!(
                "the controller did not return a version; it cannot be checked against the \
                 minimum allowed version {required}"
            );
        };
        let controller = parse_version(controller_version)
            .with_context(|| format!("unparsable controller version {controller_version:?}"))?;
        let required_parsed = parse_version(required)
            .with_context(|| format!("unparsable minimum controller version {required:?}"))?;
        if controller < required_parsed {
            anyhow::bail!(
                "the controller version ({controller_version}) is less than the minimum allowed \
                 version {required}, shutting down the node"
            );
        }
        Ok(())
    }

    fn update_total_resource(&self, resource: Resource) {
        *self.total_resource.lock().unwrap() = resource;
        self.metrics.set_total_resource(&resource);
        debug!(resource = %resource, "node resource updated");
    }

    /// Container reports for registration. Containers whose application is no
    /// longer known are dropped from the live map instead of being reported.
    fn container_reports_for_registration(&self) -> Vec<ContainerReport> {
        let mut reports = Vec::new();
        let mut completed = Vec::new();
        {
            let mut containers = self.context.containers();
            let mut orphaned = Vec::new();
            for (container_id, container) in containers.iter() {
                if !self
                    .context
                    .applications()
                    .contains_key(container_id.application_id())
                {
                    orphaned.push(container_id.clone());
                    continue;
                }
                let report = container.report();
                if report.state == ContainerState::Complete {
                    completed.push(container_id.clone());
                }
                reports.push(report);
            }
            for container_id in orphaned {
                containers.remove(&container_id);
            }
        }
        // Cache insertion happens outside the container map lock: the cache
        // GC consults that map.
        for container_id in &completed {
            self.add_completed_container(container_id);
        }
        reports
    }

    /// Clones every live container status. Completed containers move to the
    /// pending-completion buffer (and the recently-stopped cache); when their
    /// application is also stopped they leave the live map here.
    fn container_statuses(&self) -> Vec<ContainerStatus> {
        let mut statuses = Vec::new();
        let mut completed = Vec::new();
        {
            let mut containers = self.context.containers();
            let mut pending = self.pending_completed_containers.lock().unwrap();
            let mut remove_from_context = Vec::new();
            for (container_id, container) in containers.iter() {
                let status = container.cloned_status();
                if status.state == ContainerState::Complete {
                    if self
                        .context
                        .is_application_stopped(container_id.application_id())
                    {
                        debug!(
                            container_id = %container_id,
                            "application is completing, removing container from the node context"
                        );
                        remove_from_context.push(container_id.clone());
                        pending.insert(container_id.clone(), status);
                    } else if !self.recently_stopped.contains(container_id) {
                        pending.insert(container_id.clone(), status);
                    }
                    completed.push(container_id.clone());
                } else {
                    statuses.push(status);
                }
            }
            for container_id in remove_from_context {
                containers.remove(&container_id);
            }
            statuses.extend(pending.values().cloned());
        }
        for container_id in &completed {
            self.add_completed_container(container_id);
        }
        debug!(count = statuses.len(), "sending out container statuses");
        statuses
    }

    /// One `NodeStatus` snapshot per heartbeat tick.
    fn node_status(&self, response_id: i32) -> Result<NodeStatus> {
        let node_id = self
            .context
            .node_id()
            .ok_or_else(|| anyhow!("node id is not assigned"))?;
        let health = self.health_checker.status();
        debug!(
            healthy = health.is_node_healthy,
            report = %health.health_report,
            "node health status"
        );
        let container_statuses = self.container_statuses();
        let keep_alive_applications =
            self.keep_alive
                .create_keep_alive_application_list(|application_id| {
                    self.context.applications().contains_key(application_id)
                });
        // Increased containers are drained: read once, reported once.
        let increased_containers: Vec<UpdatedContainer> = self
            .context
            .increased_containers()
            .drain()
            .map(|(_, container)| container)
            .collect();

        Ok(NodeStatusBuilder::default()
            .node_id(node_id)
            .response_id(response_id)
            .container_statuses(container_statuses)
            .keep_alive_applications(keep_alive_applications)
            .health(health)
            .containers_utilization(self.context.containers_utilization())
            .node_utilization(self.context.node_utilization())
            .increased_containers(increased_containers)
            .opportunistic_containers_status(self.context.opportunistic_containers_status())
            .build()?)
    }

    /// Applies `containers_to_be_removed` from a heartbeat response: removes
    /// containers that are locally done, remembers the rest for later rounds,
    /// and drops every named id from the pending-completion buffer.
    fn remove_or_track_completed_containers(&self, container_ids: &[ContainerId]) {
        let mut removed = Vec::new();
        {
            let mut pending_removal = self.pending_containers_to_remove.lock().unwrap();
            pending_removal.extend(container_ids.iter().cloned());
            let mut containers = self.context.containers();
            let mut pending_completed = self.pending_completed_containers.lock().unwrap();
            let candidates: Vec<ContainerId> = pending_removal.drain().collect();
            for container_id in candidates {
                match containers.get(&container_id).map(|c| c.lifecycle()) {
                    None => {}
                    Some(ContainerLifecycle::Done) => {
                        containers.remove(&container_id);
                        removed.push(container_id.clone());
                    }
                    Some(_) => {
                        pending_removal.insert(container_id.clone());
                    }
                }
                pending_completed.remove(&container_id);
            }
        }
        if !removed.is_empty() {
            info!(containers = ?removed, "removed completed containers from the node context");
        }
    }

    fn update_master_keys(&self, response: &NodeHeartbeatResponse) {
        // Non-null only when the key rolled over on the controller.
        if let Some(key) = response.container_token_master_key.clone() {
            self.context
                .container_token_secret_manager()
                .set_master_key(key);
        }
        if let Some(key) = response.nm_token_master_key.clone() {
            self.context.nm_token_secret_manager().set_master_key(key);
        }
    }

    /// Returns true when the response carried a SHUTDOWN or RESYNC directive,
    /// in which case the round's container directives are not applied.
    fn handle_shutdown_or_resync(&self, response: &NodeHeartbeatResponse) -> bool {
        match response.node_action {
            NodeAction::Shutdown => {
                warn!(
                    diagnostics = response.diagnostics_message.as_deref().unwrap_or(""),
                    "received SHUTDOWN signal from the controller in a heartbeat, shutting down"
                );
                self.context.set_decommissioned(true);
                self.dispatcher.dispatch(NodeEvent::Shutdown);
                true
            }
            NodeAction::Resync => {
                warn!(
                    diagnostics = response.diagnostics_message.as_deref().unwrap_or(""),
                    "node is out of sync with the controller, resyncing"
                );
                self.rm_identifier
                    .store(INVALID_CONTROLLER_IDENTIFIER, Ordering::SeqCst);
                self.dispatcher.dispatch(NodeEvent::Resync);
                self.pending_completed_containers.lock().unwrap().clear();
                true
            }
            NodeAction::Normal => false,
        }
    }

    fn update_timeline_collector_data(&self, response: &NodeHeartbeatResponse) {
        if response.app_collectors.is_empty() {
            debug!("no collectors to update from the controller");
            return;
        }
        for (application_id, collector) in &response.app_collectors {
            // Only applications running on this node are tracked.
            if self.context.applications().contains_key(application_id) {
                let accepted = {
                    let mut known = self.context.known_collectors();
                    if crate::data_model::AppCollectorData::happens_before(
                        known.get(application_id),
                        collector,
                    ) {
                        known.insert(application_id.clone(), collector.clone());
                        true
                    } else {
                        false
                    }
                };
                if accepted {
                    debug!(
                        application_id = %application_id,
                        collector_addr = %collector.collector_addr,
                        "synced a new collector address from the controller"
                    );
                    if let Some(publisher) = self.context.timeline_publisher() {
                        publisher
                            .set_timeline_service_address(application_id, &collector.collector_addr);
                    }
                }
            }
            self.context.registering_collectors().remove(application_id);
        }
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>) {
        let updater = self.clone();
        let handle = tokio::spawn(async move { updater.run_heartbeat_loop().await });
        *self.loop_handle.lock().unwrap() = Some(handle);
    }

    async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut state = HeartbeatLoopState {
            last_heartbeat_id: 0,
            missed_heartbeat: false,
        };
        while !self.stopped.load(Ordering::SeqCst) {
            if !self.heartbeat_tick(&mut state).await {
                return;
            }
            let mut interval = self.next_heartbeat_interval_ms.load(Ordering::SeqCst);
            if interval <= 0 {
                interval = self.config.heartbeat_interval_ms as i64;
            }
            tokio::select! {
                _ = sleep(Duration::from_millis(interval as u64)) => {}
                _ = self.heartbeat_monitor.notified() => {}
            }
        }
    }

    /// One loop iteration. Returns false when the loop must terminate
    /// (connect exhaustion); every other failure is a missed round.
    async fn heartbeat_tick(&self, state: &mut HeartbeatLoopState) -> bool {
        match self.heartbeat_once(state).await {
            Ok(()) => true,
            Err(TrackerError::Connect(message)) => {
                error!(
                    error = %message,
                    "failed to connect to the controller, stopping the heartbeat loop"
                );
                self.dispatcher.dispatch(NodeEvent::Shutdown);
                self.failed_to_connect.store(true, Ordering::SeqCst);
                false
            }
            Err(error) => {
                error!(error = %error, "caught exception in the status updater");
                self.metrics.heartbeat_missed();
                state.missed_heartbeat = true;
                true
            }
        }
    }

    async fn heartbeat_once(&self, state: &mut HeartbeatLoopState) -> Result<(), TrackerError> {
        let node_labels = self
            .node_labels_handler
            .lock()
            .unwrap()
            .labels_for_heartbeat();
        let node_status = self.node_status(state.last_heartbeat_id)?;
        let log_aggregation_reports = if self.config.log_aggregation_enabled {
            // Reports accumulate across failed rounds and are only dropped
            // once a successful round carried them.
            let mut temp = self.log_aggregation_temp.lock().unwrap();
            temp.extend(self.context.drain_log_aggregation_reports());
            temp.clone()
        } else {
            Vec::new()
        };
        let request = NodeHeartbeatRequest {
            node_status,
            last_known_container_token_master_key: self
                .context
                .container_token_secret_manager()
                .current_key(),
            last_known_nm_token_master_key: self.context.nm_token_secret_manager().current_key(),
            node_labels,
            registering_collectors: self.context.registering_collectors().clone(),
            log_aggregation_reports,
        };

        let tracker = self.tracker()?;
        let response = tracker.node_heartbeat(request).await?;
        self.metrics.heartbeat_sent();
        self.next_heartbeat_interval_ms
            .store(response.next_heartbeat_interval_ms, Ordering::SeqCst);
        self.update_master_keys(&response);

        if !self.handle_shutdown_or_resync(&response) {
            self.node_labels_handler
                .lock()
                .unwrap()
                .verify_heartbeat_ack(&response);

            // This stays behind the resync check: completed containers must
            // not be removed before a resync, because they are reported back
            // when the node re-registers. Only controller-acked removals go.
            self.remove_or_track_completed_containers(&response.containers_to_be_removed);

            // If the last heartbeat was missed the controller may have seen
            // this one as a duplicate and skipped it, so keep re-sending the
            // pending completions; notifying twice is harmless.
            if !state.missed_heartbeat {
                self.pending_completed_containers.lock().unwrap().clear();
            } else {
                info!("skipped clearing pending completed containers due to missed heartbeat");
                state.missed_heartbeat = false;
            }

            self.log_aggregation_temp.lock().unwrap().clear();
            state.last_heartbeat_id = response.response_id;

            if !response.containers_to_cleanup.is_empty() {
                self.dispatcher.dispatch(NodeEvent::CompletedContainers {
                    containers: response.containers_to_cleanup.clone(),
                    reason: CompletionReason::ByController,
                });
            }
            // Keep-alive tracking starts when the controller finishes an app.
            self.keep_alive
                .track_applications(&response.applications_to_cleanup);
            if !response.applications_to_cleanup.is_empty() {
                self.dispatcher.dispatch(NodeEvent::CompletedApplications {
                    applications: response.applications_to_cleanup.clone(),
                    reason: CompletionReason::ByController,
                });
            }
            if !response.system_credentials.is_empty() {
                self.context
                    .set_system_credentials(response.system_credentials.clone());
            }
            if !response.containers_to_update.is_empty() {
                self.dispatcher.dispatch(NodeEvent::UpdateContainers {
                    containers: response.containers_to_update.clone(),
                });
            }
            if !response.containers_to_signal.is_empty() {
                self.dispatcher.dispatch(NodeEvent::SignalContainers {
                    requests: response.containers_to_signal.clone(),
                });
            }
            if let Some(limit) = response.container_queuing_limit {
                self.context.update_queuing_limit(limit);
            }
        }

        if let Some(resource) = response.resource {
            self.update_total_resource(resource);
        }
        if self.config.timeline_v2_enabled {
            self.update_timeline_collector_data(&response);
        }
        Ok(())
    }
}

/// Lenient semantic-version parse: missing components are padded with zeros
/// and a dash suffix is kept as a prerelease tag.
fn parse_version(version: &str) -> Result<semver::Version> {
    let (core, pre) = match version.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (version, None),
    };
    let mut parts = core.split('.');
    let major = parts.next().filter(|p| !p.is_empty()).unwrap_or("0");
    let minor = parts.next().unwrap_or("0");
    let patch = parts.next().unwrap_or("0");
    let normalized = match pre {
        Some(pre) => format!("{major}.{minor}.{patch}-{pre}"),
        None => format!("{major}.{minor}.{patch}"),
    };
    Ok(semver::Version::parse(&normalized)?)
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::atomic::AtomicUsize, time::Duration};

    use async_trait::async_trait;
    use mock_instant::global::MockClock;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        context::NodeStateStore,
        data_model::{
            test_objects::tests::{
                application_id, completed_container, container_id, running_container,
            },
            AppCollectorData, Application, ApplicationState, ContainerQueuingLimit, Credentials,
            LogAggregationReport, LogAggregationStatus, MasterKey, NodeId, SignalContainerCommand,
            SignalContainerRequest,
        },
        protocol::{RegisterNodeManagerResponse, TrackerResult},
    };

    struct MockTracker {
        register_responses: Mutex<VecDeque<TrackerResult<RegisterNodeManagerResponse>>>,
        heartbeat_responses: Mutex<VecDeque<TrackerResult<NodeHeartbeatResponse>>>,
        register_requests: Mutex<Vec<RegisterNodeManagerRequest>>,
        heartbeat_requests: Mutex<Vec<NodeHeartbeatRequest>>,
        unregister_calls: AtomicUsize,
        fallback_interval_ms: i64,
    }

    impl MockTracker {
        fn new() -> Arc<Self> {
            Self::with_fallback_interval(10)
        }

        fn with_fallback_interval(fallback_interval_ms: i64) -> Arc<Self> {
            Arc::new(Self {
                register_responses: Mutex::new(VecDeque::new()),
                heartbeat_responses: Mutex::new(VecDeque::new()),
                register_requests: Mutex::new(Vec::new()),
                heartbeat_requests: Mutex::new(Vec::new()),
                unregister_calls: AtomicUsize::new(0),
                fallback_interval_ms,
            })
        }

        fn script_register(&self, response: TrackerResult<RegisterNodeManagerResponse>) {
            self.register_responses.lock().unwrap().push_back(response);
        }

        fn script_heartbeat(&self, response: TrackerResult<NodeHeartbeatResponse>) {
            self.heartbeat_responses.lock().unwrap().push_back(response);
        }

        fn register_count(&self) -> usize {
            self.register_requests.lock().unwrap().len()
        }

        fn heartbeat_count(&self) -> usize {
            self.heartbeat_requests.lock().unwrap().len()
        }

        fn heartbeat_request(&self, index: usize) -> NodeHeartbeatRequest {
            self.heartbeat_requests.lock().unwrap()[index].clone()
        }

        fn unregister_count(&self) -> usize {
            self.unregister_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceTracker for MockTracker {
        async fn register_node_manager(
            &self,
            request: RegisterNodeManagerRequest,
        ) -> TrackerResult<RegisterNodeManagerResponse> {
            self.register_requests.lock().unwrap().push(request);
            match self.register_responses.lock().unwrap().pop_front() {
                Some(response) => response,
                None => Ok(RegisterNodeManagerResponse {
                    rm_identifier: 1,
                    ..Default::default()
                }),
            }
        }

        async fn node_heartbeat(
            &self,
            request: NodeHeartbeatRequest,
        ) -> TrackerResult<NodeHeartbeatResponse> {
            let acked_id = request.node_status.response_id + 1;
            self.heartbeat_requests.lock().unwrap().push(request);
            match self.heartbeat_responses.lock().unwrap().pop_front() {
                Some(response) => response,
                None => Ok(NodeHeartbeatResponse {
                    response_id: acked_id,
                    next_heartbeat_interval_ms: self.fallback_interval_ms,
                    ..Default::default()
                }),
            }
        }

        async fn unregister_node_manager(
            &self,
            _request: UnRegisterNodeManagerRequest,
        ) -> TrackerResult<()> {
            self.unregister_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockConnector(Arc<MockTracker>);

    #[async_trait]
    impl TrackerConnector for MockConnector {
        async fn connect(&self) -> Result<Arc<dyn ResourceTracker>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingStateStore {
        removed: Mutex<Vec<ContainerId>>,
    }

    impl NodeStateStore for RecordingStateStore {
        fn remove_container(&self, container_id: &ContainerId) -> Result<()> {
            self.removed.lock().unwrap().push(container_id.clone());
            Ok(())
        }
    }

    struct Harness {
        updater: Arc<NodeStatusUpdater>,
        context: Arc<NodeContext>,
        tracker: Arc<MockTracker>,
        events: mpsc::UnboundedReceiver<NodeEvent>,
        state_store: Arc<RecordingStateStore>,
    }

    fn test_config() -> NodeAgentConfig {
        NodeAgentConfig {
            memory_mb: Some(4096),
            vcores: Some(4),
            heartbeat_interval_ms: 10,
            ..Default::default()
        }
    }

    fn harness(config: NodeAgentConfig) -> Harness {
        harness_with_tracker(config, MockTracker::new())
    }

    fn harness_with_tracker(config: NodeAgentConfig, tracker: Arc<MockTracker>) -> Harness {
        let state_store = Arc::new(RecordingStateStore::default());
        let context = Arc::new(NodeContext::new(state_store.clone(), None));
        context.set_node_id(NodeId::new("worker-1", 4545), 8042);
        let (dispatcher, events) = Dispatcher::new();
        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Arc::new(NodeAgentMetrics::new(&mut registry));
        let updater = Arc::new(
            NodeStatusUpdater::new(
                config,
                context.clone(),
                dispatcher,
                Arc::new(NodeHealthChecker::new()),
                Arc::new(MockConnector(tracker.clone())),
                None,
                Vec::new(),
                metrics,
            )
            .unwrap(),
        );
        // Most tests drive registration and ticks directly instead of going
        // through start(), so wire the tracker up front.
        *updater.tracker.lock().unwrap() = Some(tracker.clone() as Arc<dyn ResourceTracker>);
        Harness {
            updater,
            context,
            tracker,
            events,
            state_store,
        }
    }

    fn loop_state() -> HeartbeatLoopState {
        HeartbeatLoopState {
            last_heartbeat_id: 0,
            missed_heartbeat: false,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_registration_applies_controller_directives() {
        let h = harness(test_config());
        h.tracker.script_register(Ok(RegisterNodeManagerResponse {
            rm_identifier: 42,
            resource: Some(Resource::new(8192, 4)),
            container_token_master_key: Some(MasterKey::new(1, vec![1])),
            nm_token_master_key: Some(MasterKey::new(2, vec![2])),
            ..Default::default()
        }));
        h.updater.register_with_controller().await.unwrap();

        assert_eq!(h.updater.rm_identifier(), 42);
        assert_eq!(
            *h.updater.total_resource.lock().unwrap(),
            Resource::new(8192, 4)
        );
        assert!(h.updater.registered.load(Ordering::SeqCst));
        assert_eq!(
            h.context
                .container_token_secret_manager()
                .current_key()
                .unwrap()
                .key_id,
            1
        );
        assert_eq!(
            h.context
                .nm_token_secret_manager()
                .current_key()
                .unwrap()
                .key_id,
            2
        );
    }

    #[tokio::test]
    async fn test_shutdown_directive_at_registration_is_fatal() {
        let h = harness(test_config());
        h.tracker.script_register(Ok(RegisterNodeManagerResponse {
            node_action: NodeAction::Shutdown,
            diagnostics_message: Some("bye".to_string()),
            ..Default::default()
        }));
        let error = h.updater.register_with_controller().await.unwrap_err();
        assert!(error.to_string().contains("SHUTDOWN"));
        assert!(!h.updater.registered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_minimum_controller_version_gate() {
        // Controller older than an explicit minimum.
        let h = harness(NodeAgentConfig {
            minimum_controller_version: "99.0.0".to_string(),
            ..test_config()
        });
        h.tracker.script_register(Ok(RegisterNodeManagerResponse {
            controller_version: Some("3.4.0".to_string()),
            ..Default::default()
        }));
        assert!(h.updater.register_with_controller().await.is_err());

        // EqualToNM accepts a controller at this agent's own version.
        let h = harness(NodeAgentConfig {
            minimum_controller_version: "EqualToNM".to_string(),
            ..test_config()
        });
        h.tracker.script_register(Ok(RegisterNodeManagerResponse {
            controller_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            ..Default::default()
        }));
        assert!(h.updater.register_with_controller().await.is_ok());

        // A controller that does not report a version cannot be checked.
        let h = harness(NodeAgentConfig {
            minimum_controller_version: "1.0".to_string(),
            ..test_config()
        });
        h.tracker
            .script_register(Ok(RegisterNodeManagerResponse::default()));
        assert!(h.updater.register_with_controller().await.is_err());

        // NONE disables the gate entirely.
        let h = harness(test_config());
        h.tracker
            .script_register(Ok(RegisterNodeManagerResponse::default()));
        assert!(h.updater.register_with_controller().await.is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_happy_path() {
        let mut h = harness(test_config());
        h.updater.register_with_controller().await.unwrap();

        let c1 = container_id("app-1", 1, 1);
        h.tracker.script_heartbeat(Ok(NodeHeartbeatResponse {
            response_id: 1,
            next_heartbeat_interval_ms: 1000,
            containers_to_cleanup: vec![c1.clone()],
            ..Default::default()
        }));
        let mut state = loop_state();
        assert!(h.updater.heartbeat_tick(&mut state).await);

        assert_eq!(state.last_heartbeat_id, 1);
        assert_eq!(
            h.updater.next_heartbeat_interval_ms.load(Ordering::SeqCst),
            1000
        );
        assert_eq!(
            h.events.try_recv().unwrap(),
            NodeEvent::CompletedContainers {
                containers: vec![c1],
                reason: CompletionReason::ByController,
            }
        );
    }

    #[tokio::test]
    async fn test_completed_containers_survive_a_missed_heartbeat() {
        let h = harness(test_config());
        h.updater.register_with_controller().await.unwrap();

        let app = application_id("app-7");
        let c7 = container_id("app-7", 1, 7);
        h.context.applications().insert(
            app.clone(),
            Application::new(app.clone(), ApplicationState::Running),
        );
        h.context
            .containers()
            .insert(c7.clone(), completed_container(&c7, 0));

        h.tracker
            .script_heartbeat(Err(TrackerError::Other(anyhow!("heartbeat lost"))));
        let mut state = loop_state();
        assert!(h.updater.heartbeat_tick(&mut state).await);
        assert!(state.missed_heartbeat);
        assert_eq!(state.last_heartbeat_id, 0);

        let carries_c7 = |request: &NodeHeartbeatRequest| {
            request
                .node_status
                .container_statuses
                .iter()
                .any(|status| status.container_id == c7)
        };
        assert!(carries_c7(&h.tracker.heartbeat_request(0)));

        // The next round succeeds but the controller may have dropped the
        // missed one as a duplicate, so the completion is retained and
        // re-sent once more before the buffer empties.
        assert!(h.updater.heartbeat_tick(&mut state).await);
        assert!(!state.missed_heartbeat);
        let second = h.tracker.heartbeat_request(1);
        assert!(carries_c7(&second));
        assert_eq!(second.node_status.response_id, 0);
        assert!(!h
            .updater
            .pending_completed_containers
            .lock()
            .unwrap()
            .is_empty());

        assert!(h.updater.heartbeat_tick(&mut state).await);
        assert!(carries_c7(&h.tracker.heartbeat_request(2)));
        assert_eq!(h.tracker.heartbeat_request(2).node_status.response_id, 1);
        assert!(h
            .updater
            .pending_completed_containers
            .lock()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_directive_in_heartbeat() {
        let mut h = harness(test_config());
        h.updater.register_with_controller().await.unwrap();

        let c9 = container_id("app-9", 1, 1);
        h.updater
            .pending_completed_containers
            .lock()
            .unwrap()
            .insert(c9.clone(), completed_container(&c9, 0).cloned_status());

        h.tracker.script_heartbeat(Ok(NodeHeartbeatResponse {
            node_action: NodeAction::Shutdown,
            diagnostics_message: Some("bye".to_string()),
            ..Default::default()
        }));
        let mut state = loop_state();
        assert!(h.updater.heartbeat_tick(&mut state).await);

        assert!(h.context.get_decommissioned());
        assert_eq!(h.events.try_recv().unwrap(), NodeEvent::Shutdown);
        assert_eq!(state.last_heartbeat_id, 0);
        // The response is consumed without touching the pending buffer.
        assert!(!h
            .updater
            .pending_completed_containers
            .lock()
            .unwrap()
            .is_empty());

        // A decommissioned node skips the farewell unregister.
        h.updater.stop().await;
        assert_eq!(h.tracker.unregister_count(), 0);
    }

    #[tokio::test]
    async fn test_resync_directive_in_heartbeat() {
        let mut h = harness(test_config());
        h.tracker.script_register(Ok(RegisterNodeManagerResponse {
            rm_identifier: 42,
            ..Default::default()
        }));
        h.updater.register_with_controller().await.unwrap();
        assert_eq!(h.updater.rm_identifier(), 42);

        let c9 = container_id("app-9", 1, 1);
        h.updater
            .pending_completed_containers
            .lock()
            .unwrap()
            .insert(c9.clone(), completed_container(&c9, 0).cloned_status());

        h.tracker.script_heartbeat(Ok(NodeHeartbeatResponse {
            node_action: NodeAction::Resync,
            ..Default::default()
        }));
        let mut state = loop_state();
        assert!(h.updater.heartbeat_tick(&mut state).await);

        assert_eq!(h.updater.rm_identifier(), INVALID_CONTROLLER_IDENTIFIER);
        assert_eq!(h.events.try_recv().unwrap(), NodeEvent::Resync);
        assert!(h
            .updater
            .pending_completed_containers
            .lock()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_master_key_rotation() {
        let h = harness(test_config());
        h.updater.register_with_controller().await.unwrap();
        assert!(h
            .context
            .container_token_secret_manager()
            .current_key()
            .is_none());

        h.tracker.script_heartbeat(Ok(NodeHeartbeatResponse {
            response_id: 1,
            container_token_master_key: Some(MasterKey::new(7, vec![7])),
            ..Default::default()
        }));
        let mut state = loop_state();
        assert!(h.updater.heartbeat_tick(&mut state).await);

        assert_eq!(
            h.context
                .container_token_secret_manager()
                .current_key()
                .unwrap()
                .key_id,
            7
        );
        assert!(h.context.nm_token_secret_manager().current_key().is_none());
    }

    #[tokio::test]
    async fn test_connect_exhaustion_stops_the_loop() {
        let mut h = harness(test_config());
        h.updater.register_with_controller().await.unwrap();

        h.tracker
            .script_heartbeat(Err(TrackerError::Connect("max retries".to_string())));
        let mut state = loop_state();
        assert!(!h.updater.heartbeat_tick(&mut state).await);

        assert!(h.updater.failed_to_connect.load(Ordering::SeqCst));
        assert_eq!(h.events.try_recv().unwrap(), NodeEvent::Shutdown);

        // Liveness is lost; the farewell unregister is suppressed.
        h.updater.stop().await;
        assert_eq!(h.tracker.unregister_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_unregisters_exactly_once() {
        let h = harness(test_config());
        h.updater.register_with_controller().await.unwrap();
        h.updater.stop().await;
        h.updater.stop().await;
        assert_eq!(h.tracker.unregister_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_skips_unregister_under_supervised_recovery() {
        let h = harness(NodeAgentConfig {
            recovery_enabled: true,
            recovery_supervised: true,
            ..test_config()
        });
        h.updater.register_with_controller().await.unwrap();
        h.updater.stop().await;
        assert_eq!(h.tracker.unregister_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_registration_skips_unregister() {
        let h = harness(test_config());
        h.updater.stop().await;
        assert_eq!(h.tracker.unregister_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_or_track_completed_containers() {
        let h = harness(test_config());
        let done = container_id("app-1", 1, 1);
        let live = container_id("app-1", 1, 2);
        h.context
            .containers()
            .insert(done.clone(), completed_container(&done, 0));
        h.context
            .containers()
            .insert(live.clone(), running_container(&live));
        h.updater
            .pending_completed_containers
            .lock()
            .unwrap()
            .insert(done.clone(), completed_container(&done, 0).cloned_status());

        h.updater
            .remove_or_track_completed_containers(&[done.clone(), live.clone()]);

        assert!(!h.context.containers().contains_key(&done));
        assert!(h.context.containers().contains_key(&live));
        assert!(h
            .updater
            .pending_completed_containers
            .lock()
            .unwrap()
            .is_empty());
        assert!(h
            .updater
            .pending_containers_to_remove
            .lock()
            .unwrap()
            .contains(&live));

        // The tracked id is retried once the container is locally done.
        h.context
            .containers()
            .get_mut(&live)
            .unwrap()
            .mark_done(0, "done");
        h.updater.remove_or_track_completed_containers(&[]);
        assert!(!h.context.containers().contains_key(&live));
        assert!(h
            .updater
            .pending_containers_to_remove
            .lock()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_status_collector_moves_completions_to_pending() {
        let h = harness(test_config());
        let app_running = application_id("app-run");
        let app_done = application_id("app-done");
        h.context.applications().insert(
            app_running.clone(),
            Application::new(app_running.clone(), ApplicationState::Running),
        );
        h.context.applications().insert(
            app_done.clone(),
            Application::new(app_done.clone(), ApplicationState::FinishingContainersWait),
        );

        let c_live = container_id("app-run", 1, 1);
        let c_done_running_app = container_id("app-run", 1, 2);
        let c_done_stopped_app = container_id("app-done", 1, 1);
        h.context
            .containers()
            .insert(c_live.clone(), running_container(&c_live));
        h.context.containers().insert(
            c_done_running_app.clone(),
            completed_container(&c_done_running_app, 0),
        );
        h.context.containers().insert(
            c_done_stopped_app.clone(),
            completed_container(&c_done_stopped_app, 1),
        );

        let statuses = h.updater.container_statuses();
        assert_eq!(statuses.len(), 3);

        // The container of the stopped application left the live map; the
        // other completed one stays until the controller acks its removal.
        assert!(!h.context.containers().contains_key(&c_done_stopped_app));
        assert!(h.context.containers().contains_key(&c_done_running_app));
        assert!(h.updater.is_container_recently_stopped(&c_done_running_app));
        assert!(h.updater.is_container_recently_stopped(&c_done_stopped_app));

        let pending = h.updater.pending_completed_containers.lock().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.contains_key(&c_done_running_app));
        assert!(pending.contains_key(&c_done_stopped_app));
    }

    #[tokio::test]
    async fn test_registration_reports_prune_orphaned_containers() {
        let h = harness(test_config());
        let app = application_id("app-1");
        h.context.applications().insert(
            app.clone(),
            Application::new(app.clone(), ApplicationState::Running),
        );
        let kept = container_id("app-1", 1, 1);
        let orphan = container_id("app-ghost", 1, 1);
        h.context
            .containers()
            .insert(kept.clone(), running_container(&kept));
        h.context
            .containers()
            .insert(orphan.clone(), running_container(&orphan));

        let reports = h.updater.container_reports_for_registration();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].container_id, kept);
        assert!(!h.context.containers().contains_key(&orphan));
    }

    #[tokio::test]
    async fn test_recently_stopped_gc_tombstones_the_state_store() {
        let h = harness(NodeAgentConfig {
            duration_to_track_stopped_containers_ms: 1_000,
            ..test_config()
        });
        let c1 = container_id("app-gone", 1, 1);
        h.updater.add_completed_container(&c1);
        assert!(h.updater.is_container_recently_stopped(&c1));

        MockClock::advance_system_time(Duration::from_millis(2_000));
        h.updater.remove_very_old_stopped_containers();

        assert!(!h.updater.is_container_recently_stopped(&c1));
        assert_eq!(*h.state_store.removed.lock().unwrap(), vec![c1]);
    }

    #[tokio::test]
    async fn test_log_aggregation_reports_survive_failed_rounds() {
        let h = harness(NodeAgentConfig {
            log_aggregation_enabled: true,
            ..test_config()
        });
        h.updater.register_with_controller().await.unwrap();
        h.context.push_log_aggregation_report(LogAggregationReport {
            application_id: application_id("app-1"),
            status: LogAggregationStatus::Succeeded,
            diagnostics: String::new(),
        });

        h.tracker
            .script_heartbeat(Err(TrackerError::Other(anyhow!("heartbeat lost"))));
        let mut state = loop_state();
        assert!(h.updater.heartbeat_tick(&mut state).await);
        assert!(h.updater.heartbeat_tick(&mut state).await);
        assert_eq!(h.tracker.heartbeat_request(0).log_aggregation_reports.len(), 1);
        assert_eq!(h.tracker.heartbeat_request(1).log_aggregation_reports.len(), 1);

        // Dropped after the round that carried them succeeded.
        assert!(h.updater.heartbeat_tick(&mut state).await);
        assert!(h
            .tracker
            .heartbeat_request(2)
            .log_aggregation_reports
            .is_empty());
    }

    #[tokio::test]
    async fn test_increased_containers_are_drained() {
        let h = harness(test_config());
        let c1 = container_id("app-1", 1, 1);
        h.context.increased_containers().insert(
            c1.clone(),
            UpdatedContainer {
                container_id: c1.clone(),
                capability: Resource::new(2048, 2),
            },
        );

        let status = h.updater.node_status(0).unwrap();
        assert_eq!(status.increased_containers.len(), 1);
        assert!(h.context.increased_containers().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_dispatches_controller_directives() {
        let mut h = harness(test_config());
        h.updater.register_with_controller().await.unwrap();

        let app = application_id("app-1");
        let c1 = container_id("app-1", 1, 1);
        let updated = UpdatedContainer {
            container_id: c1.clone(),
            capability: Resource::new(2048, 2),
        };
        let signal = SignalContainerRequest {
            container_id: c1.clone(),
            command: SignalContainerCommand::GracefulShutdown,
        };
        let mut system_credentials = HashMap::new();
        system_credentials.insert(app.clone(), Credentials::from_bytes(vec![1, 2, 3]));
        h.tracker.script_heartbeat(Ok(NodeHeartbeatResponse {
            response_id: 1,
            applications_to_cleanup: vec![app.clone()],
            containers_to_update: vec![updated.clone()],
            containers_to_signal: vec![signal.clone()],
            system_credentials,
            container_queuing_limit: Some(ContainerQueuingLimit {
                max_queue_length: 5,
                max_queue_wait_time_ms: 100,
            }),
            ..Default::default()
        }));

        let mut state = loop_state();
        assert!(h.updater.heartbeat_tick(&mut state).await);

        assert_eq!(
            h.events.try_recv().unwrap(),
            NodeEvent::CompletedApplications {
                applications: vec![app.clone()],
                reason: CompletionReason::ByController,
            }
        );
        assert_eq!(
            h.events.try_recv().unwrap(),
            NodeEvent::UpdateContainers {
                containers: vec![updated],
            }
        );
        assert_eq!(
            h.events.try_recv().unwrap(),
            NodeEvent::SignalContainers {
                requests: vec![signal],
            }
        );
        assert_eq!(
            h.context.system_credentials(&app).unwrap(),
            Credentials::from_bytes(vec![1, 2, 3])
        );
        assert_eq!(h.context.queuing_limit().unwrap().max_queue_length, 5);
    }

    #[tokio::test]
    async fn test_timeline_collectors_merge_with_happens_before() {
        let h = harness(NodeAgentConfig {
            timeline_v2_enabled: true,
            ..test_config()
        });
        h.updater.register_with_controller().await.unwrap();

        let app = application_id("app-1");
        h.context.applications().insert(
            app.clone(),
            Application::new(app.clone(), ApplicationState::Running),
        );
        h.context.known_collectors().insert(
            app.clone(),
            AppCollectorData::new("host-old:1000", 2, 5),
        );
        h.context.registering_collectors().insert(
            app.clone(),
            AppCollectorData::new("host-old:1000", 2, 5),
        );

        // An older stamp is ignored, but the app still leaves the
        // registering set.
        let mut app_collectors = HashMap::new();
        app_collectors.insert(app.clone(), AppCollectorData::new("host-stale:1000", 2, 4));
        h.tracker.script_heartbeat(Ok(NodeHeartbeatResponse {
            response_id: 1,
            app_collectors,
            ..Default::default()
        }));
        let mut state = loop_state();
        assert!(h.updater.heartbeat_tick(&mut state).await);
        assert_eq!(
            h.context.known_collectors().get(&app).unwrap().collector_addr,
            "host-old:1000"
        );
        assert!(h.context.registering_collectors().is_empty());

        // A newer stamp replaces the known collector.
        let mut app_collectors = HashMap::new();
        app_collectors.insert(app.clone(), AppCollectorData::new("host-new:1000", 2, 6));
        h.tracker.script_heartbeat(Ok(NodeHeartbeatResponse {
            response_id: 2,
            app_collectors,
            ..Default::default()
        }));
        assert!(h.updater.heartbeat_tick(&mut state).await);
        assert_eq!(
            h.context.known_collectors().get(&app).unwrap().collector_addr,
            "host-new:1000"
        );
    }

    #[tokio::test]
    async fn test_out_of_band_heartbeat_wakes_the_loop() {
        let tracker = MockTracker::with_fallback_interval(60_000);
        let h = harness_with_tracker(
            NodeAgentConfig {
                heartbeat_interval_ms: 60_000,
                ..test_config()
            },
            tracker,
        );
        h.updater.start().await.unwrap();
        wait_until(|| h.tracker.heartbeat_count() >= 1).await;

        h.updater.send_out_of_band_heartbeat();
        wait_until(|| h.tracker.heartbeat_count() >= 2).await;

        h.updater.stop().await;
    }

    #[tokio::test]
    async fn test_reboot_reregisters_and_restarts_the_loop() {
        let h = harness(test_config());
        h.updater.start().await.unwrap();
        wait_until(|| h.tracker.heartbeat_count() >= 1).await;

        h.updater.reboot_and_reregister().await.unwrap();
        assert_eq!(h.tracker.register_count(), 2);

        let heartbeats_before = h.tracker.heartbeat_count();
        wait_until(|| h.tracker.heartbeat_count() > heartbeats_before).await;

        h.updater.stop().await;
    }

    #[tokio::test]
    async fn test_report_exception_marks_the_node_unhealthy() {
        let h = harness(test_config());
        h.updater
            .report_exception(&anyhow!("health script went away"));
        let status = h.updater.node_status(0).unwrap();
        assert!(!status.health.is_node_healthy);
        assert!(status.health.health_report.contains("health script"));
    }
}
