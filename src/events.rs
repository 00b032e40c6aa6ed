use tokio::sync::mpsc;
use tracing::error;

use crate::data_model::{
    ApplicationId, ContainerId, SignalContainerRequest, UpdatedContainer,
};

/// Why containers or applications are being torn down locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CompletionReason {
    ByController,
}

/// Typed events the status updater emits onto the node agent's local bus.
#[derive(Debug, Clone, PartialEq, strum::Display)]
pub enum NodeEvent {
    CompletedContainers {
        containers: Vec<ContainerId>,
        reason: CompletionReason,
    },
    CompletedApplications {
        applications: Vec<ApplicationId>,
        reason: CompletionReason,
    },
    UpdateContainers {
        containers: Vec<UpdatedContainer>,
    },
    SignalContainers {
        requests: Vec<SignalContainerRequest>,
    },
    Shutdown,
    Resync,
}

/// Thin adapter from heartbeat-response fields onto the local event bus. It
/// carries no state besides the sending half of the channel.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl Dispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn dispatch(&self, event: NodeEvent) {
        if let Err(err) = self.tx.send(event) {
            error!(event = %err.0, "event bus receiver dropped, event lost");
        }
    }
}
