use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::data_model::{
    AppCollectorData, ApplicationId, ContainerId, ContainerQueuingLimit, ContainerReport,
    LogAggregationReport, MasterKey, NodeId, NodeLabel, NodeStatus, Resource,
    SignalContainerRequest, SystemCredentials, UpdatedContainer,
};

/// Controller epoch value before a successful registration, and after a
/// RESYNC directive invalidates the current one.
pub const INVALID_CONTROLLER_IDENTIFIER: i64 = -1;

/// Directive attached to registration and heartbeat responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NodeAction {
    #[default]
    Normal,
    Shutdown,
    Resync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeManagerRequest {
    pub node_id: NodeId,
    pub http_port: u16,
    pub total_resource: Resource,
    pub node_manager_version: String,
    pub container_reports: Vec<ContainerReport>,
    pub running_applications: Vec<ApplicationId>,
    pub node_labels: Option<HashSet<NodeLabel>>,
    pub physical_resource: Resource,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegisterNodeManagerResponse {
    pub rm_identifier: i64,
    pub node_action: NodeAction,
    pub diagnostics_message: Option<String>,
    pub controller_version: Option<String>,
    pub container_token_master_key: Option<MasterKey>,
    pub nm_token_master_key: Option<MasterKey>,
    pub resource: Option<Resource>,
    pub are_node_labels_accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeartbeatRequest {
    pub node_status: NodeStatus,
    pub last_known_container_token_master_key: Option<MasterKey>,
    pub last_known_nm_token_master_key: Option<MasterKey>,
    pub node_labels: Option<HashSet<NodeLabel>>,
    pub registering_collectors: HashMap<ApplicationId, AppCollectorData>,
    pub log_aggregation_reports: Vec<LogAggregationReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeHeartbeatResponse {
    pub response_id: i32,
    pub node_action: NodeAction,
    pub diagnostics_message: Option<String>,
    pub next_heartbeat_interval_ms: i64,
    pub container_token_master_key: Option<MasterKey>,
    pub nm_token_master_key: Option<MasterKey>,
    pub containers_to_cleanup: Vec<ContainerId>,
    pub applications_to_cleanup: Vec<ApplicationId>,
    pub containers_to_be_removed: Vec<ContainerId>,
    pub containers_to_update: Vec<UpdatedContainer>,
    pub containers_to_signal: Vec<SignalContainerRequest>,
    pub system_credentials: SystemCredentials,
    pub resource: Option<Resource>,
    pub app_collectors: HashMap<ApplicationId, AppCollectorData>,
    pub container_queuing_limit: Option<ContainerQueuingLimit>,
    pub are_node_labels_accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnRegisterNodeManagerRequest {
    pub node_id: NodeId,
}

/// Errors surfaced by a [`ResourceTracker`] implementation. `Connect` means
/// the transport exhausted its retry budget reaching the controller; the
/// heartbeat loop treats it as fatal liveness loss, everything else as a
/// missed round.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("connection to controller lost: {0}")]
    Connect(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// The controller-side resource tracker capability. Implementations own the
/// transport, its authentication handshake and its retry policy.
#[async_trait]
pub trait ResourceTracker: Send + Sync {
    async fn register_node_manager(
        &self,
        request: RegisterNodeManagerRequest,
    ) -> TrackerResult<RegisterNodeManagerResponse>;

    async fn node_heartbeat(
        &self,
        request: NodeHeartbeatRequest,
    ) -> TrackerResult<NodeHeartbeatResponse>;

    async fn unregister_node_manager(
        &self,
        request: UnRegisterNodeManagerRequest,
    ) -> TrackerResult<()>;
}

/// Creates a connected [`ResourceTracker`] when the updater starts.
#[async_trait]
pub trait TrackerConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn ResourceTracker>>;
}
