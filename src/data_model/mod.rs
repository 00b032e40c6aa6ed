pub mod test_objects;

use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Stable identifier of this node, assigned once by the enclosing agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId {
    host: String,
    port: u16,
}

impl NodeId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApplicationId(String);

impl ApplicationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApplicationAttemptId {
    application_id: ApplicationId,
    attempt: u32,
}

impl ApplicationAttemptId {
    pub fn new(application_id: ApplicationId, attempt: u32) -> Self {
        Self {
            application_id,
            attempt,
        }
    }

    pub fn application_id(&self) -> &ApplicationId {
        &self.application_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Display for ApplicationAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "appattempt_{}_{:06}", self.application_id, self.attempt)
    }
}

/// Container identifier, ordered by application attempt then sequence number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId {
    application_attempt_id: ApplicationAttemptId,
    sequence: u64,
}

impl ContainerId {
    pub fn new(application_attempt_id: ApplicationAttemptId, sequence: u64) -> Self {
        Self {
            application_attempt_id,
            sequence,
        }
    }

    pub fn application_attempt_id(&self) -> &ApplicationAttemptId {
        &self.application_attempt_id
    }

    pub fn application_id(&self) -> &ApplicationId {
        self.application_attempt_id.application_id()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "container_{}_{:06}",
            self.application_attempt_id, self.sequence
        )
    }
}

/// Schedulable capacity of a node or container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Resource {
    pub memory_mb: u64,
    pub vcores: u32,
}

impl Resource {
    pub fn new(memory_mb: u64, vcores: u32) -> Self {
        Self { memory_mb, vcores }
    }
}

impl Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<memory:{} MiB, vCores:{}>", self.memory_mb, self.vcores)
    }
}

/// Container state as reported to the controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ContainerState {
    New,
    Running,
    Complete,
}

/// Local lifecycle of a container inside the containment subsystem. `Done`
/// means all container resources have been released on this node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContainerLifecycle {
    New,
    Running,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub state: ContainerState,
    pub exit_code: i32,
    pub diagnostics: String,
    pub capability: Resource,
}

/// Per-container report sent once at registration so the controller can
/// recover containers that survived a node agent restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerReport {
    pub container_id: ContainerId,
    pub state: ContainerState,
    pub exit_code: i32,
    pub diagnostics: String,
    pub capability: Resource,
}

/// Entry of the live container map. The map itself is owned by the containment
/// subsystem; the status updater only reads entries and removes completed ones.
#[derive(Debug, Clone)]
pub struct Container {
    container_id: ContainerId,
    lifecycle: ContainerLifecycle,
    exit_code: i32,
    diagnostics: String,
    capability: Resource,
}

impl Container {
    pub fn new(container_id: ContainerId, capability: Resource) -> Self {
        Self {
            container_id,
            lifecycle: ContainerLifecycle::Running,
            exit_code: 0,
            diagnostics: String::new(),
            capability,
        }
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    pub fn lifecycle(&self) -> ContainerLifecycle {
        self.lifecycle
    }

    pub fn mark_done(&mut self, exit_code: i32, diagnostics: impl Into<String>) {
        self.lifecycle = ContainerLifecycle::Done;
        self.exit_code = exit_code;
        self.diagnostics = diagnostics.into();
    }

    pub fn cloned_status(&self) -> ContainerStatus {
        ContainerStatus {
            container_id: self.container_id.clone(),
            state: self.reported_state(),
            exit_code: self.exit_code,
            diagnostics: self.diagnostics.clone(),
            capability: self.capability,
        }
    }

    pub fn report(&self) -> ContainerReport {
        ContainerReport {
            container_id: self.container_id.clone(),
            state: self.reported_state(),
            exit_code: self.exit_code,
            diagnostics: self.diagnostics.clone(),
            capability: self.capability,
        }
    }

    fn reported_state(&self) -> ContainerState {
        match self.lifecycle {
            ContainerLifecycle::New => ContainerState::New,
            ContainerLifecycle::Running => ContainerState::Running,
            ContainerLifecycle::Done => ContainerState::Complete,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApplicationState {
    New,
    Initing,
    Running,
    FinishingContainersWait,
    ApplicationResourcesCleaningup,
    Finished,
}

impl ApplicationState {
    /// Terminal phases in which the application no longer accepts containers.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            ApplicationState::FinishingContainersWait
                | ApplicationState::ApplicationResourcesCleaningup
                | ApplicationState::Finished
        )
    }
}

#[derive(Debug, Clone)]
pub struct Application {
    application_id: ApplicationId,
    state: ApplicationState,
}

impl Application {
    pub fn new(application_id: ApplicationId, state: ApplicationState) -> Self {
        Self {
            application_id,
            state,
        }
    }

    pub fn application_id(&self) -> &ApplicationId {
        &self.application_id
    }

    pub fn state(&self) -> ApplicationState {
        self.state
    }

    pub fn set_state(&mut self, state: ApplicationState) {
        self.state = state;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeHealthStatus {
    pub is_node_healthy: bool,
    pub health_report: String,
    pub last_health_report_time_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceUtilization {
    pub physical_memory_mb: u64,
    pub virtual_memory_mb: u64,
    pub cpu_usage: f32,
}

/// Rolling shared-secret key used to mint and validate security tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MasterKey {
    pub key_id: i32,
    pub bytes: Vec<u8>,
}

impl MasterKey {
    pub fn new(key_id: i32, bytes: Vec<u8>) -> Self {
        Self { key_id, bytes }
    }
}

/// Opaque credential blob forwarded from the controller to running
/// applications. The node agent never interprets the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeLabel(String);

impl NodeLabel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A container whose allocation the controller has changed since the last
/// heartbeat round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdatedContainer {
    pub container_id: ContainerId,
    pub capability: Resource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalContainerCommand {
    OutputThreadDump,
    GracefulShutdown,
    ForcefulShutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalContainerRequest {
    pub container_id: ContainerId,
    pub command: SignalContainerCommand,
}

/// Summary of opportunistic container activity attached to each node status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct OpportunisticContainersStatus {
    pub running_count: u32,
    pub queued_count: u32,
    pub used_memory_mb: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerQueuingLimit {
    pub max_queue_length: u32,
    pub max_queue_wait_time_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogAggregationStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogAggregationReport {
    pub application_id: ApplicationId,
    pub status: LogAggregationStatus,
    pub diagnostics: String,
}

/// Sentinel `rm_identifier`/`version` value of collector data that has not yet
/// been stamped by a controller.
pub const UNSTAMPED_COLLECTOR_VERSION: i64 = -1;

/// Address of a per-application timeline collector, stamped by the controller
/// epoch and a version so replicas can be ordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppCollectorData {
    pub collector_addr: String,
    pub rm_identifier: i64,
    pub version: i64,
}

impl AppCollectorData {
    pub fn new(collector_addr: impl Into<String>, rm_identifier: i64, version: i64) -> Self {
        Self {
            collector_addr: collector_addr.into(),
            rm_identifier,
            version,
        }
    }

    pub fn is_stamped(&self) -> bool {
        self.rm_identifier != UNSTAMPED_COLLECTOR_VERSION
            && self.version != UNSTAMPED_COLLECTOR_VERSION
    }

    /// Whether `existing` is known to precede `incoming`. Unstamped existing
    /// data is always superseded; unstamped incoming data never supersedes
    /// stamped data.
    pub fn happens_before(existing: Option<&AppCollectorData>, incoming: &AppCollectorData) -> bool {
        let Some(existing) = existing else {
            return true;
        };
        if !existing.is_stamped() {
            return true;
        }
        if !incoming.is_stamped() {
            return false;
        }
        (existing.rm_identifier, existing.version) < (incoming.rm_identifier, incoming.version)
    }
}

/// One full node snapshot sent per heartbeat tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub response_id: i32,
    pub container_statuses: Vec<ContainerStatus>,
    pub keep_alive_applications: Vec<ApplicationId>,
    pub health: NodeHealthStatus,
    pub containers_utilization: ResourceUtilization,
    pub node_utilization: ResourceUtilization,
    pub increased_containers: Vec<UpdatedContainer>,
    pub opportunistic_containers_status: OpportunisticContainersStatus,
}

/// Credentials keyed by application, as pushed by the controller.
pub type SystemCredentials = HashMap<ApplicationId, Credentials>;
