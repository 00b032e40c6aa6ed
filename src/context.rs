use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
};

use anyhow::Result;

use crate::{
    data_model::{
        AppCollectorData, Application, ApplicationId, Container, ContainerId,
        ContainerQueuingLimit, Credentials, LogAggregationReport, MasterKey, NodeHealthStatus,
        NodeId, OpportunisticContainersStatus, ResourceUtilization, SystemCredentials,
    },
    utils::time::get_epoch_time_in_ms,
};

/// Completion-tracking tombstones for containers that survived an agent
/// restart. Removal failures are logged by callers and never fatal.
pub trait NodeStateStore: Send + Sync {
    fn remove_container(&self, container_id: &ContainerId) -> Result<()>;
}

/// State store used when recovery is disabled; every operation is a no-op.
pub struct NullNodeStateStore;

impl NodeStateStore for NullNodeStateStore {
    fn remove_container(&self, _container_id: &ContainerId) -> Result<()> {
        Ok(())
    }
}

/// Receives accepted per-application timeline collector addresses.
pub trait TimelinePublisher: Send + Sync {
    fn set_timeline_service_address(&self, application_id: &ApplicationId, collector_addr: &str);
}

/// Amends the advertised node capacity at startup, e.g. for accelerator
/// plugins that reserve a share of memory.
pub trait ResourcePlugin: Send + Sync {
    fn update_configured_resource(&self, resource: &mut crate::data_model::Resource);
}

/// Holder for one rolling master key. The controller is the only writer of
/// new key material; latest key wins.
#[derive(Default)]
pub struct SecretManager {
    master_key: Mutex<Option<MasterKey>>,
}

impl SecretManager {
    pub fn set_master_key(&self, key: MasterKey) {
        *self.master_key.lock().unwrap() = Some(key);
    }

    pub fn current_key(&self) -> Option<MasterKey> {
        self.master_key.lock().unwrap().clone()
    }
}

/// Tracks node health as observed by the enclosing agent's health scripts and
/// by fatal exceptions reported through the status updater.
pub struct NodeHealthChecker {
    healthy: AtomicBool,
    report: Mutex<String>,
    last_report_time_ms: AtomicU64,
}

impl NodeHealthChecker {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            report: Mutex::new(String::new()),
            last_report_time_ms: AtomicU64::new(get_epoch_time_in_ms()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn health_report(&self) -> String {
        self.report.lock().unwrap().clone()
    }

    pub fn last_report_time_ms(&self) -> u64 {
        self.last_report_time_ms.load(Ordering::SeqCst)
    }

    pub fn set_health(&self, healthy: bool, report: impl Into<String>) {
        self.healthy.store(healthy, Ordering::SeqCst);
        *self.report.lock().unwrap() = report.into();
        self.last_report_time_ms
            .store(get_epoch_time_in_ms(), Ordering::SeqCst);
    }

    pub fn report_exception(&self, error: &anyhow::Error) {
        self.set_health(false, format!("{error:#}"));
    }

    pub fn status(&self) -> NodeHealthStatus {
        NodeHealthStatus {
            is_node_healthy: self.is_healthy(),
            health_report: self.health_report(),
            last_health_report_time_ms: self.last_report_time_ms(),
        }
    }
}

impl Default for NodeHealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared view of the containment subsystem consumed by the status updater.
///
/// The container and application maps are owned by the containment subsystem;
/// the updater reads them and removes completed containers only. Registration
/// and concurrent container admissions serialize on `admission_lock` so the
/// controller observes a consistent pre/post-registration cut.
pub struct NodeContext {
    node_id: RwLock<Option<NodeId>>,
    http_port: RwLock<u16>,
    containers: Mutex<HashMap<ContainerId, Container>>,
    applications: Mutex<HashMap<ApplicationId, Application>>,
    increased_containers: Mutex<HashMap<ContainerId, crate::data_model::UpdatedContainer>>,
    known_collectors: Mutex<HashMap<ApplicationId, AppCollectorData>>,
    registering_collectors: Mutex<HashMap<ApplicationId, AppCollectorData>>,
    system_credentials: Mutex<SystemCredentials>,
    container_token_secret_manager: SecretManager,
    nm_token_secret_manager: SecretManager,
    state_store: Arc<dyn NodeStateStore>,
    timeline_publisher: Option<Arc<dyn TimelinePublisher>>,
    decommissioned: AtomicBool,
    admission_lock: tokio::sync::Mutex<()>,

    // Container-manager facade.
    opportunistic_containers_status: Mutex<OpportunisticContainersStatus>,
    containers_utilization: Mutex<ResourceUtilization>,
    node_utilization: Mutex<ResourceUtilization>,
    queuing_limit: Mutex<Option<ContainerQueuingLimit>>,
    log_aggregation_reports: Mutex<VecDeque<LogAggregationReport>>,
}

impl NodeContext {
    pub fn new(
        state_store: Arc<dyn NodeStateStore>,
        timeline_publisher: Option<Arc<dyn TimelinePublisher>>,
    ) -> Self {
        Self {
            node_id: RwLock::new(None),
            http_port: RwLock::new(0),
            containers: Mutex::new(HashMap::new()),
            applications: Mutex::new(HashMap::new()),
            increased_containers: Mutex::new(HashMap::new()),
            known_collectors: Mutex::new(HashMap::new()),
            registering_collectors: Mutex::new(HashMap::new()),
            system_credentials: Mutex::new(HashMap::new()),
            container_token_secret_manager: SecretManager::default(),
            nm_token_secret_manager: SecretManager::default(),
            state_store,
            timeline_publisher,
            decommissioned: AtomicBool::new(false),
            admission_lock: tokio::sync::Mutex::new(()),
            opportunistic_containers_status: Mutex::new(OpportunisticContainersStatus::default()),
            containers_utilization: Mutex::new(ResourceUtilization::default()),
            node_utilization: Mutex::new(ResourceUtilization::default()),
            queuing_limit: Mutex::new(None),
            log_aggregation_reports: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_node_id(&self, node_id: NodeId, http_port: u16) {
        *self.node_id.write().unwrap() = Some(node_id);
        *self.http_port.write().unwrap() = http_port;
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id.read().unwrap().clone()
    }

    pub fn http_port(&self) -> u16 {
        *self.http_port.read().unwrap()
    }

    pub fn containers(&self) -> MutexGuard<'_, HashMap<ContainerId, Container>> {
        self.containers.lock().unwrap()
    }

    pub fn applications(&self) -> MutexGuard<'_, HashMap<ApplicationId, Application>> {
        self.applications.lock().unwrap()
    }

    pub fn increased_containers(
        &self,
    ) -> MutexGuard<'_, HashMap<ContainerId, crate::data_model::UpdatedContainer>> {
        self.increased_containers.lock().unwrap()
    }

    pub fn known_collectors(&self) -> MutexGuard<'_, HashMap<ApplicationId, AppCollectorData>> {
        self.known_collectors.lock().unwrap()
    }

    pub fn registering_collectors(
        &self,
    ) -> MutexGuard<'_, HashMap<ApplicationId, AppCollectorData>> {
        self.registering_collectors.lock().unwrap()
    }

    /// An application is stopped once it left the context or entered a
    /// terminal phase.
    pub fn is_application_stopped(&self, application_id: &ApplicationId) -> bool {
        match self.applications.lock().unwrap().get(application_id) {
            None => true,
            Some(application) => application.state().is_stopped(),
        }
    }

    pub fn container_token_secret_manager(&self) -> &SecretManager {
        &self.container_token_secret_manager
    }

    pub fn nm_token_secret_manager(&self) -> &SecretManager {
        &self.nm_token_secret_manager
    }

    pub fn state_store(&self) -> &dyn NodeStateStore {
        self.state_store.as_ref()
    }

    pub fn timeline_publisher(&self) -> Option<&Arc<dyn TimelinePublisher>> {
        self.timeline_publisher.as_ref()
    }

    pub fn set_system_credentials(&self, credentials: SystemCredentials) {
        *self.system_credentials.lock().unwrap() = credentials;
    }

    pub fn system_credentials(&self, application_id: &ApplicationId) -> Option<Credentials> {
        self.system_credentials
            .lock()
            .unwrap()
            .get(application_id)
            .cloned()
    }

    pub fn set_decommissioned(&self, decommissioned: bool) {
        self.decommissioned.store(decommissioned, Ordering::SeqCst);
    }

    pub fn get_decommissioned(&self) -> bool {
        self.decommissioned.load(Ordering::SeqCst)
    }

    pub fn admission_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.admission_lock
    }

    pub fn set_opportunistic_containers_status(&self, status: OpportunisticContainersStatus) {
        *self.opportunistic_containers_status.lock().unwrap() = status;
    }

    pub fn opportunistic_containers_status(&self) -> OpportunisticContainersStatus {
        *self.opportunistic_containers_status.lock().unwrap()
    }

    pub fn set_containers_utilization(&self, utilization: ResourceUtilization) {
        *self.containers_utilization.lock().unwrap() = utilization;
    }

    pub fn containers_utilization(&self) -> ResourceUtilization {
        *self.containers_utilization.lock().unwrap()
    }

    pub fn set_node_utilization(&self, utilization: ResourceUtilization) {
        *self.node_utilization.lock().unwrap() = utilization;
    }

    pub fn node_utilization(&self) -> ResourceUtilization {
        *self.node_utilization.lock().unwrap()
    }

    pub fn update_queuing_limit(&self, limit: ContainerQueuingLimit) {
        *self.queuing_limit.lock().unwrap() = Some(limit);
    }

    pub fn queuing_limit(&self) -> Option<ContainerQueuingLimit> {
        *self.queuing_limit.lock().unwrap()
    }

    pub fn push_log_aggregation_report(&self, report: LogAggregationReport) {
        self.log_aggregation_reports.lock().unwrap().push_back(report);
    }

    pub fn drain_log_aggregation_reports(&self) -> Vec<LogAggregationReport> {
        self.log_aggregation_reports.lock().unwrap().drain(..).collect()
    }
}
