use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

use crate::data_model::Resource;

#[derive(Debug, Default)]
pub struct NodeAgentMetrics {
    pub(crate) total_memory_mb: Gauge,
    pub(crate) total_vcores: Gauge,
    pub(crate) registered: Gauge,
    pub(crate) heartbeats: Counter,
    pub(crate) missed_heartbeats: Counter,
}

impl NodeAgentMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let total_memory_mb = Gauge::default();
        registry.register(
            "total_memory_mb",
            "Memory advertised to the controller in MiB",
            total_memory_mb.clone(),
        );
        let total_vcores = Gauge::default();
        registry.register(
            "total_vcores",
            "Virtual cores advertised to the controller",
            total_vcores.clone(),
        );
        let registered = Gauge::default();
        registry.register(
            "registered",
            "1 once the node registered with the controller, 0 otherwise",
            registered.clone(),
        );
        let heartbeats = Counter::default();
        registry.register(
            "heartbeats",
            "Number of heartbeat rounds acknowledged by the controller",
            heartbeats.clone(),
        );
        let missed_heartbeats = Counter::default();
        registry.register(
            "missed_heartbeats",
            "Number of heartbeat rounds that failed and will be retried",
            missed_heartbeats.clone(),
        );

        Self {
            total_memory_mb,
            total_vcores,
            registered,
            heartbeats,
            missed_heartbeats,
        }
    }

    pub fn set_total_resource(&self, resource: &Resource) {
        self.total_memory_mb.set(resource.memory_mb as i64);
        self.total_vcores.set(resource.vcores as i64);
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.set(registered as i64);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats.inc();
    }

    pub fn heartbeat_missed(&self) {
        self.missed_heartbeats.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_gauges_track_updates() {
        let mut registry = Registry::default();
        let metrics = NodeAgentMetrics::new(&mut registry);
        metrics.set_total_resource(&Resource::new(8192, 4));
        assert_eq!(metrics.total_memory_mb.get(), 8192);
        assert_eq!(metrics.total_vcores.get(), 4);

        metrics.heartbeat_sent();
        metrics.heartbeat_missed();
        assert_eq!(metrics.heartbeats.get(), 1);
        assert_eq!(metrics.missed_heartbeats.get(), 1);
    }
}
