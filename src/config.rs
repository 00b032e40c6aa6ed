use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DURATION_TO_TRACK_STOPPED_CONTAINERS_MS: i64 = 600_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAgentConfig {
    /// How long completed container ids are remembered to suppress duplicate
    /// completion notices. Must not be negative.
    pub duration_to_track_stopped_containers_ms: i64,
    /// Ratio of virtual to physical memory enforced for containers.
    pub vmem_pmem_ratio: f32,
    /// Controller-side liveness expiry; also the credential removal delay the
    /// keep-alive tracker schedules against.
    pub controller_expiry_interval_ms: u64,
    /// Minimum controller version accepted at registration. `NONE` disables
    /// the check, `EqualToNM` requires at least this agent's own version.
    pub minimum_controller_version: String,
    pub log_aggregation_enabled: bool,
    pub security_enabled: bool,
    pub recovery_enabled: bool,
    pub recovery_supervised: bool,
    /// How often unchanged node labels are re-sent to the controller.
    pub node_labels_resync_interval_ms: u64,
    /// Fallback heartbeat interval when the controller does not provide one.
    pub heartbeat_interval_ms: u64,
    pub timeline_v2_enabled: bool,
    /// Advertised memory; detected from hardware when absent.
    pub memory_mb: Option<u64>,
    /// Advertised virtual cores; detected from hardware when absent.
    pub vcores: Option<u32>,
}

impl Default for NodeAgentConfig {
    fn default() -> Self {
        NodeAgentConfig {
            duration_to_track_stopped_containers_ms: DEFAULT_DURATION_TO_TRACK_STOPPED_CONTAINERS_MS,
            vmem_pmem_ratio: 2.1,
            controller_expiry_interval_ms: 600_000,
            minimum_controller_version: "NONE".to_string(),
            log_aggregation_enabled: false,
            security_enabled: false,
            recovery_enabled: false,
            recovery_supervised: false,
            node_labels_resync_interval_ms: 2 * 60 * 1000,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            timeline_v2_enabled: false,
            memory_mb: None,
            vcores: None,
        }
    }
}

impl NodeAgentConfig {
    pub fn from_path(path: &str) -> Result<NodeAgentConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: NodeAgentConfig =
            Figment::from(Serialized::defaults(NodeAgentConfig::default()))
                .merge(Yaml::string(&config_str))
                .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.duration_to_track_stopped_containers_ms < 0 {
            return Err(anyhow::anyhow!(
                "duration_to_track_stopped_containers_ms cannot be negative, got {}",
                self.duration_to_track_stopped_containers_ms
            ));
        }
        Ok(())
    }

    /// Keep-alive runs only when aggregated logs outlive the application and
    /// credentials are actually enforced.
    pub fn token_keep_alive_enabled(&self) -> bool {
        self.log_aggregation_enabled && self.security_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeAgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.duration_to_track_stopped_containers_ms, 600_000);
        assert_eq!(config.minimum_controller_version, "NONE");
        assert!(!config.token_keep_alive_enabled());
    }

    #[test]
    fn test_negative_stopped_container_duration_rejected() {
        let config = NodeAgentConfig {
            duration_to_track_stopped_containers_ms: -1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keep_alive_requires_both_gates() {
        let config = NodeAgentConfig {
            log_aggregation_enabled: true,
            security_enabled: false,
            ..Default::default()
        };
        assert!(!config.token_keep_alive_enabled());

        let config = NodeAgentConfig {
            log_aggregation_enabled: true,
            security_enabled: true,
            ..Default::default()
        };
        assert!(config.token_keep_alive_enabled());
    }
}
