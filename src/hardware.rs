use sysinfo::System;
use tracing::debug;

use crate::data_model::Resource;

/// Detects physical node capacity once at startup. Detection is static: the
/// probe caches what it saw and never re-reads the system.
pub struct HardwareProbe {
    memory_mb: u64,
    vcores: u32,
}

impl HardwareProbe {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let vcores = sys.cpus().len() as u32;
        let memory_mb = sys.total_memory() / (1024 * 1024);

        debug!(
            memory_mb = memory_mb,
            vcores = vcores,
            "hardware resources detected"
        );

        Self { memory_mb, vcores }
    }

    pub fn physical_resource(&self) -> Resource {
        Resource::new(self.memory_mb, self.vcores)
    }
}

impl Default for HardwareProbe {
    fn default() -> Self {
        Self::new()
    }
}
