//! Host load probe backing heartbeat replies and app-level shedding.

use std::sync::Mutex;
use sysinfo::{Disks, System};

/// Samples CPU, memory and disk usage through a persistent [`System`].
///
/// CPU usage is measured between consecutive refreshes, so the very first
/// probe after startup reads low; heartbeats smooth this out.
pub struct LoadProbe {
    system: Mutex<System>,
}

impl Default for LoadProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Averaged CPU and memory usage in percent. A nearly full disk
    /// (>= 95 %) pins the rate to 100 so the Gateway stops routing here.
    pub fn load_rate(&self) -> f64 {
        let (cpu, memory) = {
            let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_cpu_usage();
            system.refresh_memory();

            let cpu = system.global_cpu_usage() as f64;
            let total = system.total_memory();
            let memory = if total == 0 {
                0.0
            } else {
                system.used_memory() as f64 / total as f64 * 100.0
            };
            (cpu, memory)
        };

        if max_disk_usage_percent() >= 95.0 {
            return 100.0;
        }

        ((cpu + memory) / 2.0).clamp(0.0, 100.0)
    }

    /// Memory usage in percent.
    pub fn memory_usage_percent(&self) -> f64 {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 / total as f64 * 100.0
    }

    /// App-level shedding probe: true when memory usage exceeds the
    /// threshold percentage.
    pub fn memory_runout(&self, threshold_percent: f64) -> bool {
        self.memory_usage_percent() > threshold_percent
    }
}

fn max_disk_usage_percent() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| disk.total_space() > 0)
        .map(|disk| {
            let used = disk.total_space().saturating_sub(disk.available_space());
            used as f64 / disk.total_space() as f64 * 100.0
        })
        .fold(0.0, f64::max)
}
