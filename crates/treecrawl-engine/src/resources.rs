//! Host resource sampling for the scaling engine.
//!
//! The scaling engine asks a [`ResourceMonitor`] for memory, CPU and disk
//! utilisation on every tick and holds growth or forces contraction when the
//! host is under pressure (see [`ResourceLimits`]).

use std::fmt;
use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Disks, System};

use crate::config::ResourceLimits;

/// Host utilisation in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub disk_percent: f64,
}

impl ResourceSample {
    /// True if every gauge is below its growth ceiling.
    pub fn permits_growth(&self, limits: &ResourceLimits) -> bool {
        self.memory_percent < limits.scale_up_max_memory_percent
            && self.cpu_percent < limits.scale_up_max_cpu_percent
            && self.disk_percent < limits.scale_up_max_disk_percent
    }

    /// Describe the first gauge above its contraction ceiling, if any.
    pub fn pressure(&self, limits: &ResourceLimits) -> Option<String> {
        let gauges = [
            ("memory", self.memory_percent, limits.scale_down_memory_percent),
            ("cpu", self.cpu_percent, limits.scale_down_cpu_percent),
            ("disk", self.disk_percent, limits.scale_down_disk_percent),
        ];
        gauges
            .into_iter()
            .find(|(_, used, ceiling)| used > ceiling)
            .map(|(gauge, used, ceiling)| format!("{gauge} at {used:.0}% above {ceiling:.0}%"))
    }
}

/// Source of host utilisation samples.
pub trait ResourceMonitor: Send + Sync {
    /// Current utilisation, or `None` if it cannot be measured.
    fn sample(&self) -> Option<ResourceSample>;
}

/// [`ResourceMonitor`] reading the local host through `sysinfo`.
///
/// CPU usage is computed between two refreshes, so the first sample after
/// construction reports the usage since `new`.
pub struct SystemMonitor {
    system: Mutex<System>,
    disks: Mutex<Disks>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }

    fn disk_percent(&self) -> f64 {
        let mut disks = self.disks.lock();
        disks.refresh();
        let root = if cfg!(windows) { Path::new("C:\\") } else { Path::new("/") };
        disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == root)
            .filter(|disk| disk.total_space() > 0)
            .map_or(0.0, |disk| {
                let used = disk.total_space().saturating_sub(disk.available_space());
                used as f64 / disk.total_space() as f64 * 100.0
            })
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemMonitor").finish_non_exhaustive()
    }
}

impl ResourceMonitor for SystemMonitor {
    fn sample(&self) -> Option<ResourceSample> {
        let (memory_percent, cpu_percent) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            system.refresh_cpu();
            let total = system.total_memory();
            if total == 0 {
                return None;
            }
            (
                system.used_memory() as f64 / total as f64 * 100.0,
                f64::from(system.global_cpu_info().cpu_usage()),
            )
        };
        Some(ResourceSample {
            memory_percent,
            cpu_percent,
            disk_percent: self.disk_percent(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calm() -> ResourceSample {
        ResourceSample {
            memory_percent: 40.0,
            cpu_percent: 30.0,
            disk_percent: 50.0,
        }
    }

    #[test]
    fn test_growth_ceilings() {
        let limits = ResourceLimits::default();
        assert!(calm().permits_growth(&limits));

        let busy_cpu = ResourceSample {
            cpu_percent: 85.0,
            ..calm()
        };
        assert!(!busy_cpu.permits_growth(&limits));
        assert_eq!(busy_cpu.pressure(&limits), None);
    }

    #[test]
    fn test_pressure_names_first_gauge() {
        let limits = ResourceLimits::default();
        assert_eq!(calm().pressure(&limits), None);

        let full = ResourceSample {
            memory_percent: 93.0,
            disk_percent: 99.0,
            ..calm()
        };
        assert_eq!(full.pressure(&limits).as_deref(), Some("memory at 93% above 90%"));

        let disk = ResourceSample {
            disk_percent: 96.0,
            ..calm()
        };
        assert_eq!(disk.pressure(&limits).as_deref(), Some("disk at 96% above 95%"));
    }

    #[test]
    fn test_system_monitor_reports_percentages() {
        let Some(sample) = SystemMonitor::new().sample() else {
            return;
        };
        for value in [sample.memory_percent, sample.disk_percent] {
            assert!((0.0..=100.0).contains(&value), "{sample:?}");
        }
    }
}
