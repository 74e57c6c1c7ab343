//! Host resource sampling (free RAM, CPU load).
//!
//! Sampling never fails fatally: any OS query problem yields
//! [`ResourceState::failed`], which the governor treats as "assume worst case".

use std::sync::Mutex;

use sysinfo::System;

/// CPU load reported when sampling fails. Far above any sane threshold.
pub const FAILED_CPU_LOAD: f64 = 999.0;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Point-in-time host snapshot. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceState {
    /// Free (available) RAM in GB.
    pub ram_free_gb: f64,
    /// CPU load in load-average units (runnable work per core summed over cores).
    pub cpu_load: f64,
    /// The sampler itself errored. Distinct from "no GPU found".
    pub monitoring_failed: bool,
}

impl ResourceState {
    /// Worst-case state used when the sampler cannot query the OS.
    #[must_use]
    pub fn failed() -> Self {
        Self {
            ram_free_gb: 0.0,
            cpu_load: FAILED_CPU_LOAD,
            monitoring_failed: true,
        }
    }
}

/// Source of host resource snapshots.
pub trait ResourceSampler: Send + Sync {
    /// Take a snapshot. Must not panic; failures are reported through
    /// [`ResourceState::monitoring_failed`].
    fn sample(&self) -> ResourceState;
}

/// Convert per-core busy percentages into a load-average-scaled figure.
///
/// A fully busy core contributes 1.0, the same as one runnable task in a
/// native 1-minute load average.
#[must_use]
pub fn load_from_core_usage(per_core_percent: &[f32]) -> f64 {
    per_core_percent
        .iter()
        .map(|p| f64::from(p.clamp(0.0, 100.0)) / 100.0)
        .sum()
}

/// Sampler backed by the running host via `sysinfo`.
pub struct HostSampler {
    host: Mutex<HostState>,
}

struct HostState {
    system: System,
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler {
    /// Where there is no native load average, CPU times are captured here so
    /// the first [`sample`](ResourceSampler::sample) already has a delta to
    /// work from and never has to wait for one.
    #[must_use]
    pub fn new() -> Self {
        #[cfg_attr(unix, allow(unused_mut))]
        let mut system = System::new();
        #[cfg(not(unix))]
        system.refresh_cpu_usage();
        Self {
            host: Mutex::new(HostState { system }),
        }
    }

    fn try_sample(&self) -> Option<ResourceState> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return None;
        }

        let mut host = self.host.lock().ok()?;
        host.system.refresh_memory();
        if host.system.total_memory() == 0 {
            return None;
        }
        let ram_free_gb = host.system.available_memory() as f64 / BYTES_PER_GB;
        let cpu_load = host.cpu_load();

        cpu_load.is_finite().then_some(ResourceState {
            ram_free_gb,
            cpu_load,
            monitoring_failed: false,
        })
    }
}

impl HostState {
    #[cfg(unix)]
    #[allow(clippy::unused_self)]
    fn cpu_load(&mut self) -> f64 {
        System::load_average().one
    }

    /// No native load average here: derive it from busy/idle time deltas
    /// since the previous refresh. A sample taken sooner than
    /// `MINIMUM_CPU_UPDATE_INTERVAL` after construction is a best-effort
    /// snapshot over that short window.
    #[cfg(not(unix))]
    fn cpu_load(&mut self) -> f64 {
        self.system.refresh_cpu_usage();
        let usage: Vec<f32> = self.system.cpus().iter().map(sysinfo::Cpu::cpu_usage).collect();
        load_from_core_usage(&usage)
    }
}

impl ResourceSampler for HostSampler {
    fn sample(&self) -> ResourceState {
        self.try_sample().unwrap_or_else(|| {
            tracing::warn!("host resource sampling failed, reporting worst case");
            ResourceState::failed()
        })
    }
}
