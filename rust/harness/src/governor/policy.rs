//! Admission decision: rate limiter, host resources, then GPU state.

use serde::Serialize;

use super::{
    resources::{ResourceSampler, ResourceState},
    token_bucket::TokenBucket,
};
use crate::{
    config::HarnessConfig,
    probe::{DeviceProbeChain, DeviceProbeResult},
};

/// Thresholds the governor enforces.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorPolicy {
    /// Parallel runs the caller intends. Degraded monitoring only admits
    /// single-tenant use.
    pub max_parallel: u32,
    pub min_free_ram_gb: f64,
    /// Temperatures at or above this reject admission.
    pub max_temp_c: u32,
    /// Temperatures within this many degrees below `max_temp_c` warn.
    pub temp_warn_margin_c: u32,
    pub min_free_vram_mb: u64,
}

impl Default for GovernorPolicy {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            min_free_ram_gb: 4.0,
            max_temp_c: 85,
            temp_warn_margin_c: 3,
            min_free_vram_mb: 2500,
        }
    }
}

impl GovernorPolicy {
    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            max_parallel: config.governor.max_parallel,
            min_free_ram_gb: config.governor.min_free_ram_gb,
            max_temp_c: config.gpu.max_temp_c,
            temp_warn_margin_c: config.governor.temp_warn_margin_c,
            min_free_vram_mb: config.gpu.min_free_vram_mb,
        }
    }
}

/// Outcome of an admission check. Never partially allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GovernorDecision {
    pub allowed: bool,
    /// Why admission was refused. `None` when allowed.
    pub reason: Option<String>,
    /// Non-blocking concern raised while admitting (thermal margin,
    /// conservative mode).
    pub warning: Option<String>,
}

impl GovernorDecision {
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            warning: None,
        }
    }

    #[must_use]
    pub fn allow_with_warning(warning: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: None,
            warning: Some(warning.into()),
        }
    }

    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            warning: None,
        }
    }
}

/// Admission gate composed of the rate limiter, the host sampler and the
/// device probe chain. Holds no persisted state.
pub struct Governor {
    policy: GovernorPolicy,
    bucket: TokenBucket,
    sampler: Box<dyn ResourceSampler>,
    probes: DeviceProbeChain,
}

impl Governor {
    #[must_use]
    pub fn new(
        policy: GovernorPolicy,
        bucket: TokenBucket,
        sampler: Box<dyn ResourceSampler>,
        probes: DeviceProbeChain,
    ) -> Self {
        Self {
            policy,
            bucket,
            sampler,
            probes,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &GovernorPolicy {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut GovernorPolicy {
        &mut self.policy
    }

    /// Decide whether a new run may start.
    ///
    /// Checks run cheapest first and short-circuit: an exhausted token
    /// bucket returns before any sampling or probing happens.
    pub async fn can_start_run(&mut self) -> GovernorDecision {
        if !self.bucket.acquire(1) {
            return GovernorDecision::reject("token bucket exhausted");
        }

        let state = self.sampler.sample();
        if state.monitoring_failed {
            tracing::warn!("resource monitoring failed, entering conservative mode");
            if self.policy.max_parallel > 1 {
                return GovernorDecision::reject(
                    "monitoring failed, max parallel must be 1 in conservative mode",
                );
            }
            return GovernorDecision::allow_with_warning(
                "resource monitoring failed, admitted in conservative mode",
            );
        }

        if let Some(reason) = self.check_host(&state) {
            return GovernorDecision::reject(reason);
        }

        let device = self.probes.probe().await;
        self.check_device(&device)
    }

    fn check_host(&self, state: &ResourceState) -> Option<String> {
        (state.ram_free_gb < self.policy.min_free_ram_gb).then(|| {
            format!(
                "low RAM ({:.2} GB free < {} GB required)",
                state.ram_free_gb, self.policy.min_free_ram_gb
            )
        })
    }

    /// Unknown readings never block: no data is permissive.
    fn check_device(&self, device: &DeviceProbeResult) -> GovernorDecision {
        let max = self.policy.max_temp_c;
        let mut warning = None;

        if let Some(temp) = device.temperature_c {
            if temp >= max {
                return GovernorDecision::reject(format!(
                    "GPU temperature too high ({temp}°C >= {max}°C). Cooling down."
                ));
            }
            if temp > max.saturating_sub(self.policy.temp_warn_margin_c) {
                let msg = format!("GPU temperature high ({temp}°C, limit {max}°C)");
                tracing::warn!("{msg}");
                warning = Some(msg);
            }
        }

        if let Some(free) = device.vram_free_mb
            && free < self.policy.min_free_vram_mb
        {
            return GovernorDecision::reject(format!(
                "low VRAM ({free} MB free < {} MB required)",
                self.policy.min_free_vram_mb
            ));
        }

        GovernorDecision {
            allowed: true,
            reason: None,
            warning,
        }
    }
}
