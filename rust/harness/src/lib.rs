#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::too_many_lines
)]

//! Backprop Training Harness
//!
//! Gates training jobs behind a rate limiter and host/GPU resource checks,
//! runs each admitted job under a hard timebox, and records progress and
//! checkpoints so an interrupted run can resume.

pub mod config;
pub mod governor;
pub mod probe;
pub mod store;
pub mod supervisor;

pub use config::{ConfigError, HarnessConfig};
pub use governor::{Governor, GovernorDecision, GovernorPolicy, TokenBucket};
pub use probe::{DeviceProbeChain, DeviceProbeResult, ProbeMode};
pub use store::{RunRecord, RunStatus, RunStore, StoreError};
pub use supervisor::{RunOutcome, RunResult, RunSettings, StopHandle, Supervisor};
