//! Admission control.
//!
//! The [`Governor`] composes the [`TokenBucket`] rate limiter, a
//! [`ResourceSampler`] and the GPU [`DeviceProbeChain`](crate::probe::DeviceProbeChain)
//! into a single allow/reject decision.

pub mod policy;
pub mod resources;
pub mod token_bucket;

pub use policy::{Governor, GovernorDecision, GovernorPolicy};
pub use resources::{HostSampler, ResourceSampler, ResourceState};
pub use token_bucket::TokenBucket;
