//! Shared types and utilities for workload identity renewal.

pub mod backoff;
pub mod config;
pub mod types;

pub use backoff::{
    DEFAULT_BACKOFF_CEILING, DEFAULT_MIN_WAIT, RenewalTiming, backoff, expiry_to_renew_time,
    random_stagger,
};
pub use config::{ConfigError, ConfigSource, RenewerConfig, Sourced};
pub use types::{
    Allocation, AllocationId, DEFAULT_IDENTITY_NAME, IdentityKey, IdentityRequest, SignedIdentity,
    Task, WorkloadIdentity,
};
