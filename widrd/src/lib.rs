//! Workload identity renewal.
//!
//! [`IdentityHook`] signs an allocation's workload identities before its tasks
//! start, publishes the tokens to a [`SharedTokenStore`] and per-task
//! [`TaskTokenSink`]s, then keeps every identity with a TTL fresh from a
//! single background [`RenewalLoop`] until the task stops or the agent shuts
//! down.

#![forbid(unsafe_code)]

pub mod hook;
pub mod lifecycle;
pub mod mock;
pub mod renew;
pub mod schedule;
pub mod signer;
pub mod sink;
pub mod store;

pub use hook::{HookError, IdentityHook};
pub use lifecycle::{PrerunHook, RunnerHook, ShutdownHook, TaskStopHook, TaskStopRequest};
pub use renew::{LoopState, RenewalLoop, RenewalStatus, TaskSinks};
pub use schedule::{RenewalOutcome, RenewalSchedule};
pub use signer::{DevSigner, IdentitySigner, SignError};
pub use sink::{SecretDirSink, SinkError, TaskTokenSink, WI_TOKEN_FILE};
pub use store::{SharedTokenStore, TokenUpdate, UpdateKind};
