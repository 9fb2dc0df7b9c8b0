//! Configuration system for the identity renewer.
//!
//! This module provides:
//! - Environment variable parsing with type safety
//! - TOML config file support
//! - Source tracking for debugging
//! - Validation on startup

pub mod env;
pub mod renewer;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use renewer::{ConfigError, RenewerConfig};
pub use source::{ConfigSource, Sourced};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
