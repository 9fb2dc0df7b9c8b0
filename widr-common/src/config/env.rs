//! Environment variable parsing with type safety.
//!
//! Provides a type-safe parser for WIDR environment variables with
//! validation, error collection, and source tracking.

use super::source::{ConfigSource, Sourced};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the WIDR_ prefix.
    pub fn new() -> Self {
        Self {
            prefix: "WIDR_",
            errors: Vec::new(),
        }
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Check if any errors occurred.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let parsed = match value.to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" | "" => false,
                    _ => {
                        self.errors.push(EnvError::InvalidValue {
                            var: var_name.clone(),
                            expected: "boolean (true/false/1/0/yes/no)".to_string(),
                            value: value.clone(),
                        });
                        default
                    }
                };
                Sourced::from_env(parsed, var_name)
            }
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a duration in humantime syntax (`10s`, `1h 30m`).
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match humantime::parse_duration(value.trim()) {
                Ok(d) => Sourced::from_env(d, var_name),
                Err(_) => {
                    self.errors.push(EnvError::InvalidDuration {
                        var: var_name.clone(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a path value with ~ expansion.
    pub fn get_path(&mut self, name: &str, default: PathBuf) -> Sourced<PathBuf> {
        let var_name = self.var_name(name);
        let (value, source) = match env::var(&var_name) {
            Ok(v) => (PathBuf::from(v), ConfigSource::Environment),
            Err(_) => (default, ConfigSource::Default),
        };

        let expanded = expand_home(value);
        if source == ConfigSource::Environment {
            Sourced::from_env(expanded, var_name)
        } else {
            Sourced::default_value(expanded)
        }
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                        Sourced::from_env(lower, var_name)
                    }
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name.clone(),
                            value: value.clone(),
                        });
                        Sourced::from_env(default.to_string(), var_name)
                    }
                }
            }
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: PathBuf) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_prefix("~/")) {
        Some(stripped) => match dirs::home_dir() {
            Some(home) => home.join(stripped),
            None => path,
        },
        None => path,
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: env access is serialized by env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: env access is serialized by env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_get_bool_true_values() {
        let _guard = env_test_lock();
        let vars = ["WIDR_TEST_BOOL_TRUE"];
        cleanup_env(&vars);

        for val in &["1", "true", "yes", "on", "TRUE", "Yes"] {
            set_env("WIDR_TEST_BOOL_TRUE", val);
            let mut parser = EnvParser::new();
            let result = parser.get_bool("TEST_BOOL_TRUE", false);
            assert!(result.value, "Expected true for '{}'", val);
            assert!(!parser.has_errors());
        }

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_bool_invalid_uses_default() {
        let _guard = env_test_lock();
        let vars = ["WIDR_BAD_BOOL"];
        cleanup_env(&vars);

        set_env("WIDR_BAD_BOOL", "maybe");
        let mut parser = EnvParser::new();
        let result = parser.get_bool("BAD_BOOL", false);
        assert!(!result.value);
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_duration_parses_humantime() {
        let _guard = env_test_lock();
        let vars = ["WIDR_TEST_WAIT"];
        cleanup_env(&vars);

        set_env("WIDR_TEST_WAIT", "1m 30s");
        let mut parser = EnvParser::new();
        let result = parser.get_duration("TEST_WAIT", Duration::from_secs(10));
        assert_eq!(result.value, Duration::from_secs(90));
        assert_eq!(result.source, ConfigSource::Environment);
        assert_eq!(result.var.as_deref(), Some("WIDR_TEST_WAIT"));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_duration_invalid_records_error() {
        let _guard = env_test_lock();
        let vars = ["WIDR_TEST_BAD_WAIT"];
        cleanup_env(&vars);

        set_env("WIDR_TEST_BAD_WAIT", "whenever");
        let mut parser = EnvParser::new();
        let result = parser.get_duration("TEST_BAD_WAIT", Duration::from_secs(10));
        assert_eq!(result.value, Duration::from_secs(10));
        assert!(matches!(
            parser.errors()[0],
            EnvError::InvalidDuration { .. }
        ));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_duration_unset_is_default() {
        let _guard = env_test_lock();
        cleanup_env(&["WIDR_TEST_UNSET_WAIT"]);

        let mut parser = EnvParser::new();
        let result = parser.get_duration("TEST_UNSET_WAIT", Duration::from_secs(7));
        assert_eq!(result.value, Duration::from_secs(7));
        assert!(!result.is_set());
    }

    #[test]
    fn test_get_log_level_validation() {
        let _guard = env_test_lock();
        let vars = ["WIDR_TEST_LOG"];
        cleanup_env(&vars);

        set_env("WIDR_TEST_LOG", "DEBUG");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_log_level("TEST_LOG", "info").value, "debug");
        assert!(!parser.has_errors());

        set_env("WIDR_TEST_LOG", "loud");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_log_level("TEST_LOG", "info").value, "info");
        assert_eq!(parser.take_errors().len(), 1);
        assert!(!parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_expand_home() {
        let plain = expand_home(PathBuf::from("/var/lib/widr"));
        assert_eq!(plain, PathBuf::from("/var/lib/widr"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(PathBuf::from("~/secrets")), home.join("secrets"));
        }
    }
}
