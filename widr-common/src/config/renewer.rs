//! Renewer configuration: defaults, optional TOML file, then `WIDR_*`
//! environment overrides.

use super::env::{EnvError, EnvParser, expand_home};
use super::source::Sourced;
use crate::backoff::{DEFAULT_BACKOFF_CEILING, DEFAULT_MIN_WAIT, RenewalTiming};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOG_LEVEL: &str = "info";

/// Errors loading the renewer configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration for `{field}` in config file: {value}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid environment: {}", join_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn join_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// On-disk layout. Every field is optional; durations use humantime syntax.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    min_wait: Option<String>,
    backoff_ceiling: Option<String>,
    secrets_root: Option<PathBuf>,
    log_level: Option<String>,
    log_json: Option<bool>,
    stop_timeout: Option<String>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Effective configuration for the identity renewer.
#[derive(Debug, Clone)]
pub struct RenewerConfig {
    /// Floor for every renewal wait.
    pub min_wait: Sourced<Duration>,
    /// Ceiling for failure backoff.
    pub backoff_ceiling: Sourced<Duration>,
    /// Root under which per-task secrets directories are created.
    pub secrets_root: Sourced<PathBuf>,
    pub log_level: Sourced<String>,
    pub log_json: Sourced<bool>,
    /// How long shutdown waits for the renewal loop to exit.
    pub stop_timeout: Sourced<Duration>,
}

impl Default for RenewerConfig {
    fn default() -> Self {
        Self {
            min_wait: Sourced::default_value(DEFAULT_MIN_WAIT),
            backoff_ceiling: Sourced::default_value(DEFAULT_BACKOFF_CEILING),
            secrets_root: Sourced::default_value(default_secrets_root()),
            log_level: Sourced::default_value(DEFAULT_LOG_LEVEL.to_string()),
            log_json: Sourced::default_value(false),
            stop_timeout: Sourced::default_value(DEFAULT_STOP_TIMEOUT),
        }
    }
}

fn default_secrets_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("widr").join("secrets"))
        .unwrap_or_else(|| PathBuf::from("/tmp/widr/secrets"))
}

fn file_duration(
    field: &'static str,
    value: Option<String>,
) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|v| {
            humantime::parse_duration(v.trim())
                .map_err(|_| ConfigError::InvalidDuration { field, value: v })
        })
        .transpose()
}

/// Layer: env wins over file, file wins over default.
fn layer<T>(env: Sourced<T>, file: Option<T>) -> Sourced<T> {
    if env.is_set() {
        return env;
    }
    match file {
        Some(value) => Sourced::from_file(value),
        None => env,
    }
}

impl RenewerConfig {
    /// Load defaults, then the optional file, then environment overrides.
    ///
    /// Does not validate: callers apply command-line overrides first and then
    /// call [`RenewerConfig::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => FileConfig::load(p)?,
            None => FileConfig::default(),
        };
        let defaults = Self::default();
        let mut env = EnvParser::new();

        let config = Self {
            min_wait: layer(
                env.get_duration("MIN_WAIT", defaults.min_wait.value),
                file_duration("min_wait", file.min_wait)?,
            ),
            backoff_ceiling: layer(
                env.get_duration("BACKOFF_CEILING", defaults.backoff_ceiling.value),
                file_duration("backoff_ceiling", file.backoff_ceiling)?,
            ),
            secrets_root: layer(
                env.get_path("SECRETS_ROOT", defaults.secrets_root.value),
                file.secrets_root.map(expand_home),
            ),
            log_level: layer(
                env.get_log_level("LOG_LEVEL", DEFAULT_LOG_LEVEL),
                file.log_level,
            ),
            log_json: layer(env.get_bool("LOG_JSON", false), file.log_json),
            stop_timeout: layer(
                env.get_duration("STOP_TIMEOUT", defaults.stop_timeout.value),
                file_duration("stop_timeout", file.stop_timeout)?,
            ),
        };

        if env.has_errors() {
            return Err(ConfigError::Env(env.take_errors()));
        }
        Ok(config)
    }

    /// Apply command-line overrides. They win over every other source.
    pub fn apply_overrides(
        &mut self,
        secrets_root: Option<PathBuf>,
        min_wait: Option<Duration>,
        log_json: bool,
    ) {
        if let Some(root) = secrets_root {
            self.secrets_root = Sourced::from_cli(root);
        }
        if let Some(min_wait) = min_wait {
            self.min_wait = Sourced::from_cli(min_wait);
        }
        if log_json {
            self.log_json = Sourced::from_cli(true);
        }
    }

    /// Log the effective configuration and where each value came from.
    pub fn log_summary(&self) {
        debug!(
            min_wait = ?self.min_wait.value,
            min_wait_source = %self.min_wait.source,
            backoff_ceiling = ?self.backoff_ceiling.value,
            backoff_ceiling_source = %self.backoff_ceiling.source,
            secrets_root = %self.secrets_root.value.display(),
            secrets_root_source = %self.secrets_root.source,
            stop_timeout = ?self.stop_timeout.value,
            "Loaded renewer configuration"
        );
    }

    /// Reject configurations the renewal loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_wait.value.is_zero() {
            return Err(ConfigError::Invalid("min_wait must be greater than zero".into()));
        }
        let level = self.log_level.value.as_str();
        if !matches!(level, "trace" | "debug" | "info" | "warn" | "error" | "off") {
            return Err(ConfigError::Invalid(format!("unknown log_level `{level}`")));
        }
        if self.backoff_ceiling.value < self.min_wait.value {
            return Err(ConfigError::Invalid(format!(
                "backoff_ceiling ({:?}) is below min_wait ({:?})",
                self.backoff_ceiling.value, self.min_wait.value
            )));
        }
        Ok(())
    }

    pub fn timing(&self) -> RenewalTiming {
        RenewalTiming::new(self.min_wait.value, self.backoff_ceiling.value)
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::ConfigSource;
    use crate::config::env_test_lock;
    use std::io::Write;

    const ALL_VARS: [&str; 6] = [
        "WIDR_MIN_WAIT",
        "WIDR_BACKOFF_CEILING",
        "WIDR_SECRETS_ROOT",
        "WIDR_LOG_LEVEL",
        "WIDR_LOG_JSON",
        "WIDR_STOP_TIMEOUT",
    ];

    fn cleanup_env() {
        for var in ALL_VARS {
            // SAFETY: env access is serialized by env_test_lock
            unsafe { std::env::remove_var(var) };
        }
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let _guard = env_test_lock();
        cleanup_env();

        let config = RenewerConfig::load(None).unwrap();
        assert_eq!(config.min_wait.value, Duration::from_secs(10));
        assert_eq!(config.backoff_ceiling.value, Duration::from_secs(3600));
        assert_eq!(config.stop_timeout.value, Duration::from_secs(5));
        assert_eq!(config.log_level.value, "info");
        assert_eq!(config.min_wait.source, ConfigSource::Default);
    }

    #[test]
    fn test_file_values_applied() {
        let _guard = env_test_lock();
        cleanup_env();

        let file = write_config(
            r#"
min_wait = "2s"
backoff_ceiling = "5m"
secrets_root = "/srv/widr"
log_json = true
"#,
        );
        let config = RenewerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.min_wait.value, Duration::from_secs(2));
        assert_eq!(config.min_wait.source, ConfigSource::File);
        assert_eq!(config.backoff_ceiling.value, Duration::from_secs(300));
        assert_eq!(config.secrets_root.value, PathBuf::from("/srv/widr"));
        assert!(config.log_json.value);
        assert_eq!(config.timing().min_wait, Duration::from_secs(2));
    }

    #[test]
    fn test_env_overrides_file() {
        let _guard = env_test_lock();
        cleanup_env();

        let file = write_config("min_wait = \"2s\"\n");
        // SAFETY: env access is serialized by env_test_lock
        unsafe { std::env::set_var("WIDR_MIN_WAIT", "30s") };
        let config = RenewerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.min_wait.value, Duration::from_secs(30));
        assert_eq!(config.min_wait.source, ConfigSource::Environment);

        cleanup_env();
    }

    #[test]
    fn test_env_errors_are_collected() {
        let _guard = env_test_lock();
        cleanup_env();

        // SAFETY: env access is serialized by env_test_lock
        unsafe {
            std::env::set_var("WIDR_MIN_WAIT", "soon");
            std::env::set_var("WIDR_LOG_LEVEL", "chatty");
        }
        match RenewerConfig::load(None) {
            Err(ConfigError::Env(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected env errors, got {other:?}"),
        }

        cleanup_env();
    }

    #[test]
    fn test_invalid_file_duration() {
        let _guard = env_test_lock();
        cleanup_env();

        let file = write_config("stop_timeout = \"eventually\"\n");
        let err = RenewerConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDuration {
                field: "stop_timeout",
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let _guard = env_test_lock();
        cleanup_env();

        let file = write_config("min_weight = \"2s\"\n");
        assert!(matches!(
            RenewerConfig::load(Some(file.path())),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let _guard = env_test_lock();
        cleanup_env();

        let err = RenewerConfig::load(Some(Path::new("/nonexistent/widr.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_validate_rejects_ceiling_below_floor() {
        let mut config = RenewerConfig {
            min_wait: Sourced::default_value(Duration::from_secs(60)),
            backoff_ceiling: Sourced::default_value(Duration::from_secs(30)),
            ..RenewerConfig::default()
        };
        assert!(config.validate().is_err());

        config.min_wait = Sourced::default_value(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_file_log_level() {
        let config = RenewerConfig {
            log_level: Sourced::from_file("chatty".to_string()),
            ..RenewerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_command_line_override_validated_after_load() {
        let _guard = env_test_lock();
        cleanup_env();

        // Invalid on its own: the ceiling is below the default floor.
        let file = write_config("backoff_ceiling = \"5s\"\n");
        let mut config = RenewerConfig::load(Some(file.path())).unwrap();
        assert!(config.validate().is_err());

        config.apply_overrides(None, Some(Duration::from_secs(1)), false);
        config.validate().unwrap();
        assert_eq!(config.min_wait.source, ConfigSource::CommandLine);
        assert_eq!(config.backoff_ceiling.source, ConfigSource::File);
        assert_eq!(config.timing().min_wait, Duration::from_secs(1));
    }

    #[test]
    fn test_overrides_win_over_env() {
        let _guard = env_test_lock();
        cleanup_env();

        // SAFETY: env access is serialized by env_test_lock
        unsafe { std::env::set_var("WIDR_SECRETS_ROOT", "/env/secrets") };
        let mut config = RenewerConfig::load(None).unwrap();
        config.apply_overrides(Some(PathBuf::from("/cli/secrets")), None, true);

        assert_eq!(config.secrets_root.value, PathBuf::from("/cli/secrets"));
        assert_eq!(config.secrets_root.source, ConfigSource::CommandLine);
        assert!(config.log_json.value);
        assert_eq!(config.min_wait.source, ConfigSource::Default);

        cleanup_env();
    }
}
