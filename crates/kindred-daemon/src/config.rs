//! Environment-driven daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("{0} is required")]
    Missing(&'static str),

    /// A variable's value could not be parsed.
    #[error("invalid value for {var}: {value}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },

    /// A variable parsed but is out of its allowed range.
    #[error("{var} must be greater than zero")]
    NotPositive {
        /// Variable name.
        var: &'static str,
    },
}

/// Daemon configuration, loaded from the environment with defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the stream and analysis databases.
    pub data_dir: PathBuf,

    /// Logical stream name.
    pub stream_name: String,

    /// Consumer group name.
    pub consumer_group: String,

    /// How long stream messages are retained before trimming.
    pub stream_retention: Duration,

    /// Base URL of the remote preprocessing service.
    pub preprocessor_base_url: String,

    /// API key sent to the preprocessing service.
    pub preprocessor_api_key: String,

    /// Shared secret required on API requests.
    pub api_secret: String,

    /// Sustained request rate allowed per client.
    pub rate_limit_rps: f64,

    /// Maximum concurrent drive computations.
    pub max_concurrent_compute: usize,

    /// Deadline for one drive computation.
    pub computation_timeout: Duration,

    /// Batch size threaded to the aggregator.
    pub batch_size: usize,

    /// Log filter, e.g. `info` or `kindred_core=debug`.
    pub log_level: String,

    /// HTTP listen port.
    pub server_port: u16,
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => {
            value.parse().map_err(|_| ConfigError::Invalid { var, value })
        },
        _ => Ok(default),
    }
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a variable fails to parse. Presence of
    /// required values is checked separately by [`validate`].
    ///
    /// [`validate`]: Config::validate
    pub fn from_env() -> Result<Self, ConfigError> {
        let retention_hours: u64 = env_parse("STREAM_RETENTION_HOURS", 24)?;
        let timeout_minutes: u64 = env_parse("COMPUTATION_TIMEOUT_MINUTES", 30)?;

        Ok(Self {
            data_dir: PathBuf::from(env_string("DATA_DIR", "./kindred-data")),
            stream_name: env_string("STREAM_NAME", "submissions:stream"),
            consumer_group: env_string("CONSUMER_GROUP", "submissions:group"),
            stream_retention: Duration::from_secs(retention_hours * 60 * 60),
            preprocessor_base_url: env_string("PREPROCESSOR_BASE_URL", ""),
            preprocessor_api_key: env_string("PREPROCESSOR_API_KEY", ""),
            api_secret: env_string("API_SECRET", ""),
            rate_limit_rps: env_parse("RATE_LIMIT_RPS", 10.0)?,
            max_concurrent_compute: env_parse("MAX_CONCURRENT_COMPUTE", 5)?,
            computation_timeout: Duration::from_secs(timeout_minutes * 60),
            batch_size: env_parse("BATCH_SIZE", 100)?,
            log_level: env_string("LOG_LEVEL", "info"),
            server_port: env_parse("SERVER_PORT", 8080)?,
        })
    }

    /// Checks that required values are present and positive.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preprocessor_base_url.is_empty() {
            return Err(ConfigError::Missing("PREPROCESSOR_BASE_URL"));
        }
        if self.api_secret.is_empty() {
            return Err(ConfigError::Missing("API_SECRET"));
        }
        if self.max_concurrent_compute == 0 {
            return Err(ConfigError::NotPositive {
                var: "MAX_CONCURRENT_COMPUTE",
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::NotPositive { var: "BATCH_SIZE" });
        }
        if self.stream_retention.is_zero() {
            return Err(ConfigError::NotPositive {
                var: "STREAM_RETENTION_HOURS",
            });
        }
        if self.rate_limit_rps <= 0.0 {
            return Err(ConfigError::NotPositive {
                var: "RATE_LIMIT_RPS",
            });
        }
        Ok(())
    }

    /// Path of the stream database.
    #[must_use]
    pub fn stream_db_path(&self) -> PathBuf {
        self.data_dir.join("stream.db")
    }

    /// Path of the analysis database.
    #[must_use]
    pub fn analysis_db_path(&self) -> PathBuf {
        self.data_dir.join("analysis.db")
    }
}
