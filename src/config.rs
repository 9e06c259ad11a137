//! Configuration management for Warden.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WardenError};
use crate::ratelimit::BackoffPolicy;

/// Prefix of environment variables that override file settings.
const ENV_PREFIX: &str = "WARDEN";

/// Main configuration for the Warden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Sliding-window limiter configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// One-time-code configuration
    #[serde(default)]
    pub otp: OtpConfig,

    /// Background collector configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Deadline for OTP and collector store calls in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout_ms() -> u64 {
    5000
}

/// Sliding-window limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// When false every request is admitted without consulting the store
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Admissions allowed per window; zero or less denies everything
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: i64,

    /// Window length in seconds; must be positive
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,

    /// Prefix of the per-client ordered-set keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for the admission script in milliseconds
    #[serde(default = "default_limiter_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_limiter_timeout_ms(),
        }
    }
}

impl RateLimitingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_requests_per_window() -> i64 {
    100
}

fn default_window_secs() -> i64 {
    60
}

fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

fn default_limiter_timeout_ms() -> u64 {
    2000
}

/// One-time-code configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpConfig {
    /// Number of digits in a code
    #[serde(default = "default_code_length")]
    pub code_length: usize,

    /// How long an issued code stays valid, in seconds
    #[serde(default = "default_validity_secs")]
    pub validity_secs: u64,

    /// Verification attempts allowed per code
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How long a verified code is kept for duplicate submissions, in seconds
    #[serde(default = "default_verified_grace_secs")]
    pub verified_grace_secs: u64,

    /// First cooldown delay, in seconds
    #[serde(default = "default_initial_cooldown_secs")]
    pub initial_cooldown_secs: u64,

    /// Cooldown cap, in seconds
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,

    /// Rolling window of the issuance counter, in seconds
    #[serde(default = "default_generation_window_secs")]
    pub generation_window_secs: u64,

    /// How long a cooldown record outlives its cooldown, in seconds
    #[serde(default = "default_cooldown_retention_secs")]
    pub cooldown_retention_secs: u64,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            code_length: default_code_length(),
            validity_secs: default_validity_secs(),
            max_attempts: default_max_attempts(),
            verified_grace_secs: default_verified_grace_secs(),
            initial_cooldown_secs: default_initial_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
            generation_window_secs: default_generation_window_secs(),
            cooldown_retention_secs: default_cooldown_retention_secs(),
        }
    }
}

impl OtpConfig {
    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_secs)
    }

    pub fn verified_grace(&self) -> Duration {
        Duration::from_secs(self.verified_grace_secs)
    }

    pub fn generation_window(&self) -> Duration {
        Duration::from_secs(self.generation_window_secs)
    }

    pub fn cooldown_retention(&self) -> Duration {
        Duration::from_secs(self.cooldown_retention_secs)
    }

    /// Backoff shared by verification cooldowns and the issuance guard.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.initial_cooldown_secs),
            Duration::from_secs(self.max_cooldown_secs),
        )
    }
}

fn default_code_length() -> usize {
    6
}

fn default_validity_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    5
}

fn default_verified_grace_secs() -> u64 {
    300
}

fn default_initial_cooldown_secs() -> u64 {
    60
}

fn default_max_cooldown_secs() -> u64 {
    3600
}

fn default_generation_window_secs() -> u64 {
    3600
}

fn default_cooldown_retention_secs() -> u64 {
    3600
}

/// Background collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Seconds between sampling rounds
    #[serde(default = "default_collection_interval_secs")]
    pub collection_interval_secs: u64,

    /// Maximum number of limiter keys inspected by a stats query
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Metric namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            collection_interval_secs: default_collection_interval_secs(),
            sample_size: default_sample_size(),
            namespace: default_namespace(),
        }
    }
}

impl ObservabilityConfig {
    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_secs)
    }
}

fn default_collection_interval_secs() -> u64 {
    30
}

fn default_sample_size() -> usize {
    100
}

fn default_namespace() -> String {
    "warden".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

impl WardenConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file layered under
    /// `WARDEN_*` environment variables (`__` separates sections, e.g.
    /// `WARDEN_RATE_LIMITING__ENABLED=false`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: WardenConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.window_secs <= 0 {
            return Err(WardenError::Config(format!(
                "rate_limiting.window_secs must be positive, got {}",
                self.rate_limiting.window_secs
            )));
        }
        if self.otp.code_length == 0 {
            return Err(WardenError::Config("otp.code_length must be positive".into()));
        }
        if self.otp.max_attempts == 0 {
            return Err(WardenError::Config("otp.max_attempts must be positive".into()));
        }
        if self.otp.initial_cooldown_secs > self.otp.max_cooldown_secs {
            return Err(WardenError::Config(
                "otp.initial_cooldown_secs must not exceed otp.max_cooldown_secs".into(),
            ));
        }
        if self.observability.collection_interval_secs == 0 {
            return Err(WardenError::Config(
                "observability.collection_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert!(config.rate_limiting.enabled);
        assert_eq!(config.rate_limiting.requests_per_window, 100);
        assert_eq!(config.rate_limiting.window_secs, 60);
        assert_eq!(config.otp.code_length, 6);
        assert_eq!(config.otp.max_attempts, 5);
        assert_eq!(config.otp.validity(), Duration::from_secs(600));
        assert_eq!(config.otp.backoff(), BackoffPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
rate_limiting:
  requests_per_window: 5
  window_secs: 10
otp:
  max_attempts: 3
logging:
  format: json
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limiting.requests_per_window, 5);
        assert_eq!(config.rate_limiting.window_secs, 10);
        assert_eq!(config.rate_limiting.key_prefix, "rate_limit:");
        assert_eq!(config.otp.max_attempts, 3);
        assert_eq!(config.otp.code_length, 6);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_zero_window_rejected() {
        let yaml = r#"
rate_limiting:
  window_secs: 0
"#;
        assert!(matches!(
            WardenConfig::from_yaml(yaml),
            Err(WardenError::Config(_))
        ));
    }

    #[test]
    fn test_inverted_cooldown_rejected() {
        let mut config = WardenConfig::default();
        config.otp.initial_cooldown_secs = 7200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = WardenConfig::load(None).unwrap();
        assert_eq!(config.store.timeout(), Duration::from_secs(5));
    }
}
