//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::device::Credentials;
use crate::discovery::DiscoveryOptions;
use crate::engine::EngineSettings;
use crate::runner::RetryPolicy;

use super::validation::ConfigError;

// =============================================================================
// Constants
// =============================================================================

/// Default HTTP port for the scrape endpoint.
pub const DEFAULT_PORT: u16 = 8090;

/// Default refresh cycle cadence (interval mode).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

pub use crate::engine::DEFAULT_DEVICE_MIN_INTERVAL;
pub use crate::exporter::DEFAULT_SCRAPE_TIMEOUT;

/// Default environment variable holding the device account username.
pub const DEFAULT_USERNAME_ENV: &str = "TAPO_USERNAME";

/// Default environment variable holding the device account password.
pub const DEFAULT_PASSWORD_ENV: &str = "TAPO_PASSWORD";

fn default_refresh_interval() -> Option<Duration> {
    Some(DEFAULT_REFRESH_INTERVAL)
}

fn default_device_min_interval() -> Duration {
    DEFAULT_DEVICE_MIN_INTERVAL
}

fn default_scrape_timeout() -> Duration {
    DEFAULT_SCRAPE_TIMEOUT
}

fn default_attempts() -> u32 {
    crate::runner::DEFAULT_ATTEMPTS
}

fn default_base_delay() -> Duration {
    crate::runner::DEFAULT_BASE_DELAY
}

fn default_max_delay() -> Duration {
    crate::runner::DEFAULT_MAX_DELAY
}

fn default_jitter() -> f64 {
    crate::runner::DEFAULT_JITTER
}

fn default_username_env() -> String {
    DEFAULT_USERNAME_ENV.to_string()
}

fn default_password_env() -> String {
    DEFAULT_PASSWORD_ENV.to_string()
}

// =============================================================================
// Server Configuration
// =============================================================================

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8090).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

// =============================================================================
// Exporter Configuration
// =============================================================================

/// Retry/backoff block for device update tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per device per cycle (default: 3).
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Delay before the first retry (default: 500ms).
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap on a single backoff delay (default: 30s).
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter fraction in [0, 1] (default: 0.3).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Convert to the runner's policy type.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }
}

/// Device backend selection.
///
/// The crate ships the simulated backend; production deployments embed the
/// library and register their own [`crate::device::DeviceFactory`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Backend {
    /// Simulated plugs, no network I/O.
    #[default]
    Sim,
}

/// Exporter/engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Static device address list, polled even when discovery finds nothing.
    pub devices: Vec<String>,

    /// Concurrent device updates per cycle; 0 means unbounded.
    pub concurrency: usize,

    /// Cycle cadence. Absent key: 15s. Explicit `null`: scrape-triggered
    /// mode, where each scrape runs one bounded refresh pass.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Option<Duration>,

    /// A device updated more recently than this is skipped for the cycle
    /// (default: 1s).
    #[serde(default = "default_device_min_interval", with = "humantime_serde")]
    pub device_min_interval: Duration,

    /// Bound on a scrape-triggered refresh pass (default: 2s).
    #[serde(default = "default_scrape_timeout", with = "humantime_serde")]
    pub scrape_timeout: Duration,

    /// Overall deadline per refresh cycle; unset means unbounded.
    #[serde(default, with = "humantime_serde")]
    pub cycle_timeout: Option<Duration>,

    /// Retry/backoff parameters.
    pub retry: RetryConfig,

    /// Drop a device from the polling set after this many consecutive
    /// failed cycles; unset retries indefinitely.
    pub drop_after_failures: Option<u32>,

    /// Discovery parameters.
    pub discovery: DiscoveryOptions,

    /// Environment variable resolved for the device account username.
    #[serde(default = "default_username_env")]
    pub username_env: String,

    /// Environment variable resolved for the device account password.
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Device backend.
    pub backend: Backend,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            concurrency: 0,
            refresh_interval: default_refresh_interval(),
            device_min_interval: DEFAULT_DEVICE_MIN_INTERVAL,
            scrape_timeout: DEFAULT_SCRAPE_TIMEOUT,
            cycle_timeout: None,
            retry: RetryConfig::default(),
            drop_after_failures: None,
            discovery: DiscoveryOptions::default(),
            username_env: default_username_env(),
            password_env: default_password_env(),
            backend: Backend::Sim,
        }
    }
}

impl ExporterConfig {
    /// Resolve device credentials from the configured environment variables.
    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::from_env(&self.username_env, &self.password_env)
    }

    /// Build the engine settings from this configuration.
    pub fn engine_settings(&self, credentials: Option<Credentials>) -> EngineSettings {
        EngineSettings {
            devices: self.devices.clone(),
            concurrency: self.concurrency,
            refresh_interval: self.refresh_interval,
            device_min_interval: self.device_min_interval,
            cycle_timeout: self.cycle_timeout,
            retry: self.retry.to_policy(),
            drop_after_failures: self.drop_after_failures,
            discovery: self.discovery.clone(),
            credentials,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Exporter/engine configuration.
    pub exporter: ExporterConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or
    /// validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::Validation(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;

        if self.server.port == 0 {
            return Err(ConfigError::Validation(
                "server port must be non-zero".to_string(),
            ));
        }

        let exporter = &self.exporter;
        if exporter.retry.attempts == 0 {
            return Err(ConfigError::Validation(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if exporter.retry.base_delay.is_zero() {
            return Err(ConfigError::Validation(
                "retry base_delay must be non-zero".to_string(),
            ));
        }
        if exporter.retry.max_delay < exporter.retry.base_delay {
            return Err(ConfigError::Validation(
                "retry max_delay must not be below base_delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&exporter.retry.jitter) {
            return Err(ConfigError::Validation(format!(
                "retry jitter must be within [0, 1], got {}",
                exporter.retry.jitter
            )));
        }
        if exporter.scrape_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "scrape_timeout must be non-zero".to_string(),
            ));
        }
        if exporter.devices.iter().any(|d| d.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "device list must not contain empty addresses".to_string(),
            ));
        }
        if exporter.discovery.enabled && exporter.discovery.packets == 0 {
            return Err(ConfigError::Validation(
                "discovery packets must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(
            config.exporter.refresh_interval,
            Some(DEFAULT_REFRESH_INTERVAL)
        );
        assert_eq!(config.exporter.backend, Backend::Sim);
    }

    #[test]
    fn test_load_yaml_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
server:
  bind: "127.0.0.1"
  port: 9400
exporter:
  devices: ["10.10.2.100", "10.10.2.101"]
  concurrency: 4
  refresh_interval: 30s
  device_min_interval: 5s
  retry:
    attempts: 5
    base_delay: 250ms
    max_delay: 10s
    jitter: 0.2
  discovery:
    enabled: false
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9400);
        assert_eq!(config.exporter.devices.len(), 2);
        assert_eq!(config.exporter.concurrency, 4);
        assert_eq!(
            config.exporter.refresh_interval,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.exporter.retry.attempts, 5);
        assert_eq!(config.exporter.retry.base_delay, Duration::from_millis(250));
        assert!(!config.exporter.discovery.enabled);
    }

    #[test]
    fn test_null_refresh_interval_selects_scrape_triggered_mode() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
exporter:
  refresh_interval: null
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.exporter.refresh_interval, None);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.server.bind = "not-an-ip".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.exporter.retry.attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.exporter.retry.jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.exporter.devices = vec!["10.0.0.1".to_string(), "".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_settings_conversion() {
        let mut config = AppConfig::default();
        config.exporter.devices = vec!["10.0.0.1".to_string()];
        config.exporter.concurrency = 8;
        config.exporter.drop_after_failures = Some(4);

        let settings = config.exporter.engine_settings(None);
        assert_eq!(settings.devices, vec!["10.0.0.1".to_string()]);
        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.drop_after_failures, Some(4));
        assert_eq!(settings.retry.attempts, 3);
    }
}
