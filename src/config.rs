//! Configuration for the exporter runtime.
//!
//! YAML-based configuration loading and validation for:
//! - Server settings (bind address, port)
//! - Exporter settings (device list, refresh cadence, retry/backoff,
//!   discovery, credentials resolution)
//!
//! Configuration is immutable for the process lifetime; there is no hot
//! reload.

mod app;
mod validation;

pub use app::{
    AppConfig, Backend, DEFAULT_PORT, DEFAULT_REFRESH_INTERVAL, ExporterConfig, RetryConfig,
    ServerConfig,
};
pub use validation::ConfigError;
