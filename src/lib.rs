//! Plugwatch - Smart Plug Telemetry Exporter
//!
//! This crate exports operational telemetry from networked smart plugs to a
//! Prometheus scrape endpoint. Slow, flaky device I/O is decoupled from fast
//! metric reads by a background refresh engine feeding a last-known-good
//! cache.
//!
//! # Architecture
//!
//! - **Runner**: concurrent task execution with an admission gate, per-task
//!   retry with exponential backoff/jitter, and partial-failure isolation
//! - **Devices**: capability traits around one plug (session, feature set,
//!   metric read); the wire protocol is pluggable, a simulated backend ships
//!   in [`device::sim`]
//! - **Cache**: per-device last-known-good readings with atomic writes and
//!   copy-on-read snapshots
//! - **Engine**: the refresh scheduler that owns the device set, merges
//!   discovery results, and runs cycles on an interval or per scrape
//! - **Exporter/Server**: the scrape-facing adapter and its axum routes
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use plugwatch::device::sim::SimBackend;
//! use plugwatch::{DeviceFactory, Discovery, EngineSettings, MetricCache, RefreshEngine};
//!
//! # async fn run() {
//! let backend = Arc::new(SimBackend::new());
//! let settings = EngineSettings {
//!     devices: vec!["10.10.2.100".to_string()],
//!     ..EngineSettings::default()
//! };
//! let engine = RefreshEngine::new(
//!     settings,
//!     Arc::new(MetricCache::new()),
//!     Arc::clone(&backend) as Arc<dyn DeviceFactory>,
//!     backend as Arc<dyn Discovery>,
//! );
//! engine.initialize().await;
//! engine.run_cycle().await;
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod device;
pub mod discovery;
pub mod engine;
pub mod exporter;
pub mod runner;
pub mod server;

pub use cache::{CacheSnapshot, MetricCache};
pub use config::AppConfig;
pub use device::{Credentials, DeviceError, DeviceFactory, Feature, PlugDevice};
pub use discovery::{DiscoveredDevice, Discovery};
pub use engine::{CycleSummary, EngineSettings, EngineState, RefreshEngine};
pub use exporter::PlugExporter;
pub use runner::{ErrorClass, RetryPolicy, TaskRunner, TaskSpec};
