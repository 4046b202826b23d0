//! Device discovery collaborator boundary.
//!
//! The engine treats discovery as an external capability: a broadcast sweep
//! plus a targeted probe for statically configured hosts the sweep missed.
//! Discovery failure is never fatal; the engine falls back to the static
//! device list.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default broadcast target.
pub const DEFAULT_TARGET: &str = "255.255.255.255";

/// Default discovery timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of discovery packets per sweep.
pub const DEFAULT_PACKETS: u32 = 3;

fn default_enabled() -> bool {
    true
}

fn default_target() -> String {
    DEFAULT_TARGET.to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_packets() -> u32 {
    DEFAULT_PACKETS
}

/// Network parameters for a discovery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryOptions {
    /// Whether to perform the broadcast sweep at all (default: true).
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Broadcast target address (default: `255.255.255.255`).
    #[serde(default = "default_target")]
    pub target: String,
    /// Per-run timeout (default: 5s).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Discovery packets to send per sweep (default: 3).
    #[serde(default = "default_packets")]
    pub packets: u32,
    /// Network interface to bind, if not the default.
    #[serde(default)]
    pub interface: Option<String>,
    /// Discovery port override.
    #[serde(default)]
    pub port: Option<u16>,
    /// Re-run the sweep after this long; `None` discovers only at startup.
    #[serde(default, with = "humantime_serde")]
    pub rediscovery_interval: Option<Duration>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            target: default_target(),
            timeout: DEFAULT_TIMEOUT,
            packets: DEFAULT_PACKETS,
            interface: None,
            port: None,
            rediscovery_interval: None,
        }
    }
}

/// A device surfaced by a discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Network address of the device.
    pub host: String,
    /// Identity advertised by the device, if any.
    pub advertised_alias: Option<String>,
}

impl DiscoveredDevice {
    /// Create a discovery result entry.
    pub fn new(host: impl Into<String>, advertised_alias: Option<String>) -> Self {
        Self {
            host: host.into(),
            advertised_alias,
        }
    }
}

/// Errors raised by a discovery run. Always non-fatal to the refresh engine.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Socket-level failure during the sweep.
    #[error("discovery I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The sweep ran past its deadline without completing.
    #[error("discovery timed out after {0:?}")]
    Timeout(Duration),

    /// The collaborator is misconfigured (bad target, bad interface).
    #[error("discovery configuration error: {0}")]
    Config(String),
}

/// Discovery capability consumed by the refresh engine.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    /// Broadcast sweep: every device that answered within the timeout.
    /// An empty result is valid.
    async fn discover(
        &self,
        options: &DiscoveryOptions,
    ) -> Result<Vec<DiscoveredDevice>, DiscoveryError>;

    /// Targeted probe for one host that the broadcast sweep did not reach
    /// (devices on separate VLANs commonly miss the sweep).
    async fn discover_single(
        &self,
        host: &str,
        options: &DiscoveryOptions,
    ) -> Result<Option<DiscoveredDevice>, DiscoveryError>;
}
