//! Device capability interface.
//!
//! A [`PlugDevice`] wraps one networked smart plug: session management, a
//! queryable feature set and a metric read per refresh cycle. Concrete wire
//! protocols live outside the core; the crate ships a simulated backend in
//! [`sim`] for development and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::runner::ErrorClass;

pub mod sim;

/// Credentials for devices that require an authenticated session.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Account username.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl Credentials {
    /// Create credentials from username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Resolve credentials from a pair of environment variables.
    ///
    /// Returns `None` when neither variable is set.
    pub fn from_env(username_key: &str, password_key: &str) -> Option<Self> {
        let username = std::env::var(username_key).ok();
        let password = std::env::var(password_key).ok();
        if username.is_none() && password.is_none() {
            return None;
        }
        Some(Self {
            username: username.unwrap_or_default(),
            password: password.unwrap_or_default(),
        })
    }
}

// The password never appears in logs or debug dumps.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Static identity and metadata of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Network address; the device's identity throughout the system.
    pub host: String,
    /// Human-readable alias.
    pub alias: String,
    /// Hardware model, if reported.
    pub model: Option<String>,
    /// Device type string, if reported.
    pub device_type: Option<String>,
    /// Firmware version, if reported.
    pub firmware_version: Option<String>,
    /// Hardware version, if reported.
    pub hardware_version: Option<String>,
}

impl DeviceInfo {
    /// Minimal identity: host plus alias.
    pub fn new(host: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            alias: alias.into(),
            model: None,
            device_type: None,
            firmware_version: None,
            hardware_version: None,
        }
    }
}

/// Metric-producing capabilities a plug may expose.
///
/// Presence or absence of a capability is a runtime property of a device
/// instance, reported by [`PlugDevice::supported_features`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, EnumString, Display, AsRefStr, Hash,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Feature {
    /// Instantaneous power draw.
    CurrentConsumption,
    /// Mains voltage.
    Voltage,
    /// Mains current.
    Current,
    /// Energy consumed today.
    ConsumptionToday,
    /// Energy consumed this month.
    ConsumptionThisMonth,
    /// Wifi signal strength.
    Rssi,
}

impl Feature {
    /// Every feature, in export order.
    pub const ALL: [Feature; 6] = [
        Feature::CurrentConsumption,
        Feature::Voltage,
        Feature::Current,
        Feature::ConsumptionToday,
        Feature::ConsumptionThisMonth,
        Feature::Rssi,
    ];

    /// Name of the exported metric for this feature.
    pub fn metric_name(self) -> &'static str {
        match self {
            Feature::CurrentConsumption => "current_consumption",
            Feature::Voltage => "current_voltage",
            Feature::Current => "current_current",
            Feature::ConsumptionToday => "current_consumption_today",
            Feature::ConsumptionThisMonth => "current_month_consumption",
            Feature::Rssi => "current_rssi",
        }
    }

    /// Unit tag attached to cached readings.
    pub fn unit(self) -> &'static str {
        match self {
            Feature::CurrentConsumption => "W",
            Feature::Voltage => "V",
            Feature::Current => "A",
            Feature::ConsumptionToday | Feature::ConsumptionThisMonth => "Wh",
            Feature::Rssi => "dBm",
        }
    }

    /// Help text for the exported metric.
    pub fn help(self) -> &'static str {
        match self {
            Feature::CurrentConsumption => "Current consumption in watts",
            Feature::Voltage => "Current voltage in volts",
            Feature::Current => "Current current in amps",
            Feature::ConsumptionToday => "Energy consumed today in watt-hours",
            Feature::ConsumptionThisMonth => "Energy consumed this month in watt-hours",
            Feature::Rssi => "Current RSSI (Received Signal Strength Indicator)",
        }
    }

    /// Reverse lookup from an exported metric name.
    pub fn from_metric_name(name: &str) -> Option<Feature> {
        Feature::ALL.into_iter().find(|f| f.metric_name() == name)
    }
}

/// Errors raised by device operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device did not answer within the protocol deadline.
    #[error("device timed out: {0}")]
    Timeout(String),

    /// Network-level failure.
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    /// The authenticated session lapsed and must be re-established.
    #[error("session expired")]
    SessionExpired,

    /// The device rejected the supplied credentials.
    #[error("authentication rejected by device")]
    AuthRejected,

    /// The device speaks a protocol variant this backend cannot handle.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
}

impl DeviceError {
    /// Retry classification for the task runner. Unlisted error kinds are
    /// transient so a flaky device gets the full attempt budget.
    pub fn classify(&self) -> ErrorClass {
        match self {
            DeviceError::AuthRejected | DeviceError::UnsupportedProtocol(_) => ErrorClass::Terminal,
            DeviceError::Timeout(_) | DeviceError::Io(_) | DeviceError::SessionExpired => {
                ErrorClass::Transient
            }
        }
    }
}

/// Capability interface around one smart plug.
///
/// Connection/session state is owned exclusively by the instance; the engine
/// guarantees at most one update task per device at a time.
#[async_trait::async_trait]
pub trait PlugDevice: Send + Sync {
    /// Static identity and metadata.
    fn info(&self) -> DeviceInfo;

    /// Establish or refresh the device session. Idempotent; a lapsed session
    /// is re-established. Failures are transient-retryable unless the device
    /// rejects authentication outright.
    async fn connect_or_refresh_session(&self) -> Result<(), DeviceError>;

    /// Capabilities this device instance exposes.
    fn supported_features(&self) -> BTreeSet<Feature>;

    /// Read one value per supported feature for this cycle.
    async fn read_metrics(&self) -> Result<BTreeMap<Feature, f64>, DeviceError>;

    /// Close the device session. Idempotent.
    async fn disconnect(&self) -> Result<(), DeviceError>;
}

/// Constructs device adapters from an address and optional credentials.
///
/// There is exactly one adapter per address: the engine deduplicates by host
/// and never recreates an adapter that is still registered.
#[async_trait::async_trait]
pub trait DeviceFactory: Send + Sync {
    /// Build the adapter for `host`.
    async fn create(
        &self,
        host: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn PlugDevice>, DeviceError>;
}
