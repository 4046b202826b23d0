//! Simulated plug backend.
//!
//! Implements [`PlugDevice`], [`DeviceFactory`] and [`Discovery`] without any
//! network I/O. The default binary backend runs on it, and tests use its
//! failure injection to exercise the refresh engine: flaky sessions, devices
//! that always time out, auth rejection, and devices that never answer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::device::{Credentials, DeviceError, DeviceFactory, DeviceInfo, Feature, PlugDevice};
use crate::discovery::{DiscoveredDevice, Discovery, DiscoveryError, DiscoveryOptions};

/// How a simulated plug responds to session and read calls.
#[derive(Debug, Clone)]
pub enum SimBehavior {
    /// Every call succeeds.
    Healthy,
    /// The next `failures` session calls fail with an expired session, then
    /// the device recovers.
    FlakyThenOk {
        /// Remaining failures before recovery.
        failures: u32,
    },
    /// Every call fails with a timeout.
    AlwaysTimeout,
    /// Reads succeed after a fixed delay.
    Slow {
        /// Added latency per metric read.
        delay: std::time::Duration,
    },
    /// Every session call is rejected with an auth error.
    AuthReject,
    /// Calls never complete; only cooperative cancellation ends them.
    NeverReturns,
}

/// A simulated smart plug with injectable failure modes.
pub struct SimPlug {
    info: DeviceInfo,
    features: BTreeSet<Feature>,
    behavior: Mutex<SimBehavior>,
    readings: Mutex<BTreeMap<Feature, f64>>,
    connected: AtomicBool,
    session_calls: AtomicU32,
    read_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    reads_in_flight: AtomicUsize,
    peak_reads_in_flight: AtomicUsize,
}

impl SimPlug {
    /// A healthy plug exposing the full feature set with plausible values.
    pub fn new(host: impl Into<String>, alias: impl Into<String>) -> Self {
        let mut info = DeviceInfo::new(host, alias);
        info.model = Some("SIM110".to_string());
        info.device_type = Some("plug".to_string());
        info.firmware_version = Some("1.3.0".to_string());
        info.hardware_version = Some("1.0".to_string());

        let readings = BTreeMap::from([
            (Feature::CurrentConsumption, 42.5),
            (Feature::Voltage, 230.1),
            (Feature::Current, 0.185),
            (Feature::ConsumptionToday, 118.0),
            (Feature::ConsumptionThisMonth, 3642.0),
            (Feature::Rssi, -52.0),
        ]);

        Self {
            info,
            features: Feature::ALL.into_iter().collect(),
            behavior: Mutex::new(SimBehavior::Healthy),
            readings: Mutex::new(readings),
            connected: AtomicBool::new(false),
            session_calls: AtomicU32::new(0),
            read_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            reads_in_flight: AtomicUsize::new(0),
            peak_reads_in_flight: AtomicUsize::new(0),
        }
    }

    /// Set the failure behavior.
    pub fn with_behavior(self, behavior: SimBehavior) -> Self {
        *self.behavior.lock() = behavior;
        self
    }

    /// Restrict the exposed feature set.
    pub fn with_features(mut self, features: impl IntoIterator<Item = Feature>) -> Self {
        self.features = features.into_iter().collect();
        self
    }

    /// Override one reading.
    pub fn with_reading(self, feature: Feature, value: f64) -> Self {
        self.readings.lock().insert(feature, value);
        self
    }

    /// Change behavior on a live plug.
    pub fn set_behavior(&self, behavior: SimBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Change one reading on a live plug.
    pub fn set_reading(&self, feature: Feature, value: f64) {
        self.readings.lock().insert(feature, value);
    }

    /// Session calls observed so far.
    pub fn session_calls(&self) -> u32 {
        self.session_calls.load(Ordering::SeqCst)
    }

    /// Metric reads observed so far.
    pub fn read_calls(&self) -> u32 {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Disconnect calls observed so far.
    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent metric reads observed. Per-device this
    /// must never exceed 1 under the engine's single-writer discipline.
    pub fn peak_concurrent_reads(&self) -> usize {
        self.peak_reads_in_flight.load(Ordering::SeqCst)
    }

    /// Whether the plug currently holds a session.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PlugDevice for SimPlug {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    async fn connect_or_refresh_session(&self) -> Result<(), DeviceError> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();
        match behavior {
            SimBehavior::Healthy | SimBehavior::Slow { .. } => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            SimBehavior::FlakyThenOk { failures } => {
                if failures > 0 {
                    *self.behavior.lock() = SimBehavior::FlakyThenOk {
                        failures: failures - 1,
                    };
                    Err(DeviceError::SessionExpired)
                } else {
                    self.connected.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }
            SimBehavior::AlwaysTimeout => {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Err(DeviceError::Timeout(self.info.host.clone()))
            }
            SimBehavior::AuthReject => Err(DeviceError::AuthRejected),
            SimBehavior::NeverReturns => std::future::pending().await,
        }
    }

    fn supported_features(&self) -> BTreeSet<Feature> {
        self.features.clone()
    }

    async fn read_metrics(&self) -> Result<BTreeMap<Feature, f64>, DeviceError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_reads_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = async {
            let behavior = self.behavior.lock().clone();
            match behavior {
                SimBehavior::AlwaysTimeout => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Err(DeviceError::Timeout(self.info.host.clone()))
                }
                SimBehavior::AuthReject => Err(DeviceError::AuthRejected),
                SimBehavior::NeverReturns => std::future::pending().await,
                SimBehavior::Healthy
                | SimBehavior::FlakyThenOk { .. }
                | SimBehavior::Slow { .. } => {
                    if let SimBehavior::Slow { delay } = behavior {
                        tokio::time::sleep(delay).await;
                    }
                    if !self.connected.load(Ordering::SeqCst) {
                        return Err(DeviceError::SessionExpired);
                    }
                    let readings = self.readings.lock();
                    Ok(readings
                        .iter()
                        .filter(|(feature, _)| self.features.contains(*feature))
                        .map(|(feature, value)| (*feature, *value))
                        .collect())
                }
            }
        }
        .await;

        self.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Simulated device factory and discovery collaborator.
///
/// Plugs registered up front keep their injected behavior; unknown hosts get
/// a healthy plug on first `create`, so a static device list works without
/// prior registration.
#[derive(Default)]
pub struct SimBackend {
    plugs: Mutex<HashMap<String, Arc<SimPlug>>>,
    advertised: Mutex<Vec<DiscoveredDevice>>,
    discovery_down: AtomicBool,
}

impl SimBackend {
    /// Empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a preconfigured plug; returns the shared handle.
    pub fn register(&self, plug: SimPlug) -> Arc<SimPlug> {
        let plug = Arc::new(plug);
        self.plugs
            .lock()
            .insert(plug.info.host.clone(), Arc::clone(&plug));
        plug
    }

    /// Make a host show up in broadcast discovery results.
    pub fn advertise(&self, host: impl Into<String>, alias: Option<String>) {
        self.advertised
            .lock()
            .push(DiscoveredDevice::new(host, alias));
    }

    /// Force discovery runs to fail.
    pub fn set_discovery_down(&self, down: bool) {
        self.discovery_down.store(down, Ordering::SeqCst);
    }

    /// Handle to a registered plug.
    pub fn plug(&self, host: &str) -> Option<Arc<SimPlug>> {
        self.plugs.lock().get(host).cloned()
    }
}

#[async_trait::async_trait]
impl DeviceFactory for SimBackend {
    async fn create(
        &self,
        host: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn PlugDevice>, DeviceError> {
        let mut plugs = self.plugs.lock();
        let plug = plugs
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(SimPlug::new(host, format!("plug-{host}"))));
        Ok(Arc::clone(plug) as Arc<dyn PlugDevice>)
    }
}

#[async_trait::async_trait]
impl Discovery for SimBackend {
    async fn discover(
        &self,
        options: &DiscoveryOptions,
    ) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        if self.discovery_down.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Timeout(options.timeout));
        }
        Ok(self.advertised.lock().clone())
    }

    async fn discover_single(
        &self,
        host: &str,
        _options: &DiscoveryOptions,
    ) -> Result<Option<DiscoveredDevice>, DiscoveryError> {
        if self.discovery_down.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self
            .plugs
            .lock()
            .get(host)
            .map(|plug| DiscoveredDevice::new(&plug.info.host, Some(plug.info.alias.clone()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flaky_plug_recovers_after_failures() {
        let plug = SimPlug::new("10.0.0.9", "desk").with_behavior(SimBehavior::FlakyThenOk {
            failures: 2,
        });

        assert!(plug.connect_or_refresh_session().await.is_err());
        assert!(plug.connect_or_refresh_session().await.is_err());
        assert!(plug.connect_or_refresh_session().await.is_ok());
        assert_eq!(plug.session_calls(), 3);
        assert!(plug.is_connected());
    }

    #[tokio::test]
    async fn test_read_requires_session() {
        let plug = SimPlug::new("10.0.0.9", "desk");
        assert!(matches!(
            plug.read_metrics().await,
            Err(DeviceError::SessionExpired)
        ));

        plug.connect_or_refresh_session().await.unwrap();
        let readings = plug.read_metrics().await.unwrap();
        assert_eq!(readings.len(), Feature::ALL.len());
    }

    #[tokio::test]
    async fn test_feature_subset_limits_readings() {
        let plug = SimPlug::new("10.0.0.9", "desk").with_features([Feature::Rssi]);
        plug.connect_or_refresh_session().await.unwrap();

        let readings = plug.read_metrics().await.unwrap();
        assert_eq!(readings.len(), 1);
        assert!(readings.contains_key(&Feature::Rssi));
    }

    #[tokio::test]
    async fn test_backend_creates_unknown_hosts_on_demand() {
        let backend = SimBackend::new();
        let device = backend.create("10.0.0.77", None).await.unwrap();
        assert_eq!(device.info().host, "10.0.0.77");
        assert!(backend.plug("10.0.0.77").is_some());
    }

    #[tokio::test]
    async fn test_discovery_failure_injection() {
        let backend = SimBackend::new();
        backend.advertise("10.0.0.5", Some("kitchen".to_string()));

        let found = backend.discover(&DiscoveryOptions::default()).await.unwrap();
        assert_eq!(found.len(), 1);

        backend.set_discovery_down(true);
        assert!(backend.discover(&DiscoveryOptions::default()).await.is_err());
    }
}
