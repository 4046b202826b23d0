//! Last-known-good metric cache.
//!
//! The only resource shared between the polling side and the scrape side.
//! Writes are atomic per device (a whole-device replacement), readers get a
//! copy-on-read snapshot, so scrape latency is independent of device-poll
//! latency. A device or metric absent from the cache means "never
//! successfully read", not zero.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

/// One cached value for a (device, metric) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// The numeric value.
    pub value: f64,
    /// Unit tag, if known (`W`, `V`, `A`, `Wh`, `dBm`).
    pub unit: Option<&'static str>,
    /// When the value was captured from the device.
    pub taken_at: DateTime<Utc>,
}

/// All cached readings of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReadings {
    /// Human-readable alias at capture time.
    pub alias: String,
    /// Capture timestamp shared by every reading of the last update.
    pub taken_at: DateTime<Utc>,
    /// Readings keyed by exported metric name.
    pub readings: BTreeMap<String, Reading>,
}

/// One successful update cycle's output for one device, applied atomically.
#[derive(Debug, Clone)]
pub struct DeviceUpdate {
    /// Device identity (network address).
    pub host: String,
    /// Alias at capture time.
    pub alias: String,
    /// Capture timestamp stamped on every reading in this update.
    pub taken_at: DateTime<Utc>,
    values: BTreeMap<String, (f64, Option<&'static str>)>,
}

impl DeviceUpdate {
    /// Start an update captured now.
    pub fn new(host: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            alias: alias.into(),
            taken_at: Utc::now(),
            values: BTreeMap::new(),
        }
    }

    /// Add one metric value.
    pub fn with_value(
        mut self,
        metric: impl Into<String>,
        value: f64,
        unit: Option<&'static str>,
    ) -> Self {
        self.values.insert(metric.into(), (value, unit));
        self
    }

    /// Number of values carried.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the update carries no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Errors raised by cache writes.
///
/// Consistency violations are a programming-defect class: fatal to the
/// affected write only, surfaced to the caller, never silently dropped.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The write carried an invalid identity or value.
    #[error("cache consistency violation: {0}")]
    ConsistencyViolation(String),
}

/// Point-in-time view of every cached reading.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Device readings keyed by host.
    pub devices: BTreeMap<String, DeviceReadings>,
}

impl CacheSnapshot {
    /// Total readings across all devices.
    pub fn reading_count(&self) -> usize {
        self.devices.values().map(|d| d.readings.len()).sum()
    }
}

/// Per-device, per-metric last-known-good values.
///
/// Concurrency discipline: one logical writer per device at a time (enforced
/// by the refresh engine), any number of concurrent readers. Lock critical
/// sections only copy or swap map entries and never span device I/O.
#[derive(Default)]
pub struct MetricCache {
    inner: RwLock<HashMap<String, DeviceReadings>>,
}

impl MetricCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one device update atomically: after this call readers see
    /// either the device's previous readings or the full new set, never a
    /// mix.
    pub fn upsert_device(&self, update: DeviceUpdate) -> Result<(), CacheError> {
        if update.host.is_empty() {
            return Err(CacheError::ConsistencyViolation(
                "device update without a host identity".to_string(),
            ));
        }
        let mut readings = BTreeMap::new();
        for (metric, (value, unit)) in update.values {
            validate_reading(&update.host, &metric, value)?;
            readings.insert(
                metric,
                Reading {
                    value,
                    unit,
                    taken_at: update.taken_at,
                },
            );
        }

        let entry = DeviceReadings {
            alias: update.alias,
            taken_at: update.taken_at,
            readings,
        };
        self.inner.write().insert(update.host, entry);
        Ok(())
    }

    /// Point update of a single metric. The device entry is created on first
    /// write; the per-device timestamp is not advanced, so independently
    /// sourced metrics may be explicitly partially stale.
    pub fn upsert(
        &self,
        host: &str,
        alias: &str,
        metric: &str,
        reading: Reading,
    ) -> Result<(), CacheError> {
        if host.is_empty() {
            return Err(CacheError::ConsistencyViolation(
                "point update without a host identity".to_string(),
            ));
        }
        validate_reading(host, metric, reading.value)?;

        let mut inner = self.inner.write();
        let entry = inner
            .entry(host.to_string())
            .or_insert_with(|| DeviceReadings {
                alias: alias.to_string(),
                taken_at: reading.taken_at,
                readings: BTreeMap::new(),
            });
        entry.readings.insert(metric.to_string(), reading);
        Ok(())
    }

    /// Immutable point-in-time view of the whole cache. Never blocks on an
    /// in-progress refresh cycle beyond a map copy.
    pub fn snapshot(&self) -> CacheSnapshot {
        let inner = self.inner.read();
        CacheSnapshot {
            taken_at: Utc::now(),
            devices: inner
                .iter()
                .map(|(host, readings)| (host.clone(), readings.clone()))
                .collect(),
        }
    }

    /// Drop every cached reading of one device. Returns whether the device
    /// was present.
    pub fn evict(&self, host: &str) -> bool {
        self.inner.write().remove(host).is_some()
    }

    /// Number of devices with at least one cached reading.
    pub fn device_count(&self) -> usize {
        self.inner.read().len()
    }
}

fn validate_reading(host: &str, metric: &str, value: f64) -> Result<(), CacheError> {
    if metric.is_empty() {
        return Err(CacheError::ConsistencyViolation(format!(
            "empty metric name for device {host}"
        )));
    }
    if !value.is_finite() {
        return Err(CacheError::ConsistencyViolation(format!(
            "non-finite value for {host}/{metric}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn update(host: &str, watts: f64) -> DeviceUpdate {
        DeviceUpdate::new(host, format!("alias-{host}"))
            .with_value("current_consumption", watts, Some("W"))
            .with_value("current_voltage", 230.0, Some("V"))
    }

    #[test]
    fn test_upsert_and_snapshot_round_trip() {
        let cache = MetricCache::new();
        cache.upsert_device(update("10.0.0.1", 12.5)).unwrap();

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.devices.len(), 1);
        let entry = &snapshot.devices["10.0.0.1"];
        assert_eq!(entry.alias, "alias-10.0.0.1");
        assert_eq!(entry.readings["current_consumption"].value, 12.5);
        assert_eq!(entry.readings["current_consumption"].unit, Some("W"));
        assert_eq!(snapshot.reading_count(), 2);
    }

    #[test]
    fn test_absent_device_means_never_read() {
        let cache = MetricCache::new();
        cache.upsert_device(update("10.0.0.1", 1.0)).unwrap();

        let snapshot = cache.snapshot();
        assert!(!snapshot.devices.contains_key("10.0.0.2"));
        assert_eq!(cache.device_count(), 1);
    }

    #[test]
    fn test_device_update_replaces_whole_entry() {
        let cache = MetricCache::new();
        cache
            .upsert_device(
                DeviceUpdate::new("10.0.0.1", "desk")
                    .with_value("current_consumption", 5.0, Some("W"))
                    .with_value("current_rssi", -40.0, Some("dBm")),
            )
            .unwrap();

        // The second update carries fewer metrics; stale leftovers from the
        // first must not survive.
        cache
            .upsert_device(
                DeviceUpdate::new("10.0.0.1", "desk").with_value(
                    "current_consumption",
                    7.0,
                    Some("W"),
                ),
            )
            .unwrap();

        let snapshot = cache.snapshot();
        let entry = &snapshot.devices["10.0.0.1"];
        assert_eq!(entry.readings.len(), 1);
        assert_eq!(entry.readings["current_consumption"].value, 7.0);
    }

    #[test]
    fn test_readings_of_one_update_share_timestamp() {
        let cache = MetricCache::new();
        cache.upsert_device(update("10.0.0.1", 3.0)).unwrap();

        let snapshot = cache.snapshot();
        let entry = &snapshot.devices["10.0.0.1"];
        for reading in entry.readings.values() {
            assert_eq!(reading.taken_at, entry.taken_at);
        }
    }

    #[test]
    fn test_evict_removes_device() {
        let cache = MetricCache::new();
        cache.upsert_device(update("10.0.0.1", 3.0)).unwrap();

        assert!(cache.evict("10.0.0.1"));
        assert!(!cache.evict("10.0.0.1"));
        assert!(cache.snapshot().devices.is_empty());
    }

    #[test]
    fn test_consistency_violations_are_surfaced() {
        let cache = MetricCache::new();

        let no_host = DeviceUpdate::new("", "x").with_value("m", 1.0, None);
        assert!(matches!(
            cache.upsert_device(no_host),
            Err(CacheError::ConsistencyViolation(_))
        ));

        let bad_metric = DeviceUpdate::new("10.0.0.1", "x").with_value("", 1.0, None);
        assert!(cache.upsert_device(bad_metric).is_err());

        let bad_value = DeviceUpdate::new("10.0.0.1", "x").with_value("m", f64::NAN, None);
        assert!(cache.upsert_device(bad_value).is_err());

        // Nothing landed.
        assert_eq!(cache.device_count(), 0);
    }

    #[test]
    fn test_point_update_creates_entry() {
        let cache = MetricCache::new();
        cache
            .upsert(
                "10.0.0.1",
                "desk",
                "current_rssi",
                Reading {
                    value: -61.0,
                    unit: Some("dBm"),
                    taken_at: Utc::now(),
                },
            )
            .unwrap();

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.devices["10.0.0.1"].readings["current_rssi"].value, -61.0);
    }

    #[test]
    fn test_snapshot_never_sees_torn_device_entry() {
        let cache = Arc::new(MetricCache::new());
        let writer_cache = Arc::clone(&cache);

        let writer = std::thread::spawn(move || {
            for i in 0..200 {
                writer_cache
                    .upsert_device(update("10.0.0.1", i as f64))
                    .unwrap();
            }
        });

        for _ in 0..200 {
            let snapshot = cache.snapshot();
            if let Some(entry) = snapshot.devices.get("10.0.0.1") {
                // Both metrics of an update are written atomically and must
                // carry the same capture timestamp in any snapshot.
                assert_eq!(
                    entry.readings["current_consumption"].taken_at,
                    entry.readings["current_voltage"].taken_at,
                );
            }
        }
        writer.join().unwrap();
    }
}
