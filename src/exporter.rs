//! Prometheus collector adapter.
//!
//! The object the scrape handler calls. Reads only the metric cache (in
//! scrape-triggered mode after one bounded on-demand refresh) and renders
//! text exposition deterministically from the snapshot. Never blocks on
//! device I/O beyond the configured scrape timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::cache::CacheSnapshot;
use crate::device::Feature;
use crate::engine::RefreshEngine;

/// Default bound on a scrape-triggered refresh.
pub const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(2);

/// Gauge counting devices in the polling set.
const DISCOVERED_DEVICES_METRIC: &str = "plugwatch_discovered_devices";

/// Gauge carrying each device's last successful capture time.
const READING_TIMESTAMP_METRIC: &str = "plugwatch_reading_timestamp_seconds";

/// Errors raised while rendering a scrape.
#[derive(Debug, Error)]
pub enum ExporterError {
    /// Metric registration or encoding failed.
    #[error("exposition error: {0}")]
    Exposition(#[from] prometheus::Error),

    /// The encoded payload was not valid UTF-8.
    #[error("encoded metrics were not valid UTF-8")]
    Encoding,
}

/// Scrape-facing adapter over the refresh engine and its cache.
pub struct PlugExporter {
    engine: Arc<RefreshEngine>,
    scrape_timeout: Duration,
    cleaned_up: AtomicBool,
}

impl PlugExporter {
    /// Create an exporter over `engine`.
    pub fn new(engine: Arc<RefreshEngine>, scrape_timeout: Duration) -> Self {
        Self {
            engine,
            scrape_timeout,
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// Serve one scrape.
    ///
    /// Interval mode reads the cache directly. Scrape-triggered mode first
    /// runs one refresh pass bounded by the scrape timeout; if the pass
    /// cannot finish in time the previous cached values are served instead.
    pub async fn scrape(&self) -> Result<String, ExporterError> {
        if !self.engine.interval_mode() {
            if self.engine.refresh_now(self.scrape_timeout).await.is_none() {
                tracing::debug!("Scrape refresh timed out; serving cached readings");
            }
        }

        let snapshot = self.engine.cache().snapshot();
        let device_count = self.engine.device_count().await;
        render(&snapshot, device_count)
    }

    /// Release device sessions. Invoked once during shutdown; additional
    /// calls are no-ops.
    pub async fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            tracing::debug!("Cleanup already performed");
            return;
        }
        tracing::info!("Cleaning up exporter");
        self.engine.shutdown().await;
    }

    /// The engine behind this exporter.
    pub fn engine(&self) -> &Arc<RefreshEngine> {
        &self.engine
    }
}

/// Render a snapshot as Prometheus text exposition.
///
/// Emission is deterministic: families and label sets come out in BTreeMap
/// order, and no sample is produced for a metric that was never successfully
/// read.
fn render(snapshot: &CacheSnapshot, device_count: usize) -> Result<String, ExporterError> {
    let registry = Registry::new();

    let discovered = Gauge::new(
        DISCOVERED_DEVICES_METRIC,
        "Number of devices in the polling set",
    )?;
    discovered.set(device_count as f64);
    registry.register(Box::new(discovered))?;

    let timestamps = GaugeVec::new(
        Opts::new(
            READING_TIMESTAMP_METRIC,
            "Unix time of the device's last successful update",
        ),
        &["host", "alias"],
    )?;

    // One gauge family per metric name present in the snapshot.
    let mut families: BTreeMap<&str, GaugeVec> = BTreeMap::new();
    for device in snapshot.devices.values() {
        for metric in device.readings.keys() {
            if families.contains_key(metric.as_str()) {
                continue;
            }
            let help = Feature::from_metric_name(metric)
                .map(Feature::help)
                .unwrap_or("Device reading");
            let family = GaugeVec::new(Opts::new(metric.as_str(), help), &["host", "alias"])?;
            registry.register(Box::new(family.clone()))?;
            families.insert(metric.as_str(), family);
        }
    }

    let mut any_device = false;
    for (host, device) in &snapshot.devices {
        any_device = true;
        timestamps
            .with_label_values(&[host.as_str(), device.alias.as_str()])
            .set(device.taken_at.timestamp() as f64);
        for (metric, reading) in &device.readings {
            if let Some(family) = families.get(metric.as_str()) {
                family
                    .with_label_values(&[host.as_str(), device.alias.as_str()])
                    .set(reading.value);
            }
        }
    }
    if any_device {
        registry.register(Box::new(timestamps))?;
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| ExporterError::Encoding)
}
