//! Background refresh engine.
//!
//! Owns the device set (static list plus discovered devices), drives the
//! retrying task runner once per refresh cycle, and writes successful
//! readings into the metric cache. Runs either on a fixed cadence (interval
//! mode) or on demand per scrape (scrape-triggered mode).
//!
//! The interval is measured from cycle *end*: a slow cycle delays the next
//! one instead of overlapping it, so the single-writer-per-device discipline
//! holds without further locking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use strum_macros::Display;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{DeviceUpdate, MetricCache};
use crate::device::{Credentials, DeviceError, DeviceFactory, Feature, PlugDevice};
use crate::discovery::{Discovery, DiscoveryOptions};
use crate::runner::{RetryPolicy, TaskFailure, TaskRunner, TaskSpec};

/// Default per-device minimum update interval.
pub const DEFAULT_DEVICE_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EngineState {
    /// Building the device set from the static list.
    Initializing,
    /// Merging in devices from the discovery collaborator.
    Discovering,
    /// A refresh cycle is in flight.
    Updating,
    /// Waiting for the next scheduled cycle (interval mode only).
    Idle,
    /// Cancelling in-flight work and releasing device sessions.
    ShuttingDown,
    /// Terminal state; no further cycles run.
    Stopped,
}

/// Engine parameters, immutable for the engine's lifetime.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Static device address list.
    pub devices: Vec<String>,
    /// Concurrent device tasks per cycle; 0 means unbounded.
    pub concurrency: usize,
    /// Cycle cadence; `None` selects scrape-triggered mode.
    pub refresh_interval: Option<Duration>,
    /// A device updated more recently than this is skipped for the cycle.
    pub device_min_interval: Duration,
    /// Overall deadline per cycle; outstanding tasks are cancelled
    /// cooperatively when it elapses.
    pub cycle_timeout: Option<Duration>,
    /// Retry/backoff parameters for device update tasks.
    pub retry: RetryPolicy,
    /// Remove a device from the polling set after this many consecutive
    /// failed cycles; `None` retries indefinitely.
    pub drop_after_failures: Option<u32>,
    /// Discovery parameters.
    pub discovery: DiscoveryOptions,
    /// Credentials handed to the device factory.
    pub credentials: Option<Credentials>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            concurrency: 0,
            refresh_interval: Some(Duration::from_secs(15)),
            device_min_interval: DEFAULT_DEVICE_MIN_INTERVAL,
            cycle_timeout: None,
            retry: RetryPolicy::default(),
            drop_after_failures: None,
            discovery: DiscoveryOptions::default(),
            credentials: None,
        }
    }
}

/// One device's registration in the polling set.
struct DeviceSlot {
    adapter: Arc<dyn PlugDevice>,
    last_success: Option<Instant>,
    consecutive_failures: u32,
}

/// A device update that failed for the cycle.
#[derive(Debug, Clone)]
pub struct CycleFailure {
    /// Device identity.
    pub host: String,
    /// Attempts consumed before giving up.
    pub attempts: u32,
    /// Rendered final error.
    pub error: String,
    /// Whether the error was terminal (no retries were attempted).
    pub terminal: bool,
}

/// Outcome of one refresh cycle. Always terminal: every launched task
/// settled as success, failure or cancellation.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    /// Monotonic cycle sequence number.
    pub seq: u64,
    /// Devices in the polling set when the cycle started.
    pub total_devices: usize,
    /// Devices whose readings were written to the cache.
    pub updated: usize,
    /// Devices skipped by the minimum-update-interval guard.
    pub skipped_recent: usize,
    /// Devices skipped for lacking the current-consumption capability.
    pub skipped_no_feature: usize,
    /// Devices cancelled by the cycle deadline or shutdown.
    pub cancelled: usize,
    /// Per-device failures for the cycle.
    pub failures: Vec<CycleFailure>,
    /// Wall-clock duration of the cycle.
    pub elapsed: Duration,
}

/// Result of one device update task.
enum DeviceOutcome {
    /// Readings written to the cache.
    Updated,
    /// Device lacks the required capability; nothing written, not an error.
    NoFeature,
    /// The cache rejected the write (consistency violation, already logged).
    WriteRejected,
}

/// The refresh scheduler.
pub struct RefreshEngine {
    settings: EngineSettings,
    cache: Arc<MetricCache>,
    factory: Arc<dyn DeviceFactory>,
    discovery: Arc<dyn Discovery>,
    devices: Mutex<HashMap<String, DeviceSlot>>,
    state: parking_lot::Mutex<EngineState>,
    cycle_seq: AtomicU64,
    // Serializes refresh cycles so concurrent scrape-triggered refreshes
    // never race one device.
    cycle_gate: Mutex<()>,
    last_discovery: parking_lot::Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl RefreshEngine {
    /// Create an engine over the given collaborators. Call
    /// [`initialize`](Self::initialize) before the first cycle.
    pub fn new(
        settings: EngineSettings,
        cache: Arc<MetricCache>,
        factory: Arc<dyn DeviceFactory>,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        Self {
            settings,
            cache,
            factory,
            discovery,
            devices: Mutex::new(HashMap::new()),
            state: parking_lot::Mutex::new(EngineState::Initializing),
            cycle_seq: AtomicU64::new(0),
            cycle_gate: Mutex::new(()),
            last_discovery: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Whether the engine runs its own interval loop.
    pub fn interval_mode(&self) -> bool {
        self.settings.refresh_interval.is_some()
    }

    /// Devices currently in the polling set.
    pub async fn device_count(&self) -> usize {
        self.devices.lock().await.len()
    }

    /// The shared metric cache.
    pub fn cache(&self) -> &Arc<MetricCache> {
        &self.cache
    }

    fn set_state(&self, next: EngineState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(from = %*state, to = %next, "Engine state transition");
            *state = next;
        }
    }

    /// Build the device set: static list first, then the discovery merge.
    /// Per-device and discovery failures are logged, never fatal.
    pub async fn initialize(&self) {
        self.set_state(EngineState::Initializing);
        self.run_discovery().await;

        let count = self.device_count().await;
        if count == 0 {
            tracing::warn!("No devices registered; nothing will be polled");
        } else {
            tracing::info!(devices = count, "Device set initialized");
        }
    }

    /// Run the discovery sweep and merge results into the device set,
    /// deduplicated by address. Static hosts the sweep missed get a
    /// targeted probe. Any failure falls back to the static list.
    async fn run_discovery(&self) {
        self.set_state(EngineState::Discovering);
        let opts = &self.settings.discovery;

        let mut found = Vec::new();
        if opts.enabled {
            match self.discovery.discover(opts).await {
                Ok(devices) => {
                    tracing::debug!(count = devices.len(), "Discovery sweep finished");
                    found = devices;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Discovery failed; using static device list");
                }
            }
        }

        let swept: HashSet<String> = found.iter().map(|d| d.host.clone()).collect();
        for host in &self.settings.devices {
            if swept.contains(host.as_str()) {
                tracing::debug!(host = %host, "Device already discovered");
                continue;
            }
            if !opts.enabled {
                continue;
            }
            match self.discovery.discover_single(host, opts).await {
                Ok(Some(device)) => {
                    tracing::info!(host = %host, "Discovered configured device directly");
                    found.push(device);
                }
                Ok(None) => {
                    tracing::warn!(host = %host, "Device not found during discovery");
                }
                Err(e) => {
                    tracing::warn!(host = %host, error = %e, "Targeted discovery failed");
                }
            }
        }

        let mut hosts: Vec<String> = self.settings.devices.clone();
        hosts.extend(found.into_iter().map(|d| d.host));
        for host in hosts {
            self.ensure_device(&host).await;
        }

        *self.last_discovery.lock() = Some(Instant::now());
    }

    /// Register the adapter for `host` if it is not already present. Never
    /// recreates an existing adapter.
    async fn ensure_device(&self, host: &str) {
        let mut devices = self.devices.lock().await;
        if devices.contains_key(host) {
            return;
        }
        match self
            .factory
            .create(host, self.settings.credentials.as_ref())
            .await
        {
            Ok(adapter) => {
                tracing::info!(host = %host, alias = %adapter.info().alias, "Device registered");
                devices.insert(
                    host.to_string(),
                    DeviceSlot {
                        adapter,
                        last_success: None,
                        consecutive_failures: 0,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "Could not create device adapter");
            }
        }
    }

    /// Re-run discovery when the configured rediscovery interval elapsed.
    async fn maybe_rediscover(&self) {
        let Some(interval) = self.settings.discovery.rediscovery_interval else {
            return;
        };
        let due = self
            .last_discovery
            .lock()
            .is_none_or(|at| at.elapsed() >= interval);
        if due {
            self.run_discovery().await;
        }
    }

    /// Run one refresh cycle bounded by the configured cycle timeout.
    pub async fn run_cycle(&self) -> CycleSummary {
        self.run_cycle_bounded(self.settings.cycle_timeout).await
    }

    /// Run one refresh cycle on demand, bounded by `timeout` end to end
    /// (including any wait for an already-running cycle). Returns `None`
    /// when the deadline elapsed before the cycle could finish; whatever the
    /// cycle wrote before the deadline stays in the cache.
    pub async fn refresh_now(&self, timeout: Duration) -> Option<CycleSummary> {
        match tokio::time::timeout(timeout, self.run_cycle_bounded(Some(timeout))).await {
            Ok(summary) => Some(summary),
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64,
                    "On-demand refresh hit the scrape deadline");
                None
            }
        }
    }

    async fn run_cycle_bounded(&self, deadline: Option<Duration>) -> CycleSummary {
        let _cycle = self.cycle_gate.lock().await;
        self.maybe_rediscover().await;

        let seq = self.cycle_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(EngineState::Updating);
        let started = Instant::now();

        // Partition the device set under the lock, then poll without it.
        let mut summary = CycleSummary {
            seq,
            ..CycleSummary::default()
        };
        let to_poll: Vec<(String, Arc<dyn PlugDevice>)> = {
            let devices = self.devices.lock().await;
            summary.total_devices = devices.len();
            devices
                .iter()
                .filter(|(host, slot)| {
                    let recent = slot
                        .last_success
                        .is_some_and(|at| at.elapsed() < self.settings.device_min_interval);
                    if recent {
                        tracing::debug!(host = %host,
                            "Device updated recently, re-reporting cached values");
                        summary.skipped_recent += 1;
                    }
                    !recent
                })
                .map(|(host, slot)| (host.clone(), Arc::clone(&slot.adapter)))
                .collect()
        };

        let cancel = self.cancel.child_token();
        let runner =
            TaskRunner::new(self.settings.retry, self.settings.concurrency)
                .with_cancellation(cancel.clone());

        let tasks: Vec<_> = to_poll
            .iter()
            .map(|(host, adapter)| {
                let adapter = Arc::clone(adapter);
                let cache = Arc::clone(&self.cache);
                TaskSpec::new(host.clone(), move || {
                    let adapter = Arc::clone(&adapter);
                    let cache = Arc::clone(&cache);
                    async move { update_device(adapter, cache).await }
                })
            })
            .collect();

        let classify = |e: &DeviceError| e.classify();
        let run = runner.run_all(tasks, classify);
        let reports = match deadline {
            Some(limit) => {
                tokio::pin!(run);
                tokio::select! {
                    reports = &mut run => reports,
                    _ = tokio::time::sleep(limit) => {
                        tracing::warn!(seq, limit_ms = limit.as_millis() as u64,
                            "Cycle deadline reached, cancelling outstanding tasks");
                        cancel.cancel();
                        // Every task settles at its next suspension point.
                        run.await
                    }
                }
            }
            None => run.await,
        };

        self.apply_reports(reports, &mut summary).await;
        summary.elapsed = started.elapsed();

        tracing::debug!(
            seq,
            devices = summary.total_devices,
            updated = summary.updated,
            failed = summary.failures.len(),
            skipped_recent = summary.skipped_recent,
            skipped_no_feature = summary.skipped_no_feature,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Refresh cycle completed"
        );
        summary
    }

    /// Fold task reports into per-device bookkeeping and the cycle summary.
    async fn apply_reports(
        &self,
        reports: Vec<crate::runner::TaskReport<DeviceOutcome, DeviceError>>,
        summary: &mut CycleSummary,
    ) {
        let now = Instant::now();
        let mut devices = self.devices.lock().await;
        for report in reports {
            let host = report.label;
            let Some(slot) = devices.get_mut(&host) else {
                continue;
            };
            let consecutive_failures = match report.outcome {
                Ok(outcome) => {
                    slot.last_success = Some(now);
                    slot.consecutive_failures = 0;
                    match outcome {
                        DeviceOutcome::Updated => summary.updated += 1,
                        DeviceOutcome::NoFeature => summary.skipped_no_feature += 1,
                        DeviceOutcome::WriteRejected => summary.failures.push(CycleFailure {
                            host: host.clone(),
                            attempts: report.attempts,
                            error: "cache rejected the write".to_string(),
                            terminal: true,
                        }),
                    }
                    0
                }
                Err(TaskFailure::Cancelled) => {
                    summary.cancelled += 1;
                    slot.consecutive_failures
                }
                Err(failure) => {
                    let terminal = matches!(failure, TaskFailure::Terminal(_));
                    if let TaskFailure::Terminal(DeviceError::AuthRejected) = &failure {
                        // A device we can no longer authenticate against must
                        // not keep exporting its stale readings.
                        tracing::error!(host = %host, "Authentication failed; evicting cached readings");
                        self.cache.evict(&host);
                    }
                    tracing::warn!(
                        host = %host,
                        attempts = report.attempts,
                        error = %failure,
                        "Device update failed for this cycle"
                    );
                    slot.consecutive_failures += 1;
                    summary.failures.push(CycleFailure {
                        host: host.clone(),
                        attempts: report.attempts,
                        error: failure.to_string(),
                        terminal,
                    });
                    slot.consecutive_failures
                }
            };

            let drop_device = self
                .settings
                .drop_after_failures
                .is_some_and(|limit| consecutive_failures >= limit);
            if drop_device {
                tracing::warn!(host = %host, failures = consecutive_failures,
                    "Dropping device from the polling set");
                devices.remove(&host);
                self.cache.evict(&host);
            }
        }
    }

    /// Interval-mode loop: run cycles until shutdown, sleeping the refresh
    /// interval after each cycle completes. No-op in scrape-triggered mode.
    pub async fn run(&self) {
        let Some(interval) = self.settings.refresh_interval else {
            tracing::info!("Scrape-triggered mode; refresh runs per scrape");
            return;
        };

        tracing::info!(interval_s = interval.as_secs(), "Background refresh loop started");
        while !self.cancel.is_cancelled() {
            self.run_cycle().await;
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(EngineState::Idle);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::debug!("Background refresh loop exited");
    }

    /// Cancel any in-flight cycle, wait for it to settle, and release all
    /// device sessions. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.state() == EngineState::Stopped {
            return;
        }
        self.set_state(EngineState::ShuttingDown);
        self.cancel.cancel();

        // An in-flight cycle holds the gate until all its tasks settled.
        let _cycle = self.cycle_gate.lock().await;

        let adapters: Vec<(String, Arc<dyn PlugDevice>)> = {
            let devices = self.devices.lock().await;
            devices
                .iter()
                .map(|(host, slot)| (host.clone(), Arc::clone(&slot.adapter)))
                .collect()
        };

        if !adapters.is_empty() {
            tracing::info!(devices = adapters.len(), "Disconnecting device sessions");
            let runner = TaskRunner::new(self.settings.retry, 0);
            let tasks: Vec<_> = adapters
                .into_iter()
                .map(|(host, adapter)| {
                    TaskSpec::new(host, move || {
                        let adapter = Arc::clone(&adapter);
                        async move { adapter.disconnect().await }
                    })
                })
                .collect();
            let reports = runner.run_all(tasks, |e: &DeviceError| e.classify()).await;
            for report in reports.iter().filter(|r| !r.is_ok()) {
                tracing::warn!(host = %report.label, "Disconnect failed during shutdown");
            }
        }

        self.set_state(EngineState::Stopped);
        tracing::info!("Refresh engine stopped");
    }
}

/// One attempt at updating a single device: refresh the session, read the
/// metrics, and commit them to the cache atomically.
async fn update_device(
    adapter: Arc<dyn PlugDevice>,
    cache: Arc<MetricCache>,
) -> Result<DeviceOutcome, DeviceError> {
    let info = adapter.info();
    adapter.connect_or_refresh_session().await?;

    if !adapter
        .supported_features()
        .contains(&Feature::CurrentConsumption)
    {
        tracing::debug!(host = %info.host,
            "Device lacks the current-consumption capability, skipping");
        return Ok(DeviceOutcome::NoFeature);
    }

    let metrics = adapter.read_metrics().await?;
    let mut update = DeviceUpdate::new(&info.host, &info.alias);
    for (feature, value) in metrics {
        update = update.with_value(feature.metric_name(), value, Some(feature.unit()));
    }

    match cache.upsert_device(update) {
        Ok(()) => {
            tracing::debug!(host = %info.host, alias = %info.alias, "Device updated");
            Ok(DeviceOutcome::Updated)
        }
        Err(e) => {
            // Programming-defect class: surfaced loudly, fatal only to this
            // write.
            tracing::error!(host = %info.host, error = %e, "Cache write rejected");
            Ok(DeviceOutcome::WriteRejected)
        }
    }
}
