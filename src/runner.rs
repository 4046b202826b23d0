//! Retrying task runner.
//!
//! Executes a batch of independent async work items concurrently with a
//! bounded admission gate, per-item retry with exponential backoff and
//! jitter, and per-item result capture. One failing item never aborts its
//! siblings; the caller receives a report for every submitted task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Default attempt ceiling per task.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default base delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default cap on a single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default jitter fraction added to each backoff delay.
pub const DEFAULT_JITTER: f64 = 0.3;

/// Classification of a task error, decided by a caller-supplied predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected to be resolved by retrying (timeout, expired session).
    Transient,
    /// Retrying cannot help (auth rejection, protocol mismatch).
    Terminal,
}

/// Retry/backoff parameters shared by every task in a batch.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts per task (minimum 1).
    pub attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound on any single computed delay, before jitter.
    pub max_delay: Duration,
    /// Random jitter fraction: each delay gains a uniform extra in
    /// `[0, jitter * delay]` to avoid synchronized retry storms.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after attempt `attempt` (1-based), without jitter.
    ///
    /// Exponent growth is clamped so the computation never overflows.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff delay after attempt `attempt`, with jitter applied.
    fn jittered_delay_after(&self, attempt: u32) -> Duration {
        let delay = self.delay_after(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        delay + delay.mul_f64(rand::random::<f64>() * self.jitter)
    }
}

/// A unit of retryable work: an identity for logging plus an idempotent
/// factory producing one attempt. Discarded after success or final failure.
pub struct TaskSpec<F> {
    /// Identity used for logging and result attribution.
    pub label: String,
    /// Produces one attempt; invoked once per attempt.
    pub factory: F,
}

impl<F> TaskSpec<F> {
    /// Create a task descriptor.
    pub fn new(label: impl Into<String>, factory: F) -> Self {
        Self {
            label: label.into(),
            factory,
        }
    }
}

/// Why a task ultimately failed.
#[derive(Debug)]
pub enum TaskFailure<E> {
    /// Every attempt failed with a transient error.
    Exhausted {
        /// Attempts consumed (equals the policy ceiling).
        attempts: u32,
        /// The error from the final attempt.
        last: E,
    },
    /// A terminal error aborted retries immediately.
    Terminal(E),
    /// The batch was cancelled before this task could finish.
    Cancelled,
}

impl<E: std::fmt::Display> std::fmt::Display for TaskFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted { attempts, last } => {
                write!(f, "failed after {attempts} attempts: {last}")
            }
            Self::Terminal(e) => write!(f, "terminal error: {e}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-task outcome returned to the caller, in submission order.
#[derive(Debug)]
pub struct TaskReport<T, E> {
    /// The task's label, as submitted.
    pub label: String,
    /// Attempts consumed.
    pub attempts: u32,
    /// Success value or final failure.
    pub outcome: Result<T, TaskFailure<E>>,
}

impl<T, E> TaskReport<T, E> {
    /// Whether the task succeeded.
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Error returned by [`TaskRunner::run_all_or_nothing`] when no task
/// succeeded.
#[derive(Debug, thiserror::Error)]
#[error("all {0} tasks failed")]
pub struct AllTasksFailed(pub usize);

/// Runs batches of retryable tasks with bounded concurrency.
///
/// The admission gate is the only shared mutable state between tasks; its
/// permits are released on success, failure and cancellation alike (permit
/// drop is tied to task-future drop).
#[derive(Clone)]
pub struct TaskRunner {
    policy: RetryPolicy,
    gate: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
}

impl TaskRunner {
    /// Create a runner. `concurrency == 0` means unbounded.
    pub fn new(policy: RetryPolicy, concurrency: usize) -> Self {
        Self {
            policy,
            gate: (concurrency > 0).then(|| Arc::new(Semaphore::new(concurrency))),
            cancel: CancellationToken::new(),
        }
    }

    /// Tie this runner to an external cancellation token.
    ///
    /// When the token fires, outstanding tasks are cancelled cooperatively at
    /// their next suspension point and report [`TaskFailure::Cancelled`].
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The runner's cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run every task to completion and return one report per task, in
    /// submission order. Never fails on behalf of the batch: a task's error
    /// is captured in its report, not propagated to siblings.
    pub async fn run_all<T, E, F, Fut, C>(
        &self,
        tasks: Vec<TaskSpec<F>>,
        classify: C,
    ) -> Vec<TaskReport<T, E>>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        C: Fn(&E) -> ErrorClass + Clone + Send + 'static,
    {
        if tasks.is_empty() {
            return Vec::new();
        }

        let mut set = JoinSet::new();
        let total = tasks.len();
        for (index, task) in tasks.into_iter().enumerate() {
            let gate = self.gate.clone();
            let cancel = self.cancel.clone();
            let policy = self.policy;
            let classify = classify.clone();
            set.spawn(async move {
                let report = drive_task(task, policy, gate, cancel, classify).await;
                (index, report)
            });
        }

        let mut slots: Vec<Option<TaskReport<T, E>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => {
                    // A panicking task is isolated to its own slot; siblings
                    // keep running. The slot stays empty and is reported as
                    // cancelled below.
                    tracing::error!(error = %e, "Task panicked");
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or(TaskReport {
                    label: format!("task-{index}"),
                    attempts: 0,
                    outcome: Err(TaskFailure::Cancelled),
                })
            })
            .collect()
    }

    /// Like [`run_all`](Self::run_all), but errors when *every* task failed.
    /// Partial success still returns the full report vector.
    pub async fn run_all_or_nothing<T, E, F, Fut, C>(
        &self,
        tasks: Vec<TaskSpec<F>>,
        classify: C,
    ) -> Result<Vec<TaskReport<T, E>>, AllTasksFailed>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        C: Fn(&E) -> ErrorClass + Clone + Send + 'static,
    {
        let reports = self.run_all(tasks, classify).await;
        if !reports.is_empty() && reports.iter().all(|r| !r.is_ok()) {
            return Err(AllTasksFailed(reports.len()));
        }
        Ok(reports)
    }
}

/// Run one task through its retry loop.
async fn drive_task<T, E, F, Fut, C>(
    task: TaskSpec<F>,
    policy: RetryPolicy,
    gate: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
    classify: C,
) -> TaskReport<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorClass,
{
    let label = task.label;
    let report = |attempts, outcome| TaskReport {
        label: label.clone(),
        attempts,
        outcome,
    };

    // Admission gate: at most N tasks past this point at once. The permit is
    // held for the task's whole lifetime, including backoff sleeps, and is
    // released when this future completes or is dropped.
    let _permit = match &gate {
        Some(gate) => {
            let acquired = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = Arc::clone(gate).acquire_owned() => {
                    // The gate is never closed while a batch is in flight; a
                    // closed gate is an unrecoverable runner fault.
                    Some(permit.expect("admission gate closed"))
                }
            };
            match acquired {
                Some(permit) => Some(permit),
                None => return report(0, Err(TaskFailure::Cancelled)),
            }
        }
        None => None,
    };

    let ceiling = policy.attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(task = %label, attempt, "Task cancelled");
                return report(attempt - 1, Err(TaskFailure::Cancelled));
            }
            result = (task.factory)() => result,
        };

        let err = match result {
            Ok(value) => return report(attempt, Ok(value)),
            Err(err) => err,
        };

        match classify(&err) {
            ErrorClass::Terminal => {
                tracing::debug!(task = %label, attempt, "Terminal error, not retrying");
                return report(attempt, Err(TaskFailure::Terminal(err)));
            }
            ErrorClass::Transient => {
                if attempt >= ceiling {
                    return report(
                        attempt,
                        Err(TaskFailure::Exhausted {
                            attempts: attempt,
                            last: err,
                        }),
                    );
                }
                let delay = policy.jittered_delay_after(attempt);
                tracing::debug!(task = %label, attempt, delay_ms = delay.as_millis() as u64,
                    "Transient error, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return report(attempt, Err(TaskFailure::Cancelled));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Erase a task factory to a single boxed type so closures with
    /// differing bodies can share one `Vec<TaskSpec<_>>`.
    type BoxedFactory<T, E> =
        Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<T, E>> + Send>> + Send>;

    fn boxed<T, E, Fut>(f: impl Fn() -> Fut + Send + 'static) -> BoxedFactory<T, E>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Box::new(move || Box::pin(f()))
    }

    fn transient_only<E>(_: &E) -> ErrorClass {
        ErrorClass::Transient
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_empty_batch_returns_immediately() {
        type ReadyTask = TaskSpec<fn() -> std::future::Ready<Result<(), String>>>;

        let runner = TaskRunner::new(RetryPolicy::default(), 4);
        let reports = runner.run_all(Vec::<ReadyTask>::new(), transient_only).await;
        assert!(reports.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_gate() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                TaskSpec::new(format!("task-{i}"), move || {
                    let current = Arc::clone(&current);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(i)
                    }
                })
            })
            .collect();

        let runner = TaskRunner::new(fast_policy(1), 3);
        let reports = runner.run_all(tasks, transient_only).await;

        assert_eq!(reports.len(), 8);
        assert!(reports.iter().all(TaskReport::is_ok));
        assert!(peak.load(Ordering::SeqCst) <= 3, "gate breached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_exhausts_attempt_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let task = TaskSpec::new("flaky", move || {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("timed out".to_string())
            }
        });

        let policy = fast_policy(3);
        let started = tokio::time::Instant::now();
        let runner = TaskRunner::new(policy, 0);
        let mut reports = runner.run_all(vec![task], transient_only).await;
        let elapsed = started.elapsed();

        let report = reports.remove(0);
        assert_eq!(report.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match report.outcome {
            Err(TaskFailure::Exhausted { attempts: 3, .. }) => {}
            other => panic!("expected exhausted, got {other:?}"),
        }
        // Backoff between the 3 attempts: base + 2*base (no jitter).
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(320));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delay_bounds_with_jitter() {
        let policy = RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            jitter: 0.5,
        };

        let task = TaskSpec::new("flaky", || async { Err::<(), _>("glitch".to_string()) });
        let started = tokio::time::Instant::now();
        let runner = TaskRunner::new(policy, 0);
        let _ = runner.run_all(vec![task], transient_only).await;
        let elapsed = started.elapsed();

        // Delays: 100ms, 200ms, min(400, 250)=250ms, each jittered by at
        // most 50% of itself.
        let floor = Duration::from_millis(100 + 200 + 250);
        let ceil = floor.mul_f64(1.5);
        assert!(elapsed >= floor, "elapsed {elapsed:?} below floor {floor:?}");
        assert!(elapsed <= ceil, "elapsed {elapsed:?} above ceiling {ceil:?}");
    }

    #[test]
    fn test_delay_exponent_is_clamped() {
        let policy = RetryPolicy {
            attempts: u32::MAX,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        };
        // Enormous attempt numbers must neither overflow nor wrap negative.
        assert_eq!(policy.delay_after(1), Duration::from_secs(10));
        assert_eq!(policy.delay_after(64), Duration::from_secs(60));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_terminal_error_aborts_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let task = TaskSpec::new("rejected", move || {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("auth rejected".to_string())
            }
        });

        let runner = TaskRunner::new(fast_policy(5), 0);
        let mut reports = runner
            .run_all(vec![task], |_: &String| ErrorClass::Terminal)
            .await;

        let report = reports.remove(0);
        assert_eq!(report.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(report.outcome, Err(TaskFailure::Terminal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failure_does_not_abort_siblings() {
        let tasks = vec![
            TaskSpec::new("ok-1", boxed(|| async { Ok::<_, String>(1u32) })),
            TaskSpec::new("bad", boxed(|| async { Err::<u32, _>("down".to_string()) })),
            TaskSpec::new("ok-2", boxed(|| async { Ok::<_, String>(3u32) })),
        ];

        let runner = TaskRunner::new(fast_policy(2), 2);
        let reports = runner.run_all(tasks, transient_only).await;

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].label, "ok-1");
        assert!(reports[0].is_ok());
        assert!(!reports[1].is_ok());
        assert!(reports[2].is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_settles_outstanding_tasks() {
        let cancel = CancellationToken::new();
        let runner = TaskRunner::new(fast_policy(1), 1).with_cancellation(cancel.clone());

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                TaskSpec::new(format!("slow-{i}"), || async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, String>(())
                })
            })
            .collect();

        let handle = tokio::spawn(async move { runner.run_all(tasks, transient_only).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let reports = handle.await.unwrap();
        assert_eq!(reports.len(), 4);
        assert!(
            reports
                .iter()
                .all(|r| matches!(r.outcome, Err(TaskFailure::Cancelled)))
        );
    }

    #[tokio::test]
    async fn test_all_or_nothing_mode() {
        let runner = TaskRunner::new(fast_policy(1), 0);

        let all_bad = vec![
            TaskSpec::new("a", boxed(|| async { Err::<(), _>("x".to_string()) })),
            TaskSpec::new("b", boxed(|| async { Err::<(), _>("y".to_string()) })),
        ];
        let err = runner
            .run_all_or_nothing(all_bad, transient_only)
            .await
            .unwrap_err();
        assert_eq!(err.0, 2);

        let partial = vec![
            TaskSpec::new("a", boxed(|| async { Ok::<_, String>(()) })),
            TaskSpec::new("b", boxed(|| async { Err::<(), _>("y".to_string()) })),
        ];
        let reports = runner
            .run_all_or_nothing(partial, transient_only)
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
    }
}
