//! Rate-limited retry executor for provider calls.
//!
//! Admission is two-step: a permit from the process-wide concurrency gate,
//! then, while holding it, a grant from the provider's rate window. The grant
//! is stamped when the call is about to start. Transient failures and
//! per-call timeouts are retried with capped exponential backoff plus jitter;
//! permanent failures propagate on the first attempt.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::cancel::CancellationSignal;
use super::rate_limiter::{RateLimit, RateWindow};
use crate::adapters::ProviderError;
use crate::domain::StageName;

/// Retry policy for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter in `[0, delay)` to every backoff
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Delay before retrying after `attempt` failed, jitter included
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let base_ms = base.as_millis() as u64;
        if !self.jitter || base_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..base_ms);
        base + Duration::from_millis(jitter)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Granularity at which transient failures are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryScope {
    /// Each provider call is retried on its own
    #[default]
    PerCall,

    /// Calls get one attempt; the whole stage is retried instead
    PerStage,
}

/// Rate limit section of the executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Calls admitted per window (default: 50)
    #[serde(default = "default_rate_calls")]
    pub calls: u32,

    /// Window length in seconds (default: 60)
    #[serde(default = "default_rate_window")]
    pub window_seconds: u64,
}

fn default_rate_calls() -> u32 {
    50
}
fn default_rate_window() -> u64 {
    60
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            calls: default_rate_calls(),
            window_seconds: default_rate_window(),
        }
    }
}

impl RateLimitSettings {
    pub fn limit(&self) -> RateLimit {
        RateLimit::new(self.calls, Duration::from_secs(self.window_seconds))
    }
}

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Maximum provider calls in flight across the process (default: 8)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub retry_scope: RetryScope,
}

fn default_max_concurrency() -> usize {
    8
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            rate_limit: RateLimitSettings::default(),
            retry: RetryPolicy::default(),
            retry_scope: RetryScope::default(),
        }
    }
}

/// Why a call through the executor did not produce a value
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("cancelled before the call was admitted")]
    Cancelled,
}

/// Per-stage attempt counters for one run
#[derive(Debug, Default)]
pub struct AttemptLedger {
    counts: Mutex<BTreeMap<StageName, u32>>,
}

impl AttemptLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one attempt for `stage`, returning the new total
    pub fn record(&self, stage: StageName) -> u32 {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(stage).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, stage: StageName) -> u32 {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(&stage).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<StageName, u32> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Shared executor for provider calls
///
/// One instance is shared by every run in the process so the concurrency
/// cap and rate limits hold across projects.
pub struct Executor {
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    rate_limit: RateLimit,
    call_timeout: Duration,
    windows: Mutex<HashMap<String, Arc<RateWindow>>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Keeps the in-flight gauge accurate even if the call future is dropped
struct InFlight<'a> {
    executor: &'a Executor,
}

impl<'a> InFlight<'a> {
    fn enter(executor: &'a Executor) -> Self {
        let now = executor.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        executor.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { executor }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.executor.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Executor {
    pub fn new(max_concurrency: usize, rate_limit: RateLimit, call_timeout: Duration) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            rate_limit,
            call_timeout,
            windows: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn from_settings(settings: &ExecutorSettings, call_timeout: Duration) -> Self {
        Self::new(
            settings.max_concurrency,
            settings.rate_limit.limit(),
            call_timeout,
        )
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Calls currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of calls ever in flight at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn window(&self, provider: &str) -> Arc<RateWindow> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            windows
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(RateWindow::new(self.rate_limit))),
        )
    }

    /// Run `op` under the admission rules and `policy`
    ///
    /// Every attempt counts against `stage` in `ledger`. Cancellation stops
    /// the call before admission, while it waits for a permit or grant, and
    /// during backoff; an attempt already in flight runs to completion.
    pub async fn call<T, F, Fut>(
        &self,
        provider: &str,
        stage: StageName,
        policy: &RetryPolicy,
        ledger: &AttemptLedger,
        cancel: &CancellationSignal,
        mut op: F,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let window = self.window(provider);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                permit = Arc::clone(&self.permits).acquire_owned() => permit
                    .map_err(|_| CallError::Permanent("admission gate closed".to_string()))?,
            };

            // Granted under the permit so the grant time is the start time
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                _ = window.acquire() => {}
            }

            let total = ledger.record(stage);
            debug!(%stage, provider, attempt, total, "Provider call admitted");

            let result = {
                let _in_flight = InFlight::enter(self);
                match timeout(self.call_timeout, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Transient(format!(
                        "call timed out after {}s",
                        self.call_timeout.as_secs_f64()
                    ))),
                }
            };
            drop(permit);

            let message = match result {
                Ok(value) => return Ok(value),
                Err(ProviderError::Permanent(message)) => {
                    return Err(CallError::Permanent(message))
                }
                Err(ProviderError::Transient(message)) => message,
            };

            if !policy.should_retry(attempt) {
                return Err(CallError::Exhausted {
                    attempts: attempt,
                    last_error: message,
                });
            }

            let delay = policy.backoff(attempt);
            warn!(
                %stage,
                provider,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Provider call failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn executor() -> Executor {
        Executor::new(4, RateLimit::new(100, Duration::from_secs(1)), Duration::from_secs(5))
    }

    #[test]
    fn test_retry_delays() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1000)); // capped

        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn test_jitter_stays_below_double() {
        let policy = RetryPolicy {
            jitter: true,
            ..fast_policy(3)
        };
        for _ in 0..50 {
            let delay = policy.backoff(2);
            assert!(delay >= Duration::from_millis(20));
            assert!(delay < Duration::from_millis(40));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let executor = executor();
        let ledger = AttemptLedger::new();
        let calls = AtomicU32::new(0);

        let result = executor
            .call("p", StageName::Translate, &fast_policy(5), &ledger, &CancellationSignal::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(ProviderError::Transient("503".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(ledger.get(StageName::Translate), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_is_not_retried() {
        let executor = executor();
        let ledger = AttemptLedger::new();

        let result: Result<(), _> = executor
            .call("p", StageName::Traverse, &fast_policy(5), &ledger, &CancellationSignal::new(), || async {
                Err(ProviderError::Permanent("bad input".to_string()))
            })
            .await;

        assert_eq!(result, Err(CallError::Permanent("bad input".to_string())));
        assert_eq!(ledger.get(StageName::Traverse), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_distinct() {
        let executor = executor();
        let ledger = AttemptLedger::new();

        let result: Result<(), _> = executor
            .call("p", StageName::Traverse, &fast_policy(3), &ledger, &CancellationSignal::new(), || async {
                Err(ProviderError::Transient("429".to_string()))
            })
            .await;

        assert_eq!(
            result,
            Err(CallError::Exhausted {
                attempts: 3,
                last_error: "429".to_string()
            })
        );
        assert_eq!(ledger.get(StageName::Traverse), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_is_transient() {
        let executor = Executor::new(1, RateLimit::new(10, Duration::from_secs(1)), Duration::from_secs(2));
        let ledger = AttemptLedger::new();
        let calls = AtomicU32::new(0);

        let result = executor
            .call("p", StageName::Document, &fast_policy(3), &ledger, &CancellationSignal::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        sleep(Duration::from_secs(60)).await;
                    }
                    Ok::<_, ProviderError>("done")
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(ledger.get(StageName::Document), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_admission() {
        let executor = executor();
        let ledger = AttemptLedger::new();
        let cancel = CancellationSignal::new();
        cancel.cancel();

        let result: Result<(), _> = executor
            .call("p", StageName::Document, &fast_policy(3), &ledger, &cancel, || async { Ok(()) })
            .await;

        assert_eq!(result, Err(CallError::Cancelled));
        assert_eq!(ledger.get(StageName::Document), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let executor = executor();
        let ledger = AttemptLedger::new();
        let cancel = CancellationSignal::new();
        let policy = RetryPolicy {
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..fast_policy(5)
        };

        let trigger = cancel.clone();
        let result: Result<(), _> = executor
            .call("p", StageName::Document, &policy, &ledger, &cancel, || {
                trigger.cancel();
                async { Err(ProviderError::Transient("busy".to_string())) }
            })
            .await;

        assert_eq!(result, Err(CallError::Cancelled));
        assert_eq!(ledger.get(StageName::Document), 1);
    }

    #[tokio::test]
    async fn test_settings_defaults_from_yaml() {
        let settings: ExecutorSettings =
            serde_yaml::from_str("max_concurrency: 2\nretry_scope: per_stage\n").unwrap();
        assert_eq!(settings.max_concurrency, 2);
        assert_eq!(settings.retry_scope, RetryScope::PerStage);
        assert_eq!(settings.rate_limit.calls, 50);
        assert_eq!(settings.retry.max_attempts, 5);
    }
}
