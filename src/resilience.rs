//! Retry, backoff, and circuit breaking around external calls.
//!
//! [`Resilience::call`] is a generic wrapper: it knows nothing about
//! embeddings or generation, only how to classify a failure through the
//! [`Fault`] trait. The orchestrator owns one instance per dependency so the
//! retriever and the generation client trip independent breakers.
//!
//! ```text
//!            ┌─────────┐  threshold consecutive      ┌──────┐
//!   ────────►│ CLOSED  │────────────────────────────►│ OPEN │
//!            └─────────┘     transient failures      └──────┘
//!                 ▲                                      │ cooldown elapsed
//!                 │ probe succeeds   ┌───────────┐       ▼
//!                 └──────────────────│ HALF_OPEN │◄──────┘
//!                                    └───────────┘
//!                                          │ probe fails → OPEN
//! ```
//!
//! # Retry Strategy
//!
//! - Attempts = `retry_count + 1`.
//! - Only transient faults are retried; anything else returns at once.
//! - Delay before retry `n` (0-based): `min(base × 2ⁿ, max)` plus up to 10%
//!   random jitter.
//! - Each attempt is bounded by `attempt_timeout`, clipped to the time left
//!   before the request deadline. A retry whose backoff would cross the
//!   deadline is not attempted.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qa_harness_core::QaError;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ResilienceConfig;

/// Breaker name of the guard around embedding calls.
pub const RETRIEVAL: &str = "retrieval";
/// Breaker name of the guard around generation calls.
pub const GENERATION: &str = "generation";

/// Failure classification used by [`Resilience::call`].
pub trait Fault: fmt::Display {
    fn is_transient(&self) -> bool;
    /// Fault reported when an attempt of the guard named `guard` exceeds its
    /// time budget. Must be transient.
    fn timed_out(guard: &str, after: Duration) -> Self;
}

impl Fault for QaError {
    fn is_transient(&self) -> bool {
        QaError::is_transient(self)
    }

    fn timed_out(guard: &str, after: Duration) -> Self {
        let message = format!("{} attempt exceeded {:?}", guard, after);
        match guard {
            GENERATION => QaError::GenerationTimeout(message),
            RETRIEVAL => QaError::embedding(message, true),
            _ => QaError::service(message, true),
        }
    }
}

// ============ Retry policy ============

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Exponential delay before retry `retry` (0-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// [`base_delay`](Self::base_delay) plus uniform jitter in `[0, 10%]`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay = self.base_delay(retry);
        delay + delay.mul_f64(0.1 * fastrand::f64())
    }
}

// ============ Circuit breaker ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub threshold: u32,
    /// Seconds until an open breaker lets a probe through.
    pub retry_in_secs: Option<u64>,
    pub last_failure: Option<DateTime<Utc>>,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    total_successes: u64,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_failure: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                total_successes: 0,
                opened_at: None,
                probe_in_flight: false,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Ask to make one call. An open breaker answers with the time left in
    /// its cooldown; a half-open breaker admits a single probe.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {}
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(self.cooldown);
                if elapsed < self.cooldown {
                    return Err(self.cooldown - elapsed);
                }
                info!(breaker = %self.name, "circuit half-open, probing");
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = true;
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(Duration::ZERO);
                }
                inner.probe_in_flight = true;
            }
        }
        Ok(BreakerPermit {
            breaker: self,
            settled: false,
        })
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!(breaker = %self.name, "circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.total_successes += 1;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Utc::now());
        inner.probe_in_flight = false;

        let trip = inner.state == BreakerState::HalfOpen
            || (inner.state == BreakerState::Closed && inner.consecutive_failures >= self.threshold);
        if trip {
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit opened"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn on_release(&self) {
        self.inner.lock().probe_in_flight = false;
    }

    /// Count a failure observed outside [`Resilience::call`], e.g. a stream
    /// that broke after it started.
    pub fn record_failure(&self) {
        self.on_failure();
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        info!(breaker = %self.name, "circuit reset");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let retry_in_secs = match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened)) => {
                Some(self.cooldown.saturating_sub(opened.elapsed()).as_secs())
            }
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            threshold: self.threshold,
            retry_in_secs,
            last_failure: inner.last_failure,
        }
    }
}

/// Admission to make one call. Dropping it unsettled (e.g. the caller was
/// cancelled) frees the half-open probe slot without recording an outcome.
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_release();
        }
    }
}

// ============ Wrapper ============

#[derive(Debug)]
pub enum ResilienceError<E> {
    /// Non-transient fault; not retried.
    Rejected(E),
    /// Every attempt failed with a transient fault.
    Exhausted { attempts: u32, last: E },
    /// The breaker refused the call.
    CircuitOpen { retry_in: Duration },
    /// The request deadline passed before a result was obtained.
    DeadlineExceeded { attempts: u32 },
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceError::Rejected(e) => write!(f, "{}", e),
            ResilienceError::Exhausted { attempts, last } => {
                write!(f, "gave up after {} attempts: {}", attempts, last)
            }
            ResilienceError::CircuitOpen { retry_in } => {
                write!(f, "circuit open, retry in {}s", retry_in.as_secs())
            }
            ResilienceError::DeadlineExceeded { attempts } => {
                write!(f, "request deadline exceeded after {} attempts", attempts)
            }
        }
    }
}

/// A successful call and how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

pub struct Resilience {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl Resilience {
    pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self { policy, breaker }
    }

    pub fn from_config(name: &str, config: &ResilienceConfig) -> Self {
        Self::new(
            RetryPolicy::from_config(config),
            Arc::new(CircuitBreaker::new(
                name,
                config.circuit_breaker_threshold,
                Duration::from_secs(config.circuit_cooldown_secs),
            )),
        )
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` under the retry policy and breaker until it succeeds, fails
    /// permanently, or `deadline` passes. `op` receives the 1-based attempt
    /// number.
    pub async fn call<T, E, F, Fut>(
        &self,
        deadline: Instant,
        mut op: F,
    ) -> Result<Attempted<T>, ResilienceError<E>>
    where
        E: Fault,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ResilienceError::DeadlineExceeded { attempts: attempt });
            }
            let permit = self
                .breaker
                .try_acquire()
                .map_err(|retry_in| ResilienceError::CircuitOpen { retry_in })?;

            attempt += 1;
            let budget = self.policy.attempt_timeout.min(deadline - now);
            let outcome = match tokio::time::timeout(budget, op(attempt)).await {
                Ok(result) => result,
                Err(_) if Instant::now() >= deadline => {
                    // cut short by the request deadline, not a dependency fault
                    drop(permit);
                    warn!(breaker = %self.breaker.name(), attempts = attempt, "request deadline passed during attempt");
                    return Err(ResilienceError::DeadlineExceeded { attempts: attempt });
                }
                Err(_) => Err(E::timed_out(self.breaker.name(), budget)),
            };

            let fault = match outcome {
                Ok(value) => {
                    permit.success();
                    if attempt > 1 {
                        debug!(breaker = %self.breaker.name(), attempt, "succeeded after retry");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(fault) => fault,
            };

            if !fault.is_transient() {
                drop(permit);
                return Err(ResilienceError::Rejected(fault));
            }
            permit.failure();

            if attempt >= self.policy.max_attempts() {
                warn!(breaker = %self.breaker.name(), attempts = attempt, error = %fault, "retries exhausted");
                return Err(ResilienceError::Exhausted {
                    attempts: attempt,
                    last: fault,
                });
            }

            let delay = self.policy.backoff(attempt - 1);
            if Instant::now() + delay >= deadline {
                warn!(breaker = %self.breaker.name(), attempts = attempt, "deadline leaves no room to retry");
                return Err(ResilienceError::DeadlineExceeded { attempts: attempt });
            }
            warn!(
                breaker = %self.breaker.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %fault,
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(retry_count: u32) -> RetryPolicy {
        RetryPolicy {
            retry_count,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(1_000),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn resilience(retry_count: u32, threshold: u32) -> Resilience {
        Resilience::new(
            policy(retry_count),
            Arc::new(CircuitBreaker::new("test", threshold, Duration::from_secs(30))),
        )
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(600)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.base_delay(0), Duration::from_millis(100));
        assert_eq!(p.base_delay(1), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(800));
        assert_eq!(p.base_delay(4), Duration::from_millis(1_000));
        assert_eq!(p.base_delay(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let p = policy(3);
        for _ in 0..100 {
            let d = p.backoff(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(220));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let r = resilience(3, 10);
        let calls = AtomicU32::new(0);
        let result = r
            .call(far_deadline(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(QaError::RateLimited("429".into()))
                    } else {
                        Ok("answer")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result.value, "answer");
        assert_eq!(result.attempts, 3);
        assert_eq!(r.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_attempts() {
        let r = resilience(3, 100);
        let calls = AtomicU32::new(0);
        let err = r
            .call(far_deadline(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(QaError::service("503", true)) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Exhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_is_not_retried() {
        let r = resilience(3, 1);
        let calls = AtomicU32::new(0);
        let err = r
            .call(far_deadline(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(QaError::InvalidParameter("top_p".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Rejected(QaError::InvalidParameter(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // non-transient faults do not count toward the breaker
        assert_eq!(r.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_then_half_opens() {
        let breaker = CircuitBreaker::new("gen", 2, Duration::from_secs(30));
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        let retry_in = breaker.try_acquire().err().unwrap();
        assert!(retry_in <= Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(31)).await;
        let probe = breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // only one trial call at a time
        assert!(breaker.try_acquire().is_err());
        probe.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new("gen", 1, Duration::from_secs(10));
        breaker.try_acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot().retry_in_secs, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_frees_slot() {
        let breaker = CircuitBreaker::new("gen", 1, Duration::from_secs(10));
        breaker.try_acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        drop(breaker.try_acquire().unwrap());
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits_call() {
        let r = resilience(3, 1);
        r.breaker().try_acquire().unwrap().failure();
        let calls = AtomicU32::new(0);
        let err = r
            .call(far_deadline(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, QaError>(()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let r = Resilience::new(
            RetryPolicy {
                retry_count: 1,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(10),
                attempt_timeout: Duration::from_secs(1),
            },
            Arc::new(CircuitBreaker::new(GENERATION, 10, Duration::from_secs(30))),
        );
        let err = r
            .call(far_deadline(), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, QaError>(())
            })
            .await
            .unwrap_err();
        match err {
            ResilienceError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(last, QaError::GenerationTimeout(_)));
            }
            other => panic!("unexpected: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retries() {
        let r = resilience(10, 100);
        let deadline = Instant::now() + Duration::from_millis(250);
        let calls = AtomicU32::new(0);
        let err = r
            .call(deadline, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(QaError::RateLimited("429".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::DeadlineExceeded { .. }));
        // 100ms + 200ms of backoff cannot both fit in 250ms
        assert!(calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_during_attempt_is_not_a_failure() {
        let r = Resilience::new(
            RetryPolicy {
                retry_count: 0,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(10),
                attempt_timeout: Duration::from_secs(30),
            },
            Arc::new(CircuitBreaker::new(GENERATION, 1, Duration::from_secs(30))),
        );
        let deadline = Instant::now() + Duration::from_secs(3);
        let err = r
            .call(deadline, |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, QaError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::DeadlineExceeded { attempts: 1 }));
        let snapshot = r.breaker().snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrieval_timeout_names_embedding_fault() {
        let r = Resilience::new(
            RetryPolicy {
                retry_count: 0,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(10),
                attempt_timeout: Duration::from_secs(1),
            },
            Arc::new(CircuitBreaker::new(RETRIEVAL, 10, Duration::from_secs(30))),
        );
        let err = r
            .call(far_deadline(), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, QaError>(())
            })
            .await
            .unwrap_err();
        match err {
            ResilienceError::Exhausted { last, .. } => {
                assert!(matches!(last, QaError::Embedding { transient: true, .. }));
                assert!(last.to_string().contains("retrieval attempt exceeded"));
            }
            other => panic!("unexpected: {}", other),
        }
    }

    #[test]
    fn test_reset_closes_breaker() {
        let breaker = CircuitBreaker::new("gen", 1, Duration::from_secs(60));
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }
}
