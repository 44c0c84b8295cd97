//! Circuit breaker for calls to remote dependencies
//!
//! Each external dependency (PostgreSQL, the message broker) gets its own
//! named breaker instance. When consecutive failures exceed a threshold the
//! circuit "opens" and calls fail fast without touching the dependency,
//! which keeps a degraded dependency from cascading into the whole process.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if the dependency recovered - limited probe calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                               ▲      probe failure        │
///      │                               └─────────────────────────  │
///      │            max_requests consecutive probe successes       │
///      └───────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Upper bound on a single guarded call; an elapsed call counts as a failure
    pub call_timeout: Duration,

    /// Time to wait before transitioning from open to half-open
    pub reset_timeout: Duration,

    /// Window after which the closed-state failure count is cleared
    pub interval: Duration,

    /// Maximum concurrent probe calls in half-open state; also the number of
    /// consecutive probe successes required to close the circuit
    pub max_requests: u32,

    /// Number of consecutive failures required to open the circuit
    pub failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_secs(5),
            interval: Duration::from_secs(10),
            max_requests: 3,
            failure_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Standard settings for PostgreSQL-backed dependencies
    pub fn for_postgres() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// Standard settings for the message broker publisher
    pub fn for_publisher() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Set the per-call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the reset timeout (time before probing again after opening)
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the closed-state failure counting window
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the half-open probe limit
    pub fn with_max_requests(mut self, max: u32) -> Self {
        self.max_requests = max.max(1);
        self
    }

    /// Set the consecutive-failure threshold that opens the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }
}

/// Error types for guarded calls
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E: std::error::Error> {
    /// Circuit is open, the call was not attempted
    #[error("circuit breaker is open")]
    Open,

    /// Circuit is half-open and all probe slots are taken
    #[error("circuit breaker is half-open, no probe slots available")]
    TooManyRequests,

    /// The guarded call exceeded the configured call timeout
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The guarded call itself failed; closed-path error semantics are
    /// never altered, the underlying error is passed through untouched
    #[error(transparent)]
    Inner(E),
}

impl<E: std::error::Error> BreakerError<E> {
    /// True when the breaker short-circuited without running the call
    pub fn is_short_circuit(&self) -> bool {
        matches!(self, Self::Open | Self::TooManyRequests)
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_inflight: u32,
    opened_at: Option<Instant>,
    window_started: Instant,
}

struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// A named circuit breaker guarding one external dependency
///
/// Cloning is cheap; clones share the same state, so a breaker can be
/// handed both to the component making guarded calls and to a health
/// check reading [`CircuitBreaker::state`].
///
/// # Example
///
/// ```ignore
/// let breaker = CircuitBreaker::new("postgres", CircuitBreakerConfig::for_postgres());
///
/// let row = breaker
///     .call(async { fetch_row(&pool).await })
///     .await?;
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                inner: Mutex::new(BreakerInner {
                    state: CircuitState::Closed,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    half_open_inflight: 0,
                    opened_at: None,
                    window_started: Instant::now(),
                }),
            }),
        }
    }

    /// Get the breaker name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current state, transitioning open breakers to half-open once the
    /// reset timeout has elapsed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.shared.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Run `op` under the breaker, bounded by the configured call timeout.
    ///
    /// While open, `op` is never executed and the call fails immediately
    /// with [`BreakerError::Open`]. While half-open, at most `max_requests`
    /// probes run concurrently. An elapsed call counts as a failure.
    ///
    /// The returned future must be driven to completion for the breaker's
    /// half-open accounting to stay balanced.
    pub async fn call<T, E, F>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        self.call_with_timeout(self.shared.config.call_timeout, op)
            .await
    }

    /// Run `op` under the breaker with an explicit per-call bound, for
    /// callers whose operations have different deadlines against the same
    /// dependency (e.g. single-event processing vs. a batch sweep).
    pub async fn call_with_timeout<T, E, F>(
        &self,
        call_timeout: Duration,
        op: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        self.before_call()?;

        match tokio::time::timeout(call_timeout, op).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                self.on_failure();
                Err(BreakerError::Timeout(call_timeout))
            }
        }
    }

    fn before_call<E: std::error::Error>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.shared.inner.lock();
        self.maybe_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                if inner.window_started.elapsed() >= self.shared.config.interval {
                    inner.consecutive_failures = 0;
                    inner.window_started = Instant::now();
                }
                Ok(())
            }
            CircuitState::Open => Err(BreakerError::Open),
            CircuitState::HalfOpen => {
                if inner.half_open_inflight >= self.shared.config.max_requests {
                    return Err(BreakerError::TooManyRequests);
                }
                inner.half_open_inflight += 1;
                Ok(())
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.shared.config.max_requests {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // A probe result racing a reopen; nothing to record
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                if inner.window_started.elapsed() >= self.shared.config.interval {
                    inner.consecutive_failures = 0;
                    inner.window_started = Instant::now();
                }
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.shared.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let expired = inner
                .opened_at
                .map(|at| at.elapsed() >= self.shared.config.reset_timeout)
                .unwrap_or(false);
            if expired {
                self.transition(inner, CircuitState::HalfOpen);
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_inflight = 0;
        inner.opened_at = match to {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };
        inner.window_started = Instant::now();

        error!(
            breaker = %self.shared.name,
            from = %from,
            to = %to,
            "circuit breaker state change"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct TestError;

    fn test_breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_max_requests(3)
                .with_reset_timeout(Duration::from_millis(100))
                .with_interval(Duration::from_secs(60)),
        )
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(async { Err::<(), _>(TestError) }).await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        breaker
            .call(async { Ok::<_, TestError>(()) })
            .await
            .expect("call should pass");
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let breaker = test_breaker();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_allows_calls_when_closed() {
        let breaker = test_breaker();
        let value = breaker.call(async { Ok::<_, TestError>(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_inner_errors_pass_through() {
        let breaker = test_breaker();
        let result = breaker.call(async { Err::<(), _>(TestError) }).await;
        assert!(matches!(result, Err(BreakerError::Inner(TestError))));
    }

    #[tokio::test]
    async fn test_opens_after_failure_threshold() {
        let breaker = test_breaker();

        for _ in 0..3 {
            fail(&breaker).await;
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        let result = breaker.call(async { Ok::<_, TestError>(()) }).await;
        assert!(matches!(result, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let breaker = test_breaker();

        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_transitions_to_half_open_after_reset_timeout() {
        let breaker = test_breaker();

        for _ in 0..3 {
            fail(&breaker).await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_closes_after_probe_successes() {
        let breaker = test_breaker();

        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        for _ in 0..3 {
            succeed(&breaker).await;
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reopens_on_probe_failure() {
        let breaker = test_breaker();

        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        fail(&breaker).await;

        let result = breaker.call(async { Ok::<_, TestError>(()) }).await;
        assert!(matches!(result, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn test_interval_window_clears_failure_count() {
        let breaker = CircuitBreaker::new(
            "windowed",
            CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_interval(Duration::from_millis(50)),
        );

        fail(&breaker).await;
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        fail(&breaker).await;

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(
            "slow",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_call_timeout(Duration::from_millis(10)),
        );

        let result = breaker
            .call(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, TestError>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_short_circuit_classification() {
        assert!(BreakerError::<TestError>::Open.is_short_circuit());
        assert!(BreakerError::<TestError>::TooManyRequests.is_short_circuit());
        assert!(!BreakerError::Inner(TestError).is_short_circuit());
    }
}
