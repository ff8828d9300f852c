//! Adaptive Circuit Breaker
//!
//! Guards an unreliable outbound call (webhook delivery, liveness probes).
//! The trip threshold adapts to the call success rate observed over the last
//! hour each time the breaker recovers from half-open.

use crate::monitoring::ring_buffer::RingBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Calls remembered for threshold adaptation
pub const CALL_HISTORY_CAPACITY: usize = 100;
pub const MIN_THRESHOLD: u32 = 2;
pub const MAX_THRESHOLD: u32 = 50;

const ADAPTATION_WINDOW: Duration = Duration::from_secs(3600);

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected without being attempted
    Open,
    /// Trial calls decide whether to close again
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Base number of consecutive failures that trips the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before an open circuit admits a trial call
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes needed to close
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Error returned by a guarded call
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit '{name}' is open, retry in {retry_in:?}")]
    Open { name: String, retry_in: Duration },

    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Open { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    at: Instant,
    success: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    adaptive_threshold: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    call_history: RingBuffer<CallRecord>,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub adaptive_threshold: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub recorded_calls: usize,
    pub total_trips: u64,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerInner>,
    total_trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let threshold = config.failure_threshold.clamp(MIN_THRESHOLD, MAX_THRESHOLD);
        Self {
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                adaptive_threshold: threshold,
                last_failure: None,
                last_failure_time: None,
                call_history: RingBuffer::labeled("call_history", CALL_HISTORY_CAPACITY),
            }),
            config,
            total_trips: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current state, moving Open to HalfOpen once the recovery timeout passed
    pub async fn state(&self) -> CircuitState {
        let mut inner = self.inner.write().await;
        self.refresh(&mut inner);
        inner.state
    }

    /// Run `f` through the breaker.
    ///
    /// While open the call is rejected without running `f`. The wrapped
    /// error is returned unchanged inside `CircuitError::Inner`.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.write().await;
            self.refresh(&mut inner);
            if inner.state == CircuitState::Open {
                let retry_in = self.retry_in(&inner);
                debug!(
                    breaker = %self.config.name,
                    "Rejecting call, circuit open for another {:?}", retry_in
                );
                return Err(CircuitError::Open {
                    name: self.config.name.clone(),
                    retry_in,
                });
            }
        }

        match f().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure().await;
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Record the outcome of a call made outside `call()`
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        inner.call_history.push(CallRecord {
            at: Instant::now(),
            success: true,
        });

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_calls.max(1) {
                    self.close(&mut inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        inner.call_history.push(CallRecord {
            at: now,
            success: false,
        });
        inner.failure_count += 1;
        inner.last_failure = Some(now);
        inner.last_failure_time = Some(Utc::now());

        match inner.state {
            CircuitState::Closed if inner.failure_count >= inner.adaptive_threshold => {
                let reason = format!("{} consecutive failures", inner.failure_count);
                self.open(&mut inner, &reason);
            }
            CircuitState::HalfOpen => {
                self.open(&mut inner, "failure while half-open");
            }
            _ => {
                debug!(
                    breaker = %self.config.name,
                    "Failure {}/{}", inner.failure_count, inner.adaptive_threshold
                );
            }
        }
    }

    /// Open the circuit immediately
    pub async fn trip(&self, reason: &str) {
        let mut inner = self.inner.write().await;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_time = Some(Utc::now());
        self.open(&mut inner, reason);
    }

    /// Close the circuit and clear counters without adapting the threshold
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        warn!(breaker = %self.config.name, "Circuit breaker force-closed");
    }

    pub async fn snapshot(&self) -> CircuitBreakerState {
        let mut inner = self.inner.write().await;
        self.refresh(&mut inner);
        CircuitBreakerState {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            adaptive_threshold: inner.adaptive_threshold,
            last_failure_time: inner.last_failure_time,
            recorded_calls: inner.call_history.len(),
            total_trips: self.total_trips.load(Ordering::SeqCst),
        }
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        if elapsed > self.config.recovery_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            info!(breaker = %self.config.name, "Circuit breaker transitioning to HALF-OPEN");
        }
    }

    fn retry_in(&self, inner: &BreakerInner) -> Duration {
        inner
            .last_failure
            .map(|at| self.config.recovery_timeout.saturating_sub(at.elapsed()))
            .unwrap_or_default()
    }

    fn open(&self, inner: &mut BreakerInner, reason: &str) {
        if inner.state == CircuitState::Open {
            return;
        }
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        self.total_trips.fetch_add(1, Ordering::SeqCst);
        warn!(
            breaker = %self.config.name,
            threshold = inner.adaptive_threshold,
            "Circuit breaker TRIPPED: {}", reason
        );
    }

    fn close(&self, inner: &mut BreakerInner) {
        let previous = inner.adaptive_threshold;
        inner.adaptive_threshold = self.recalculate_threshold(inner);
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;

        info!(
            breaker = %self.config.name,
            "Circuit breaker CLOSED, threshold {} -> {}", previous, inner.adaptive_threshold
        );
    }

    fn recalculate_threshold(&self, inner: &BreakerInner) -> u32 {
        let current = inner.adaptive_threshold;
        let Some(rate) = success_rate(&inner.call_history, ADAPTATION_WINDOW) else {
            return current;
        };

        let ceiling = self
            .config
            .failure_threshold
            .saturating_mul(2)
            .clamp(MIN_THRESHOLD, MAX_THRESHOLD);

        let next = if rate > 0.95 && current < ceiling {
            current + 1
        } else if rate < 0.8 && current > MIN_THRESHOLD {
            current - 1
        } else {
            current
        };
        next.clamp(MIN_THRESHOLD, MAX_THRESHOLD)
    }
}

fn success_rate(history: &RingBuffer<CallRecord>, window: Duration) -> Option<f64> {
    let (total, ok) = history
        .iter()
        .filter(|c| c.at.elapsed() <= window)
        .fold((0u32, 0u32), |(total, ok), c| {
            (total + 1, ok + u32::from(c.success))
        });
    if total == 0 {
        None
    } else {
        Some(ok as f64 / total as f64)
    }
}
