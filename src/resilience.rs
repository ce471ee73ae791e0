//! Retry and circuit-breaker policies.
//!
//! Three independently configured policies (bus publish, message processing,
//! endpoint reconnect) wrap fallible async operations with bounded retries,
//! backoff, an optional wall-clock budget, and cooperative cancellation. A
//! cancellation always surfaces as [`GatewayError::Cancelled`] regardless of
//! the underlying error; retries observe the token before every attempt and
//! during backoff sleeps.
//!
//! The windowed [`CircuitBreaker`] fails fast during a downstream outage:
//! it opens when the failure ratio over a sampling window exceeds the
//! configured threshold (given minimum throughput), stays open for the break
//! duration, then admits a single half-open probe.

use crate::config::{BreakerConfig, PolicyConfig};
use crate::error::{GatewayError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backoff shape between retry attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Delay doubles each attempt, capped.
    Exponential {
        /// Initial delay.
        base: Duration,
        /// Upper bound on the delay.
        cap: Duration,
    },
    /// Fixed delay between attempts.
    Linear {
        /// Step duration.
        step: Duration,
    },
}

impl Backoff {
    /// Builds the backoff shape described by a policy config section.
    pub fn from_config(config: &PolicyConfig) -> Self {
        let base = Duration::from_millis(config.base_delay_ms);
        if config.backoff == "linear" {
            Self::Linear { step: base }
        } else {
            Self::Exponential {
                base,
                cap: Duration::from_millis(config.max_delay_ms.unwrap_or(config.base_delay_ms)),
            }
        }
    }

    /// The delay before the first retry.
    pub fn first(&self) -> Duration {
        match self {
            Self::Exponential { base, .. } => *base,
            Self::Linear { step } => *step,
        }
    }

    /// The delay following `current`.
    pub fn advance(&self, current: Duration) -> Duration {
        match self {
            Self::Exponential { cap, .. } => std::cmp::min(*cap, current * 2),
            Self::Linear { step } => *step,
        }
    }
}

/// A bounded-retry policy with backoff, wall-clock budget, and cancellation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    label: &'static str,
    max_attempts: u32,
    backoff: Backoff,
    timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Builds a policy from its config section.
    pub fn from_config(label: &'static str, config: &PolicyConfig) -> Self {
        Self {
            label,
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::from_config(config),
            timeout: config.timeout_ms.map(Duration::from_millis),
        }
    }

    /// Runs `op` under this policy.
    ///
    /// `op` is re-invoked for each attempt. Errors whose
    /// [`GatewayError::is_retriable`] returns false end the loop immediately;
    /// so does exhausting `max_attempts` or the wall-clock budget.
    pub async fn execute<T, F, Fut>(&self, token: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = self
            .timeout
            .map(|budget| tokio::time::Instant::now() + budget);
        let mut attempt = 0u32;
        let mut delay = self.backoff.first();

        loop {
            if token.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            attempt += 1;

            let outcome = tokio::select! {
                _ = token.cancelled() => return Err(GatewayError::Cancelled),
                outcome = self.bounded(deadline, op()) => outcome,
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(policy = self.label, attempt, "Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retriable() => return Err(e),
                Err(e) => {
                    if attempt >= self.max_attempts {
                        warn!(
                            policy = self.label,
                            attempts = attempt,
                            "Giving up after max attempts: {}",
                            e
                        );
                        return Err(e);
                    }
                    warn!(
                        policy = self.label,
                        attempt,
                        max = self.max_attempts,
                        "Attempt failed: {}. Retrying in {:?}",
                        e,
                        delay
                    );

                    tokio::select! {
                        _ = token.cancelled() => return Err(GatewayError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if let Some(d) = deadline {
                        if tokio::time::Instant::now() >= d {
                            return Err(GatewayError::internal(format!(
                                "{} policy exhausted its wall-clock budget",
                                self.label
                            )));
                        }
                    }
                    delay = self.backoff.advance(delay);
                }
            }
        }
    }

    async fn bounded<T>(
        &self,
        deadline: Option<tokio::time::Instant>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match deadline {
            Some(d) => match tokio::time::timeout_at(d, fut).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::internal(format!(
                    "{} policy exhausted its wall-clock budget",
                    self.label
                ))),
            },
            None => fut.await,
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed,
    Open { since: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    // (instant, succeeded) outcomes inside the sampling window
    outcomes: VecDeque<(Instant, bool)>,
}

/// Failure-ratio circuit breaker with a half-open probe.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_ratio: f64,
    window: Duration,
    min_throughput: u32,
    break_duration: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a breaker from raw parameters.
    pub fn new(
        failure_ratio: f64,
        window: Duration,
        min_throughput: u32,
        break_duration: Duration,
    ) -> Self {
        Self {
            failure_ratio,
            window,
            min_throughput,
            break_duration,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                outcomes: VecDeque::new(),
            }),
        }
    }

    /// Builds a breaker from its config section.
    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(
            config.failure_ratio,
            Duration::from_secs(config.window_secs),
            config.min_throughput,
            Duration::from_secs(config.break_secs),
        )
    }

    /// Admission check. `Err(CircuitOpen)` means fail fast; an `Ok` from the
    /// half-open state makes the caller the probe.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open { since } => {
                if since.elapsed() >= self.break_duration {
                    debug!("Circuit breaker half-open; admitting probe");
                    inner.state = BreakerState::HalfOpen {
                        probe_in_flight: true,
                    };
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen)
                }
            }
            BreakerState::HalfOpen {
                ref mut probe_in_flight,
            } => {
                if *probe_in_flight {
                    Err(GatewayError::CircuitOpen)
                } else {
                    *probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records a successful outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen { .. } => {
                info!("Circuit breaker probe succeeded; closing");
                inner.state = BreakerState::Closed;
                inner.outcomes.clear();
            }
            BreakerState::Closed => {
                let now = Instant::now();
                inner.outcomes.push_back((now, true));
                self.prune(&mut inner, now);
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Records a failed outcome; may open the breaker.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen { .. } => {
                warn!("Circuit breaker probe failed; reopening");
                inner.state = BreakerState::Open {
                    since: Instant::now(),
                };
            }
            BreakerState::Closed => {
                let now = Instant::now();
                inner.outcomes.push_back((now, false));
                self.prune(&mut inner, now);

                let total = inner.outcomes.len() as u32;
                if total >= self.min_throughput {
                    let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count();
                    let ratio = failures as f64 / total as f64;
                    if ratio > self.failure_ratio {
                        warn!(
                            failures,
                            total,
                            "Circuit breaker opening for {:?}",
                            self.break_duration
                        );
                        inner.state = BreakerState::Open { since: now };
                        inner.outcomes.clear();
                    }
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Whether the breaker is currently rejecting calls outright.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Open { since } => since.elapsed() < self.break_duration,
            _ => false,
        }
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some((ts, _)) = inner.outcomes.front() {
            if now.duration_since(*ts) > self.window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }
    }
}
