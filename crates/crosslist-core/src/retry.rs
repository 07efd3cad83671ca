//! Retry logic with exponential backoff and jitter.
//!
//! [`RetryExecutor`] wraps one provider call. Before every attempt it asks the
//! (optional) [`CircuitBreaker`] for a permit, after every attempt it reports
//! the outcome back, and between attempts it sleeps for the delay computed by
//! [`Backoff`].

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::duration_secs;
use crate::marketplace::{ErrorKind, FailureCause, ProviderError};
use crate::ValidationError;

/// Backoff strategy for retrying failed requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed { delay: Duration },
    /// Uses an exponential delay between retries.
    ///
    /// The delay is `base * factor^attempt`, capped at `max`, then perturbed
    /// by a uniform `±jitter` fraction and floored at zero.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        /// Jitter as a fraction of the capped delay (0.1 = ±10%).
        jitter: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// Delay to wait after the failed attempt with 0-based index `attempt`.
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let seconds = base.as_secs_f64() * factor.powi(exponent);
                let capped = seconds.min(max.as_secs_f64());

                let perturbed = if jitter > 0.0 {
                    let spread = capped * jitter;
                    capped + (fastrand::f64() * 2.0 - 1.0) * spread
                } else {
                    capped
                };

                if perturbed.is_finite() && perturbed > 0.0 {
                    Duration::from_secs_f64(perturbed)
                } else {
                    Duration::ZERO
                }
            }
        }
    }
}

/// Retry configuration for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff_factor: f64,
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
    pub jitter: f64,
    pub retry_on_status: Vec<u16>,
    pub retry_on_connect: bool,
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 2.0,
            base_delay: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: 0.1,
            retry_on_status: vec![429, 500, 502, 503, 504],
            retry_on_connect: true,
            retry_on_timeout: true,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Constant `delay` between attempts, no jitter.
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_factor: 1.0,
            base_delay: delay,
            max_backoff: delay,
            jitter: 0.0,
            ..Self::default()
        }
    }

    /// Single attempt; failures surface immediately.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on_status(mut self, statuses: Vec<u16>) -> Self {
        self.retry_on_status = statuses;
        self
    }

    pub fn backoff(&self) -> Backoff {
        if self.backoff_factor == 1.0 && self.jitter == 0.0 {
            return Backoff::Fixed {
                delay: self.base_delay.min(self.max_backoff),
            };
        }
        Backoff::Exponential {
            base: self.base_delay,
            factor: self.backoff_factor,
            max: self.max_backoff,
            jitter: self.jitter,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff().delay(attempt)
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt may change the outcome of `error`.
    ///
    /// Only raw provider failures qualify; breaker, deadline and exhaustion
    /// errors are terminal.
    pub fn is_retryable(&self, error: &ProviderError) -> bool {
        if !matches!(error.kind(), ErrorKind::Transient | ErrorKind::Permanent) {
            return false;
        }
        match error.cause() {
            FailureCause::Status(status) => self.retry_on_status.contains(&status),
            FailureCause::Connect => self.retry_on_connect,
            FailureCause::Timeout => self.retry_on_timeout,
            FailureCause::Other => false,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ValidationError::InvalidSetting {
                field: "retry.backoff_factor",
                reason: format!("must be a finite value >= 1.0, got {}", self.backoff_factor),
            });
        }
        if !self.jitter.is_finite() || !(0.0..1.0).contains(&self.jitter) {
            return Err(ValidationError::InvalidSetting {
                field: "retry.jitter",
                reason: format!("must be within [0, 1), got {}", self.jitter),
            });
        }
        if self.max_backoff < self.base_delay {
            return Err(ValidationError::InvalidSetting {
                field: "retry.max_backoff",
                reason: String::from("must not be shorter than base_delay"),
            });
        }
        Ok(())
    }
}

/// Progress of one retried call.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// 0-based index of the attempt currently in flight.
    pub attempt_index: u32,
    pub last_error: Option<ProviderError>,
    pub next_backoff: Option<Duration>,
}

/// Summary of one finished attempt, handed to an [`AttemptObserver`].
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub attempt_index: u32,
    pub elapsed: Duration,
    pub error: Option<ProviderError>,
    /// Delay before the next attempt, `None` when this attempt was the last.
    pub next_backoff: Option<Duration>,
}

impl AttemptReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Receives one report per attempt that reached the network.
pub trait AttemptObserver: Send + Sync {
    fn on_attempt(&self, report: &AttemptReport);
}

/// Applies a [`RetryPolicy`] (and optionally a circuit breaker) to a call.
#[derive(Clone, Copy)]
pub struct RetryExecutor<'a> {
    policy: &'a RetryPolicy,
    breaker: Option<&'a CircuitBreaker>,
    observer: Option<&'a dyn AttemptObserver>,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            breaker: None,
            observer: None,
        }
    }

    pub fn with_breaker(mut self, breaker: &'a CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn AttemptObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runs `call` until it succeeds, fails permanently, the breaker rejects
    /// it, or the attempt budget is spent.
    ///
    /// `call` receives the 0-based attempt index. A breaker rejection returns
    /// [`ErrorKind::CircuitOpen`] without invoking `call`. Failures the policy
    /// retries, and any [`ErrorKind::Transient`] failure, count against the
    /// breaker; other failures leave its count untouched.
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let backoff = self.policy.backoff();
        let mut state = RetryState::default();

        loop {
            let permit = match self.breaker {
                Some(breaker) => Some(breaker.try_acquire()?),
                None => None,
            };

            let started = Instant::now();
            let result = call(state.attempt_index).await;
            let elapsed = started.elapsed();

            let error = match result {
                Ok(value) => {
                    if let Some(permit) = permit {
                        permit.record_success();
                    }
                    self.report(&state, elapsed, None, None);
                    if state.attempt_index > 0 {
                        tracing::debug!(
                            attempt = state.attempt_index + 1,
                            "call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let retryable = self.policy.is_retryable(&error);
            if let Some(permit) = permit {
                if retryable || error.kind() == ErrorKind::Transient {
                    permit.record_failure();
                } else {
                    permit.release();
                }
            }

            if !retryable {
                self.report(&state, elapsed, Some(error.clone()), None);
                return Err(error);
            }

            if state.attempt_index >= self.policy.max_retries {
                self.report(&state, elapsed, Some(error.clone()), None);
                return Err(ProviderError::retry_exhausted(
                    error,
                    state.attempt_index + 1,
                ));
            }

            let delay = backoff.delay(state.attempt_index);
            self.report(&state, elapsed, Some(error.clone()), Some(delay));
            tracing::debug!(
                attempt = state.attempt_index + 1,
                max_attempts = self.policy.total_attempts(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "retrying after transient failure"
            );

            state.last_error = Some(error);
            state.next_backoff = Some(delay);
            tokio::time::sleep(delay).await;
            state.attempt_index += 1;
        }
    }

    fn report(
        &self,
        state: &RetryState,
        elapsed: Duration,
        error: Option<ProviderError>,
        next_backoff: Option<Duration>,
    ) {
        if let Some(observer) = self.observer {
            observer.on_attempt(&AttemptReport {
                attempt_index: state.attempt_index,
                elapsed,
                error,
                next_backoff,
            });
        }
    }
}
