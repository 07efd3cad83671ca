use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::duration_secs;
use crate::marketplace::{OperationKind, ProviderError};
use crate::{ProviderId, ValidationError};

/// Runtime circuit state for one provider operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.failure_threshold == 0 {
            return Err(ValidationError::InvalidSetting {
                field: "circuit_breaker.failure_threshold",
                reason: String::from("must be at least 1"),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Thread-safe circuit breaker guarding one provider operation class.
///
/// Callers obtain a [`CallPermit`] before each network attempt and report the
/// attempt outcome through it. While `HalfOpen`, exactly one permit (the
/// probe) is outstanding; everyone else is rejected until the probe reports.
#[derive(Debug)]
pub struct CircuitBreaker {
    scope: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            scope: String::from("upstream"),
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    /// Names the guarded call in rejection errors and logs.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Admits or rejects one attempt.
    ///
    /// An `Open` breaker whose recovery timeout has elapsed moves to
    /// `HalfOpen` and hands out the single probe permit.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, ProviderError> {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(ProviderError::circuit_open(&self.scope))
                } else {
                    inner.probe_in_flight = true;
                    Ok(CallPermit::new(self, true))
                }
            }
            CircuitState::Open => {
                let can_probe = inner
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);

                if can_probe {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(scope = %self.scope, "circuit breaker half-open; admitting probe");
                    Ok(CallPermit::new(self, true))
                } else {
                    Err(ProviderError::circuit_open(&self.scope))
                }
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.consecutive_failures
    }

    /// Forces the breaker back to `Closed`.
    pub fn reset(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        *inner = CircuitInner::default();
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        if probe {
            inner.probe_in_flight = false;
        } else if inner.state != CircuitState::Closed {
            // Only the probe may close a breaker that has left `Closed`.
            return;
        }
        if inner.state != CircuitState::Closed {
            tracing::info!(scope = %self.scope, "circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        if probe {
            inner.probe_in_flight = false;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(scope = %self.scope, "probe failed; circuit breaker re-opened");
            return;
        }

        // Late failures from attempts admitted before the breaker opened do
        // not extend the recovery window.
        if inner.state != CircuitState::Closed {
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if inner.consecutive_failures >= self.config.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                scope = %self.scope,
                failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
        }
    }

    fn release_probe(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.probe_in_flight = false;
    }
}

/// Admission to make one attempt through a [`CircuitBreaker`].
///
/// Dropping a permit without recording an outcome (for example when the
/// attempt is cancelled) frees the probe slot without changing state.
#[derive(Debug)]
#[must_use = "record the attempt outcome through the permit"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }

    /// Settles an attempt whose outcome says nothing about provider health.
    ///
    /// Neither the failure count nor the state changes; a probe slot is freed
    /// for the next caller.
    pub fn release(mut self) {
        self.settled = true;
        if self.probe {
            self.breaker.release_probe();
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Breakers keyed by (provider, operation class), created on first use.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    configs: HashMap<ProviderId, CircuitBreakerConfig>,
    breakers: Mutex<HashMap<(ProviderId, OperationKind), Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the thresholds used for `provider`'s breakers created afterwards.
    pub fn configure(&mut self, provider: ProviderId, config: CircuitBreakerConfig) {
        self.configs.insert(provider, config);
    }

    pub fn breaker(&self, provider: &ProviderId, operation: OperationKind) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .expect("breaker registry lock is not poisoned");
        breakers
            .entry((provider.clone(), operation))
            .or_insert_with(|| {
                let config = self.configs.get(provider).copied().unwrap_or_default();
                Arc::new(
                    CircuitBreaker::new(config).with_scope(format!("'{provider}' {operation}")),
                )
            })
            .clone()
    }

    /// Current state without creating a breaker; untouched pairs are `Closed`.
    pub fn state(&self, provider: &ProviderId, operation: OperationKind) -> CircuitState {
        let breakers = self
            .breakers
            .lock()
            .expect("breaker registry lock is not poisoned");
        breakers
            .get(&(provider.clone(), operation))
            .map(|breaker| breaker.state())
            .unwrap_or(CircuitState::Closed)
    }
}
