// ============================================
// CHORUS - Circuit Breaker
// ============================================

//! Per-provider circuit breaker.
//!
//! ```text
//! CLOSED ──[failure_count >= threshold]──► OPEN
//!                                            │
//!                          [next call after open_timeout]
//!                                            ▼
//!                                        HALF_OPEN ──[trial fails]──► OPEN
//!                                            │
//!                                    [trial succeeds]
//!                                            ▼
//!                                         CLOSED
//! ```
//!
//! All transitions happen under the breaker's own mutex; the wrapped
//! operation runs outside it. HalfOpen admits a single trial call at a time.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a trial
    pub open_timeout: Duration,
    /// Deadline for a single guarded call
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of one breaker, for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Seconds since the last recorded failure
    pub last_failure_secs: Option<f64>,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `operation` under the configured call timeout.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.call_with_timeout(self.config.call_timeout, operation)
            .await
    }

    /// Run `operation` under an explicit deadline (used for streaming calls).
    ///
    /// Rejects immediately, without invoking `operation`, while the circuit
    /// is open or a half-open trial is already running.
    pub async fn call_with_timeout<F, Fut, T>(
        &self,
        timeout: Duration,
        operation: F,
    ) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let permit = self.admit()?;

        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                permit.succeed();
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.fail();
                Err(ProviderError::Remote {
                    provider: self.provider.clone(),
                    message: format!("{:#}", e),
                })
            }
            Err(_) => {
                permit.fail();
                Err(ProviderError::Timeout {
                    provider: self.provider.clone(),
                    timeout,
                })
            }
        }
    }

    /// True while the breaker would let a call through: Closed, HalfOpen,
    /// or Open with its cooldown already elapsed.
    pub fn is_available(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.cooldown_elapsed(&inner),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_secs: inner.last_failure.map(|t| t.elapsed().as_secs_f64()),
        }
    }

    /// Force the circuit closed and forget the failure history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        tracing::info!(provider = %self.provider, "circuit breaker reset");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cooldown_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.config.open_timeout)
    }

    fn admit(&self) -> Result<Permit<'_>, ProviderError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                if !self.cooldown_elapsed(&inner) {
                    return Err(ProviderError::CircuitOpen {
                        provider: self.provider.clone(),
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                tracing::info!(provider = %self.provider, "circuit breaker OPEN -> HALF_OPEN");
                Ok(Permit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(ProviderError::TrialInProgress {
                        provider: self.provider.clone(),
                    });
                }
                inner.trial_in_flight = true;
                Ok(Permit::new(self, true))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.trial_in_flight = false;
                tracing::info!(provider = %self.provider, "circuit breaker HALF_OPEN -> CLOSED");
            }
            // Late results from calls admitted before the circuit opened
            // never close it; only a trial can.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        match inner.state {
            CircuitState::Closed => {
                inner.last_failure = Some(Instant::now());
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        provider = %self.provider,
                        failures = inner.failure_count,
                        "circuit breaker CLOSED -> OPEN"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.last_failure = Some(Instant::now());
                inner.trial_in_flight = false;
                tracing::warn!(provider = %self.provider, "circuit breaker HALF_OPEN -> OPEN");
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

/// Admission ticket for one call. Dropping it unsettled (the call future
/// was cancelled) records nothing but frees the half-open trial slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}
