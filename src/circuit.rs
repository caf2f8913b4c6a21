//! Per-service circuit breakers.
//!
//! ```text
//!   Closed ──(failure_threshold consecutive failures)──> Open
//!   Open ──(reset_timeout elapsed)──> HalfOpen (one probe)
//!   HalfOpen ──(probe succeeds)──> Closed
//!   HalfOpen ──(probe fails)──> Open, reset window restarts
//! ```
//!
//! Every call runs under its own timeout; a timeout counts as a failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout};
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Read-only diagnostic snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStatus {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    /// Time until the next call is allowed; `None` when calls flow freely.
    pub retry_in: Option<Duration>,
    pub trips: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    trips: u64,
}

/// Failure-isolating wrapper around calls to one service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    call_timeout: Duration,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            failure_threshold: config.failure_threshold.max(1),
            call_timeout: config.call_timeout(),
            reset_timeout: config.reset_timeout(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                trips: 0,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `call` through the breaker.
    ///
    /// Returns `CircuitOpen` without polling `call` while the breaker is open
    /// or while the half-open probe is already in flight.
    pub async fn execute<F, T>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut permit = self.acquire()?;

        let result = match timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout {
                operation: format!("call to {}", self.service),
                after: self.call_timeout,
            }),
        };

        match &result {
            Ok(_) => self.on_success(permit.probe),
            Err(e) if e.counts_as_service_failure() => self.on_failure(permit.probe, e),
            Err(_) => {}
        }
        permit.complete();
        result
    }

    /// Whether a call would currently be rejected, without claiming the
    /// half-open probe slot or changing state.
    pub fn check(&self) -> Result<()> {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(self.reset_timeout, |t| t.elapsed());
                if elapsed < self.reset_timeout {
                    Err(OrchestratorError::CircuitOpen {
                        service: self.service.clone(),
                        retry_in: self.reset_timeout - elapsed,
                    })
                } else {
                    Ok(())
                }
            }
            CircuitState::HalfOpen if inner.probe_in_flight => Err(OrchestratorError::CircuitOpen {
                service: self.service.clone(),
                retry_in: Duration::ZERO,
            }),
            CircuitState::HalfOpen => Ok(()),
        }
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::normal(self)),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(self.reset_timeout, |t| t.elapsed());
                if elapsed < self.reset_timeout {
                    return Err(OrchestratorError::CircuitOpen {
                        service: self.service.clone(),
                        retry_in: self.reset_timeout - elapsed,
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                info!(service = %self.service, "circuit half-open, allowing one probe");
                Ok(Permit::probe(self))
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(OrchestratorError::CircuitOpen {
                        service: self.service.clone(),
                        retry_in: Duration::ZERO,
                    });
                }
                inner.probe_in_flight = true;
                Ok(Permit::probe(self))
            }
        }
    }

    /// Only the probe may close a breaker that is not closed; a call admitted
    /// before the breaker tripped settles without effect.
    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if !probe && inner.state != CircuitState::Closed {
            return;
        }
        if inner.state == CircuitState::HalfOpen {
            info!(service = %self.service, "probe succeeded, circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn on_failure(&self, probe: bool, error: &OrchestratorError) {
        let mut inner = self.lock();
        if !probe && inner.state != CircuitState::Closed {
            return;
        }
        inner.consecutive_failures += 1;
        let reopen = inner.state == CircuitState::HalfOpen;
        if reopen || inner.consecutive_failures >= self.failure_threshold {
            if inner.state != CircuitState::Open {
                inner.trips += 1;
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                service = %self.service,
                failures = inner.consecutive_failures,
                reopen,
                error = %error,
                "circuit opened"
            );
        }
    }

    /// Current state, failure count and time until the next allowed attempt.
    pub fn status(&self) -> CircuitStatus {
        let inner = self.lock();
        let retry_in = match inner.state {
            CircuitState::Closed => None,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(self.reset_timeout, |t| t.elapsed());
                Some(self.reset_timeout.saturating_sub(elapsed))
            }
            CircuitState::HalfOpen if inner.probe_in_flight => Some(Duration::ZERO),
            CircuitState::HalfOpen => None,
        };
        CircuitStatus {
            service: self.service.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.failure_threshold,
            retry_in,
            trips: inner.trips,
        }
    }
}

/// Releases the half-open probe slot if the call future is dropped mid-flight.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    done: bool,
}

impl<'a> Permit<'a> {
    fn normal(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            probe: false,
            done: false,
        }
    }

    fn probe(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            probe: true,
            done: false,
        }
    }

    fn complete(&mut self) {
        self.done = true;
        if self.probe {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.done {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

/// One breaker per service, created on first use with shared settings.
#[derive(Debug)]
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(service, &self.config))),
        )
    }

    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut statuses: Vec<CircuitStatus> = breakers.values().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.service.cmp(&b.service));
        statuses
    }
}
