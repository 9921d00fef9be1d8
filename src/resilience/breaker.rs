// Three-state circuit breaker
// Closed -> Open on repeated failures, Open -> HalfOpen after the timeout,
// HalfOpen -> Closed once enough probes succeed

//! # Circuit Breaker State Machine
//!
//! The breaker protects a downstream dependency by refusing work while that
//! dependency is failing. All admission decisions and outcome bookkeeping
//! happen under one mutex, so transitions are totally ordered and concurrent
//! probes can never exceed the half-open quota.
//!
//! ```text
//!            failures >= max_failures
//!   Closed ───────────────────────────▶ Open
//!     ▲                                  │ timeout elapsed,
//!     │ half_open_max_calls successes    │ next admission
//!     │                                  ▼
//!     └────────────────────────────── HalfOpen
//!                 any probe failure ──▶ Open
//! ```
//!
//! ## Permits
//!
//! [`CircuitBreaker::try_acquire`] hands out a [`Permit`]. The caller runs its
//! operation and then settles the permit with [`Permit::success`] or
//! [`Permit::failure`]. Each permit remembers the breaker generation it was
//! issued in; every transition bumps the generation, so the outcome of a call
//! admitted before a transition cannot disturb the new state.
//!
//! A half-open probe whose permit is dropped unsettled (its future was
//! cancelled) is recorded as a failure so the probe slot is not leaked.
//!
//! ## Rust Learning Notes:
//!
//! ### RAII guards
//! `Permit` implements `Drop`. Whatever path leaves the calling scope, normal
//! return, early `?` or cancellation, the breaker sees a consistent outcome.
//!
//! ### Panics as failures
//! [`CircuitBreaker::call`] wraps the future with `catch_unwind`, records the
//! failure and then calls `resume_unwind`, so an outer recovery layer still
//! observes the original panic.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state as observed from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Thresholds driving the state machine
#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    /// Consecutive failures in Closed before tripping
    pub max_failures: u32,
    /// How long to stay Open before admitting a probe
    pub timeout: Duration,
    /// Probes admitted per half-open episode, and successes needed to close
    pub half_open_max_calls: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

/// Why admission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("circuit breaker is open, retry in {retry_after:?}")]
    Open { retry_after: Duration },
    #[error("circuit breaker is half-open and the probe quota is exhausted")]
    HalfOpenFull,
}

/// Error returned by [`CircuitBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    #[error(transparent)]
    Rejected(Rejection),
    #[error("guarded call failed: {0}")]
    Failed(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u64,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
    generation: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            opened_at: None,
            half_open_in_flight: 0,
            half_open_successes: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, to: BreakerState, now: Instant) {
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        self.half_open_in_flight = 0;
        self.half_open_successes = 0;
        match to {
            BreakerState::Open => self.opened_at = Some(now),
            BreakerState::Closed => {
                self.failures = 0;
                self.opened_at = None;
            }
            BreakerState::HalfOpen => {}
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    policy: BreakerPolicy,
    inner: Mutex<BreakerInner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("state", &inner.state)
            .field("failures", &inner.failures)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn failures(&self) -> u64 {
        self.inner.lock().failures
    }

    /// Force the breaker back to Closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition(BreakerState::Closed, Instant::now());
        info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Decide admission. Counters for half-open probes are updated under the
    /// same lock as the decision.
    pub fn try_acquire(&self) -> std::result::Result<Permit<'_>, Rejection> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::Closed => Ok(self.permit(inner.generation, false)),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.policy.timeout {
                    inner.transition(BreakerState::HalfOpen, now);
                    inner.half_open_in_flight = 1;
                    info!(breaker = %self.name, "circuit breaker half-open, admitting probe");
                    Ok(self.permit(inner.generation, true))
                } else {
                    Err(Rejection::Open {
                        retry_after: self.policy.timeout - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.policy.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    debug!(
                        breaker = %self.name,
                        in_flight = inner.half_open_in_flight,
                        "admitting half-open probe"
                    );
                    Ok(self.permit(inner.generation, true))
                } else {
                    Err(Rejection::HalfOpenFull)
                }
            }
        }
    }

    fn permit(&self, generation: u64, probe: bool) -> Permit<'_> {
        Permit {
            breaker: self,
            generation,
            probe,
            settled: false,
        }
    }

    fn on_success(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            BreakerState::Closed => inner.failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.policy.half_open_max_calls {
                    inner.transition(BreakerState::Closed, Instant::now());
                    info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self, generation: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= u64::from(self.policy.max_failures) {
                    inner.transition(BreakerState::Open, now);
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.transition(BreakerState::Open, now);
                warn!(breaker = %self.name, "half-open probe failed, circuit breaker reopened");
            }
            BreakerState::Open => {}
        }
    }

    /// Run `fut` under the breaker. `Err` outcomes and panics count as
    /// failures; panics are re-raised after bookkeeping.
    pub async fn call<F, T, E>(&self, fut: F) -> std::result::Result<T, CallError<E>>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(CallError::Rejected)?;
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(err)) => {
                permit.failure();
                Err(CallError::Failed(err))
            }
            Err(panic) => {
                permit.failure();
                std::panic::resume_unwind(panic)
            }
        }
    }
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`]
#[must_use = "a permit must be settled with success() or failure()"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.on_failure(self.generation);
        }
    }
}
