//! Per-host circuit breaker.
//!
//! Protects a single dependency (an engine host) from repeated attempts
//! while it is unhealthy. Mirrors the classic closed/open/half-open state
//! machine; the caller decides which outcomes count as failures (only
//! transport/connection errors should — see `record_outcome`).

use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerMode {
  Closed,
  Open,
  HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
  pub failure_threshold: u32,
  pub recovery_timeout: Duration,
  pub success_threshold: u32,
}

impl Default for BreakerConfig {
  fn default() -> Self {
    BreakerConfig {
      failure_threshold: 3,
      recovery_timeout: Duration::from_secs(30),
      success_threshold: 2,
    }
  }
}

/// Point-in-time snapshot, safe to hand to an operator-facing introspection
/// endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
  pub mode: BreakerMode,
  pub consecutive_failures: u32,
  pub consecutive_half_open_successes: u32,
}

/// Returned by `try_acquire` when the breaker refuses the call.
#[derive(Debug, thiserror::Error)]
#[error("breaker '{name}' is open, retry after recovery timeout")]
pub struct BreakerOpenError {
  pub name: String,
}

struct State {
  mode: BreakerMode,
  consecutive_failures: u32,
  consecutive_half_open_successes: u32,
  opened_at: Option<Instant>,
}

impl Default for State {
  fn default() -> Self {
    State {
      mode: BreakerMode::Closed,
      consecutive_failures: 0,
      consecutive_half_open_successes: 0,
      opened_at: None,
    }
  }
}

/// A permit acquired from `try_acquire`. The caller MUST report the outcome
/// of the guarded call through `success` or `failure`; dropping it without
/// reporting leaves the breaker's counters unchanged (it does not count as
/// either outcome).
pub struct Permit<'a> {
  breaker: &'a CircuitBreaker,
}

impl Permit<'_> {
  pub async fn success(self) {
    self.breaker.record_success().await;
  }

  pub async fn failure(self) {
    self.breaker.record_failure().await;
  }
}

pub struct CircuitBreaker {
  name: String,
  config: BreakerConfig,
  state: Mutex<State>,
}

impl CircuitBreaker {
  pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
    CircuitBreaker {
      name: name.into(),
      config,
      state: Mutex::new(State::default()),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Admits the call, transitioning open -> half_open if the recovery
  /// timeout has elapsed. Returns `BreakerOpenError` otherwise.
  #[tracing::instrument("CircuitBreakerAcquire", skip(self), fields(name = %self.name))]
  pub async fn try_acquire(
    &self,
  ) -> Result<Permit<'_>, BreakerOpenError> {
    let mut state = self.state.lock().await;
    match state.mode {
      BreakerMode::Closed => Ok(Permit { breaker: self }),
      BreakerMode::HalfOpen => Ok(Permit { breaker: self }),
      BreakerMode::Open => {
        let elapsed = state
          .opened_at
          .map(|opened_at| opened_at.elapsed() >= self.config.recovery_timeout)
          .unwrap_or(false);
        if elapsed {
          state.mode = BreakerMode::HalfOpen;
          state.consecutive_half_open_successes = 0;
          tracing::info!(breaker = %self.name, "transitioned to half_open");
          Ok(Permit { breaker: self })
        } else {
          Err(BreakerOpenError {
            name: self.name.clone(),
          })
        }
      }
    }
  }

  /// Convenience wrapper around `try_acquire` for a fallible async call.
  /// `counts_as_failure` classifies whether an `Err` should be recorded
  /// against the breaker at all (e.g. a transport error does, a semantic
  /// "not found" from the upstream does not).
  pub async fn call<T, E>(
    &self,
    counts_as_failure: impl Fn(&E) -> bool,
    fut: impl Future<Output = Result<T, E>>,
  ) -> Result<T, CallError<E>> {
    let permit = self.try_acquire().await.map_err(CallError::Open)?;
    match fut.await {
      Ok(value) => {
        permit.success().await;
        Ok(value)
      }
      Err(e) => {
        if counts_as_failure(&e) {
          permit.failure().await;
        }
        Err(CallError::Inner(e))
      }
    }
  }

  async fn record_success(&self) {
    let mut state = self.state.lock().await;
    match state.mode {
      BreakerMode::HalfOpen => {
        state.consecutive_half_open_successes += 1;
        if state.consecutive_half_open_successes
          >= self.config.success_threshold
        {
          *state = State::default();
          tracing::info!(breaker = %self.name, "transitioned to closed");
        }
      }
      BreakerMode::Closed => {
        state.consecutive_failures = 0;
      }
      BreakerMode::Open => {
        // A stray success racing a concurrent half-open probe; ignore.
      }
    }
  }

  async fn record_failure(&self) {
    let mut state = self.state.lock().await;
    match state.mode {
      BreakerMode::HalfOpen => {
        state.mode = BreakerMode::Open;
        state.opened_at = Some(Instant::now());
        state.consecutive_half_open_successes = 0;
        tracing::warn!(breaker = %self.name, "half_open probe failed, re-opened");
      }
      BreakerMode::Closed => {
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.failure_threshold {
          state.mode = BreakerMode::Open;
          state.opened_at = Some(Instant::now());
          tracing::warn!(
            breaker = %self.name,
            failures = state.consecutive_failures,
            "transitioned to open"
          );
        }
      }
      BreakerMode::Open => {}
    }
  }

  pub async fn snapshot(&self) -> BreakerSnapshot {
    let state = self.state.lock().await;
    BreakerSnapshot {
      mode: state.mode,
      consecutive_failures: state.consecutive_failures,
      consecutive_half_open_successes: state.consecutive_half_open_successes,
    }
  }

  /// Manual reset, e.g. from an operator action.
  pub async fn reset(&self) {
    let mut state = self.state.lock().await;
    *state = State::default();
    tracing::info!(breaker = %self.name, "manually reset");
  }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError<E: std::fmt::Display + std::fmt::Debug> {
  #[error(transparent)]
  Open(#[from] BreakerOpenError),
  #[error("{0}")]
  Inner(E),
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config() -> BreakerConfig {
    BreakerConfig {
      failure_threshold: 3,
      recovery_timeout: Duration::from_millis(30),
      success_threshold: 2,
    }
  }

  #[tokio::test]
  async fn opens_after_threshold_failures() {
    let breaker = CircuitBreaker::new("h1", config());
    for _ in 0..3 {
      let permit = breaker.try_acquire().await.unwrap();
      permit.failure().await;
    }
    assert_eq!(breaker.snapshot().await.mode, BreakerMode::Open);
    assert!(breaker.try_acquire().await.is_err());
  }

  #[tokio::test]
  async fn half_open_after_recovery_then_closes_on_successes() {
    let breaker = CircuitBreaker::new("h1", config());
    for _ in 0..3 {
      let permit = breaker.try_acquire().await.unwrap();
      permit.failure().await;
    }
    assert!(breaker.try_acquire().await.is_err());

    tokio::time::sleep(Duration::from_millis(40)).await;

    let permit = breaker.try_acquire().await.expect("half-open should admit");
    assert_eq!(breaker.snapshot().await.mode, BreakerMode::HalfOpen);
    permit.success().await;
    assert_eq!(breaker.snapshot().await.mode, BreakerMode::HalfOpen);

    let permit = breaker.try_acquire().await.unwrap();
    permit.success().await;
    assert_eq!(breaker.snapshot().await.mode, BreakerMode::Closed);
  }

  #[tokio::test]
  async fn half_open_failure_reopens() {
    let breaker = CircuitBreaker::new("h1", config());
    for _ in 0..3 {
      let permit = breaker.try_acquire().await.unwrap();
      permit.failure().await;
    }
    tokio::time::sleep(Duration::from_millis(40)).await;
    let permit = breaker.try_acquire().await.unwrap();
    permit.failure().await;
    assert_eq!(breaker.snapshot().await.mode, BreakerMode::Open);
  }

  #[tokio::test]
  async fn call_skips_recording_when_not_classified_as_failure() {
    let breaker = CircuitBreaker::new("h1", config());
    for _ in 0..5 {
      let result: Result<(), CallError<&'static str>> = breaker
        .call(|_e| false, async { Err("not-found, not a transport error") })
        .await;
      assert!(result.is_err());
    }
    // None of the above counted, breaker stays closed.
    assert_eq!(breaker.snapshot().await.mode, BreakerMode::Closed);
  }

  #[tokio::test]
  async fn manual_reset_clears_open_state() {
    let breaker = CircuitBreaker::new("h1", config());
    for _ in 0..3 {
      let permit = breaker.try_acquire().await.unwrap();
      permit.failure().await;
    }
    assert_eq!(breaker.snapshot().await.mode, BreakerMode::Open);
    breaker.reset().await;
    assert_eq!(breaker.snapshot().await.mode, BreakerMode::Closed);
    assert!(breaker.try_acquire().await.is_ok());
  }
}
