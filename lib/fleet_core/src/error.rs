//! Error taxonomy (spec §7). These are *kinds*, not one-error-type-per-
//! failure-site — every fallible core operation returns `Result<T, CoreError>`
//! and collaborators switch on `CoreError::kind()`-equivalent matching.

use breaker::BreakerOpenError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
  #[error("forbidden: {0}")]
  Forbidden(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("validation error: {0}")]
  Validation(String),

  /// Cannot reach the engine (network, SSH, TLS). Counts as a breaker
  /// failure.
  #[error("transport error: {0:#}")]
  Transport(#[source] anyhow::Error),

  /// The breaker itself refused the call.
  #[error("circuit breaker open for host: {0}")]
  BreakerOpen(String),

  /// Engine returned a semantic failure (e.g. "container is not running").
  /// Does NOT count toward the breaker (spec §9 open question).
  #[error("engine error: {0:#}")]
  Engine(#[source] anyhow::Error),

  /// An engine call ran past `operation_timeout` (spec §5, default 30s).
  #[error("operation timed out after {0:?}")]
  Timeout(std::time::Duration),

  /// Upstream stream failed mid-flight; delivered to subscribers as a
  /// terminal frame rather than raised to the caller that started it.
  #[error("stream error: {0:#}")]
  Stream(#[source] anyhow::Error),

  #[error("cancelled")]
  Cancelled,

  #[error("internal error: {0:#}")]
  Internal(#[source] anyhow::Error),
}

impl CoreError {
  /// Only transport/connection failures count toward the circuit breaker
  /// (spec §9, §4.3, §7). Used as the `counts_as_failure` classifier passed
  /// to `breaker::CircuitBreaker::call`.
  pub fn counts_as_breaker_failure(&self) -> bool {
    matches!(self, CoreError::Transport(_))
  }

  pub fn forbidden(msg: impl Into<String>) -> Self {
    CoreError::Forbidden(msg.into())
  }

  pub fn not_found(msg: impl Into<String>) -> Self {
    CoreError::NotFound(msg.into())
  }

  pub fn validation(msg: impl Into<String>) -> Self {
    CoreError::Validation(msg.into())
  }

  pub fn transport(e: impl Into<anyhow::Error>) -> Self {
    CoreError::Transport(e.into())
  }

  pub fn engine(e: impl Into<anyhow::Error>) -> Self {
    CoreError::Engine(e.into())
  }

  pub fn internal(e: impl Into<anyhow::Error>) -> Self {
    CoreError::Internal(e.into())
  }

  pub fn timeout(budget: std::time::Duration) -> Self {
    CoreError::Timeout(budget)
  }
}

impl From<BreakerOpenError> for CoreError {
  fn from(e: BreakerOpenError) -> Self {
    CoreError::BreakerOpen(e.name)
  }
}

impl<E> From<breaker::CallError<E>> for CoreError
where
  E: Into<CoreError> + std::fmt::Display + std::fmt::Debug,
{
  fn from(e: breaker::CallError<E>) -> Self {
    match e {
      breaker::CallError::Open(open) => open.into(),
      breaker::CallError::Inner(inner) => inner.into(),
    }
  }
}

pub type CoreResult<T> = Result<T, CoreError>;
