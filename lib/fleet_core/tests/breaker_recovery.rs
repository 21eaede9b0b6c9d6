//! Crate-level Circuit Breaker scenario (spec §8 S3), driven through
//! `BreakerRegistry` the same way `ConnectionManager::get` uses it, with a
//! fake fallible call standing in for the real engine dial.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use breaker::{BreakerConfig, BreakerMode, CallError};
use fleet_core::breaker_registry::BreakerRegistry;

fn counts_as_failure(_e: &&'static str) -> bool {
  true
}

// S3 — Breaker open: 3 consecutive transport failures trip the breaker;
// the 4th call is refused without ever touching the host; after the
// recovery timeout, a half-open probe is attempted, and two successes in a
// row close the breaker again.
#[tokio::test(start_paused = true)]
async fn s3_breaker_opens_then_recovers_after_two_half_open_successes() {
  let registry = BreakerRegistry::new(BreakerConfig::default());
  let host_id = "host-1";

  for _ in 0..3 {
    let breaker = registry.get(host_id);
    let result: Result<(), CallError<&'static str>> = breaker
      .call(counts_as_failure, async { Err("transport unreachable") })
      .await;
    assert!(matches!(result, Err(CallError::Inner(_))));
  }

  let snapshot = registry.snapshot(host_id).await.unwrap();
  assert_eq!(snapshot.mode, BreakerMode::Open);

  // 4th call: refused outright. The inner future must never run.
  let touched = Arc::new(AtomicBool::new(false));
  let touched_clone = touched.clone();
  let breaker = registry.get(host_id);
  let result: Result<(), CallError<&'static str>> = breaker
    .call(counts_as_failure, async move {
      touched_clone.store(true, Ordering::SeqCst);
      Ok(())
    })
    .await;
  assert!(matches!(result, Err(CallError::Open(_))));
  assert!(!touched.load(Ordering::SeqCst), "an open breaker must never reach the host");

  // Recovery timeout elapses (BreakerConfig::default() uses 30s).
  tokio::time::advance(Duration::from_secs(31)).await;

  for _ in 0..2 {
    let breaker = registry.get(host_id);
    let result: Result<(), CallError<&'static str>> =
      breaker.call(counts_as_failure, async { Ok(()) }).await;
    assert!(result.is_ok());
  }

  let snapshot = registry.snapshot(host_id).await.unwrap();
  assert_eq!(snapshot.mode, BreakerMode::Closed);
}

// S3 variant: a half-open probe that fails re-opens the breaker instead of
// closing it, and does not require exhausting the full failure threshold
// again.
#[tokio::test(start_paused = true)]
async fn half_open_probe_failure_reopens_breaker() {
  let registry = BreakerRegistry::new(BreakerConfig::default());
  let host_id = "host-2";

  for _ in 0..3 {
    let breaker = registry.get(host_id);
    let _: Result<(), CallError<&'static str>> = breaker
      .call(counts_as_failure, async { Err("transport unreachable") })
      .await;
  }
  assert_eq!(registry.snapshot(host_id).await.unwrap().mode, BreakerMode::Open);

  tokio::time::advance(Duration::from_secs(31)).await;

  let breaker = registry.get(host_id);
  let result: Result<(), CallError<&'static str>> = breaker
    .call(counts_as_failure, async { Err("still unreachable") })
    .await;
  assert!(matches!(result, Err(CallError::Inner(_))));
  assert_eq!(registry.snapshot(host_id).await.unwrap().mode, BreakerMode::Open);
}
