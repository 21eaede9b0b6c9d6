//! Crate-level Self-Reference scenario (spec §8 S4): a stream subscribed
//! in degraded mode never opens an upstream, delivers exactly one
//! informational entry, and then periodic heartbeats.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::error::CoreResult;
use fleet_core::multiplexer::{EntrySource, Frame, StreamMultiplexer};
use fleet_core::self_reference::{ContainerIdentity, SelfReferenceDetector};
use tokio_stream::Stream;

struct NeverOpenedSource {
  opens: Arc<AtomicUsize>,
}

#[async_trait]
impl EntrySource<u32> for NeverOpenedSource {
  async fn open(&self) -> CoreResult<Pin<Box<dyn Stream<Item = CoreResult<u32>> + Send>>> {
    self.opens.fetch_add(1, Ordering::SeqCst);
    Ok(Box::pin(tokio_stream::pending()))
  }

  fn informational(&self) -> u32 {
    42
  }
}

#[tokio::test(start_paused = true)]
async fn s4_self_reference_degraded_mode_skips_upstream_and_heartbeats() {
  let detector = SelfReferenceDetector::new(
    "control-plane-host".to_string(),
    vec!["fleet.self".to_string()],
    vec![],
    Duration::from_secs(60),
  );

  let labels = HashMap::from([("fleet.self".to_string(), "true".to_string())]);
  let identity = ContainerIdentity {
    labels: &labels,
    hostname: "some-other-hostname",
    name: "some-other-name",
  };
  let is_self = detector.is_self("h1", "c1", identity).await;
  assert!(is_self, "label match must resolve to self-reference");

  let mux = StreamMultiplexer::<u32>::new(10, 16, Duration::from_secs(300), 100);
  let opens = Arc::new(AtomicUsize::new(0));
  let source = Arc::new(NeverOpenedSource { opens: opens.clone() });

  let mut sub = mux
    .subscribe("container_logs/h1/c1", source, 0, is_self)
    .await;

  let first = sub.receiver.recv().await.unwrap();
  assert!(matches!(first, Frame::Data(42)));
  assert_eq!(opens.load(Ordering::SeqCst), 0, "degraded mode must never open an upstream");

  // tokio::time::interval's first tick fires immediately on creation, so the
  // first heartbeat arrives right behind the informational entry; the
  // *second* one only shows up after a full interval elapses - that's the
  // one that actually proves the ticker is periodic under a paused clock.
  let second = sub.receiver.recv().await.unwrap();
  assert!(matches!(second, Frame::Heartbeat));

  tokio::time::advance(Duration::from_secs(31)).await;
  let third = sub.receiver.recv().await.unwrap();
  assert!(matches!(third, Frame::Heartbeat));

  assert_eq!(opens.load(Ordering::SeqCst), 0, "heartbeats must not trigger an upstream open");
}
