//! Crate-level Multiplexer scenarios (spec §8 S1, S2), driven through the
//! public `StreamMultiplexer` surface with an in-memory `EntrySource` in
//! place of a real `bollard::Docker` log/stats stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::error::CoreResult;
use fleet_core::multiplexer::{EntrySource, Frame, StreamMultiplexer};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream, StreamExt as _};

/// Emits whatever the test feeds into `tx`, counting how many times the
/// multiplexer opened an upstream for it.
struct ChannelSource {
  opens: Arc<AtomicUsize>,
  rx: Mutex<Option<mpsc::UnboundedReceiver<u32>>>,
}

impl ChannelSource {
  fn new() -> (Arc<Self>, mpsc::UnboundedSender<u32>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let source = Arc::new(ChannelSource {
      opens: Arc::new(AtomicUsize::new(0)),
      rx: Mutex::new(Some(rx)),
    });
    (source, tx)
  }
}

#[async_trait]
impl EntrySource<u32> for ChannelSource {
  async fn open(&self) -> CoreResult<Pin<Box<dyn Stream<Item = CoreResult<u32>> + Send>>> {
    self.opens.fetch_add(1, Ordering::SeqCst);
    let rx = self.rx.lock().await.take().expect("upstream opened twice");
    Ok(Box::pin(UnboundedReceiverStream::new(rx).map(Ok)))
  }

  fn informational(&self) -> u32 {
    0
  }
}

// S1 — Shared log stream: two callers subscribing to the same key share
// exactly one upstream open and see the same sequence of entries.
#[tokio::test]
async fn s1_two_subscribers_share_one_upstream() {
  let mux = StreamMultiplexer::<u32>::new(10, 16, Duration::from_secs(300), 100);
  let (source, tx) = ChannelSource::new();
  let opens = source.opens.clone();

  let mut sub_a = mux.subscribe("container_logs/h1/c1", source.clone(), 0, false).await;
  let mut sub_b = mux.subscribe("container_logs/h1/c1", source.clone(), 0, false).await;

  tx.send(1).unwrap();
  tx.send(2).unwrap();

  assert!(matches!(sub_a.receiver.recv().await.unwrap(), Frame::Data(1)));
  assert!(matches!(sub_a.receiver.recv().await.unwrap(), Frame::Data(2)));
  assert!(matches!(sub_b.receiver.recv().await.unwrap(), Frame::Data(1)));
  assert!(matches!(sub_b.receiver.recv().await.unwrap(), Frame::Data(2)));

  assert_eq!(opens.load(Ordering::SeqCst), 1);
}

// S2 — Late join replay: upstream has produced 1500 entries against a
// ring of capacity 1000 (the `B` from the spec); a caller joining with
// tail=200 gets entries 1301..=1500 replayed, then live entries from 1501.
#[tokio::test]
async fn s2_late_subscriber_gets_tail_replay_then_live_entries() {
  let mux = StreamMultiplexer::<u32>::new(1000, 16, Duration::from_secs(300), 100);
  let (source, tx) = ChannelSource::new();

  let mut sub1 = mux.subscribe("container_logs/h1/c1", source.clone(), 0, false).await;
  for n in 1..=1500u32 {
    tx.send(n).unwrap();
  }
  for n in 1..=1500u32 {
    assert!(matches!(sub1.receiver.recv().await.unwrap(), Frame::Data(v) if v == n));
  }

  let mut sub2 = mux.subscribe("container_logs/h1/c1", source.clone(), 200, false).await;
  for n in 1301..=1500u32 {
    assert!(matches!(sub2.receiver.recv().await.unwrap(), Frame::Data(v) if v == n));
  }

  tx.send(1501).unwrap();
  tx.send(1502).unwrap();
  assert!(matches!(sub2.receiver.recv().await.unwrap(), Frame::Data(1501)));
  assert!(matches!(sub2.receiver.recv().await.unwrap(), Frame::Data(1502)));
}
