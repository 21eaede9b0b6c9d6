//! Stream Multiplexer (spec §4.7), "the densest contract": one upstream
//! engine stream fanned out to many subscribers per `(host, source_type,
//! resource)` key, with ring-buffer replay for late joiners and idle
//! teardown when the last subscriber leaves.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::{Stream, StreamExt as _};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CoreResult;

const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const DEGRADED_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// What a subscriber receives on its channel. Data entries carry the
/// provider's normalized `T`; the rest are control frames (spec §6).
#[derive(Debug, Clone)]
pub enum Frame<T> {
  Data(T),
  Heartbeat,
  Error(String),
  End,
}

/// Something a multiplexed stream can be opened from: an upstream entry
/// stream plus the single informational entry emitted in self-reference
/// degraded mode. Implemented per-resource by the caller (the Operation
/// Executor), closing over the concrete `Docker` handle and source id.
#[async_trait]
pub trait EntrySource<T>: Send + Sync {
  async fn open(&self) -> CoreResult<Pin<Box<dyn Stream<Item = CoreResult<T>> + Send>>>;

  /// The single entry sent to subscribers of a self-reference-suppressed
  /// stream in place of ever opening an upstream (spec §4.7 "degraded
  /// mode").
  fn informational(&self) -> T;
}

/// Builds the multiplexer key for one resource, `<source_type>/<host_id>/
/// <resource_id>`. Two different resources never collide; the same
/// resource from two callers always maps to the same `ActiveStream`.
pub fn stream_key(source_type: &str, host_id: &str, resource_id: &str) -> String {
  format!("{source_type}/{host_id}/{resource_id}")
}

struct ActiveStream<T> {
  ring: VecDeque<T>,
  ring_capacity: usize,
  subscribers: HashMap<Uuid, mpsc::Sender<Frame<T>>>,
  cancel: CancellationToken,
  spawned: bool,
  idle_since: Option<i64>,
}

impl<T> ActiveStream<T> {
  fn new(ring_capacity: usize) -> Self {
    ActiveStream {
      ring: VecDeque::with_capacity(ring_capacity),
      ring_capacity,
      subscribers: HashMap::new(),
      cancel: CancellationToken::new(),
      spawned: false,
      idle_since: None,
    }
  }
}

impl<T: Clone> ActiveStream<T> {
  fn push_ring(&mut self, entry: T) {
    if self.ring.len() == self.ring_capacity {
      self.ring.pop_front();
    }
    self.ring.push_back(entry);
  }

  /// Broadcasts to every subscriber, dropping (not blocking behind) any
  /// whose bounded queue is full or whose receiver is gone (spec §4.7
  /// "slow subscribers are dropped rather than slowing the source").
  fn broadcast(&mut self, frame: Frame<T>) {
    let mut dead = Vec::new();
    for (id, tx) in self.subscribers.iter() {
      if tx.try_send(frame.clone()).is_err() {
        dead.push(*id);
      }
    }
    for id in dead {
      self.subscribers.remove(&id);
    }
  }
}

pub struct Subscription<T> {
  pub id: Uuid,
  pub receiver: mpsc::Receiver<Frame<T>>,
}

pub struct StreamMultiplexer<T: Clone + Send + Sync + 'static> {
  streams: Arc<DashMap<String, Arc<Mutex<ActiveStream<T>>>>>,
  last_active: Arc<DashMap<String, i64>>,
  ring_capacity: usize,
  queue_depth: usize,
  idle_ttl: Duration,
  max_total_streams: usize,
}

impl<T: Clone + Send + Sync + 'static> StreamMultiplexer<T> {
  /// `max_total_streams` is the LRU cap on concurrently active stream keys
  /// (spec §6, default 100). A `subscribe` for a brand-new key past the cap
  /// evicts the least-recently-active existing stream before opening.
  pub fn new(
    ring_capacity: usize,
    queue_depth: usize,
    idle_ttl: Duration,
    max_total_streams: usize,
  ) -> Self {
    StreamMultiplexer {
      streams: Arc::new(DashMap::new()),
      last_active: Arc::new(DashMap::new()),
      ring_capacity,
      queue_depth,
      idle_ttl,
      max_total_streams,
    }
  }

  fn touch(&self, key: &str) {
    self.last_active.insert(key.to_string(), now_unix());
  }

  /// Evicts the least-recently-active stream (other than `incoming_key`)
  /// when the registry is already at `max_total_streams`, so a brand-new
  /// subscription always has room (spec §6 "LRU cap, default 100").
  async fn evict_lru_if_at_capacity(&self, incoming_key: &str) {
    if self.streams.len() < self.max_total_streams {
      return;
    }
    let lru_key = self
      .last_active
      .iter()
      .filter(|entry| entry.key() != incoming_key)
      .min_by_key(|entry| *entry.value())
      .map(|entry| entry.key().clone());
    let Some(lru_key) = lru_key else {
      return;
    };
    if let Some((_, active)) = self.streams.remove(&lru_key) {
      let mut guard = active.lock().await;
      guard.broadcast(Frame::Error(
        "evicted: max_total_streams capacity reached".to_string(),
      ));
      guard.cancel.cancel();
    }
    self.last_active.remove(&lru_key);
  }

  fn active(&self, key: &str) -> Arc<Mutex<ActiveStream<T>>> {
    if let Some(existing) = self.streams.get(key) {
      return existing.clone();
    }
    self
      .streams
      .entry(key.to_string())
      .or_insert_with(|| Arc::new(Mutex::new(ActiveStream::new(self.ring_capacity))))
      .clone()
  }

  /// Subscribes `key`, spawning the upstream task on the first subscriber
  /// and replaying up to `tail` buffered entries before the subscriber can
  /// observe any subsequent broadcast (spec §4.7 step 3 - both happen
  /// under the same per-key lock so there is no interleaving window).
  #[tracing::instrument("MultiplexerSubscribe", skip(self, source))]
  pub async fn subscribe(
    &self,
    key: &str,
    source: Arc<dyn EntrySource<T>>,
    tail: usize,
    self_reference: bool,
  ) -> Subscription<T> {
    if !self.streams.contains_key(key) {
      self.evict_lru_if_at_capacity(key).await;
    }
    let active = self.active(key);
    let mut guard = active.lock().await;

    if !guard.spawned {
      guard.spawned = true;
      if self_reference {
        self.spawn_degraded(key.to_string(), active.clone(), source.clone(), self.last_active.clone());
      } else {
        self.spawn_upstream(key.to_string(), active.clone(), source, self.last_active.clone());
      }
    }

    let (tx, rx) = mpsc::channel(self.queue_depth);
    let replay: Vec<T> = guard
      .ring
      .iter()
      .rev()
      .take(tail)
      .cloned()
      .collect::<Vec<_>>()
      .into_iter()
      .rev()
      .collect();
    for entry in replay {
      let _ = tx.try_send(Frame::Data(entry));
    }

    let id = Uuid::new_v4();
    guard.subscribers.insert(id, tx);
    guard.idle_since = None;
    self.touch(key);
    Subscription { id, receiver: rx }
  }

  /// Removes one subscriber. If the subscriber set becomes empty, marks
  /// the stream idle so the sweep in [`Self::run_idle_sweep`] can tear it
  /// down once `idle_ttl` elapses without a new subscriber (spec §4.7).
  pub async fn unsubscribe(&self, key: &str, id: Uuid) {
    let Some(active) = self.streams.get(key).map(|e| e.clone()) else {
      return;
    };
    let mut guard = active.lock().await;
    guard.subscribers.remove(&id);
    if guard.subscribers.is_empty() {
      guard.idle_since = Some(now_unix());
    }
  }

  fn spawn_upstream(
    &self,
    key: String,
    active: Arc<Mutex<ActiveStream<T>>>,
    source: Arc<dyn EntrySource<T>>,
    last_active: Arc<DashMap<String, i64>>,
  ) {
    let streams = self.streams.clone();
    tokio::spawn(async move {
      let cancel = active.lock().await.cancel.clone();
      let mut upstream = match source.open().await {
        Ok(stream) => stream,
        Err(e) => {
          active.lock().await.broadcast(Frame::Error(e.to_string()));
          streams.remove(&key);
          last_active.remove(&key);
          return;
        }
      };

      loop {
        tokio::select! {
          _ = cancel.cancelled() => {
            active.lock().await.broadcast(Frame::End);
            break;
          }
          item = upstream.next() => {
            match item {
              Some(Ok(entry)) => {
                let mut guard = active.lock().await;
                guard.push_ring(entry.clone());
                guard.broadcast(Frame::Data(entry));
                last_active.insert(key.clone(), now_unix());
              }
              Some(Err(e)) => {
                active.lock().await.broadcast(Frame::Error(e.to_string()));
                break;
              }
              None => {
                active.lock().await.broadcast(Frame::End);
                break;
              }
            }
          }
        }
      }
      streams.remove(&key);
      last_active.remove(&key);
    });
  }

  fn spawn_degraded(
    &self,
    key: String,
    active: Arc<Mutex<ActiveStream<T>>>,
    source: Arc<dyn EntrySource<T>>,
    last_active: Arc<DashMap<String, i64>>,
  ) {
    tokio::spawn(async move {
      let informational = source.informational();
      let cancel = {
        let mut guard = active.lock().await;
        guard.push_ring(informational.clone());
        guard.broadcast(Frame::Data(informational));
        guard.cancel.clone()
      };

      let mut ticker = tokio::time::interval(DEGRADED_HEARTBEAT_INTERVAL);
      loop {
        tokio::select! {
          _ = cancel.cancelled() => {
            active.lock().await.broadcast(Frame::End);
            break;
          }
          _ = ticker.tick() => {
            active.lock().await.broadcast(Frame::Heartbeat);
            last_active.insert(key.clone(), now_unix());
          }
        }
      }
    });
  }

  /// Periodically tears down streams that have had zero subscribers for
  /// longer than `idle_ttl` (spec §4.7 "idle timer", default 60 s check /
  /// 300 s TTL).
  pub async fn run_idle_sweep(&self, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(DEFAULT_IDLE_CHECK_INTERVAL);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = ticker.tick() => {}
      }
      let keys: Vec<String> = self
        .streams
        .iter()
        .map(|e| e.key().clone())
        .collect();
      for key in keys {
        let Some(active) = self.streams.get(&key).map(|e| e.clone()) else {
          continue;
        };
        let expired = {
          let guard = active.lock().await;
          guard.subscribers.is_empty()
            && guard
              .idle_since
              .map(|since| now_unix() - since >= self.idle_ttl.as_secs() as i64)
              .unwrap_or(false)
        };
        if expired {
          active.lock().await.cancel.cancel();
          self.streams.remove(&key);
          self.last_active.remove(&key);
        }
      }
    }
  }

  /// Cancels every active upstream, terminating all subscribers with a
  /// terminal error frame (spec §4.7 "cancelling the upstream ...
  /// terminates all subscribers with a terminal error frame").
  pub async fn shutdown(&self) {
    let keys: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
    for key in keys {
      if let Some((_, active)) = self.streams.remove(&key) {
        let mut guard = active.lock().await;
        guard.broadcast(Frame::Error("multiplexer shutting down".to_string()));
        guard.cancel.cancel();
      }
      self.last_active.remove(&key);
    }
  }
}

fn now_unix() -> i64 {
  chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct CountingSource {
    opens: Arc<AtomicUsize>,
    items: Vec<u32>,
  }

  #[async_trait]
  impl EntrySource<u32> for CountingSource {
    async fn open(&self) -> CoreResult<Pin<Box<dyn Stream<Item = CoreResult<u32>> + Send>>> {
      self.opens.fetch_add(1, Ordering::SeqCst);
      let items = self.items.clone();
      Ok(Box::pin(tokio_stream::iter(items.into_iter().map(Ok))))
    }

    fn informational(&self) -> u32 {
      0
    }
  }

  #[tokio::test]
  async fn single_upstream_is_shared_across_subscribers() {
    let mux = StreamMultiplexer::<u32>::new(10, 16, Duration::from_secs(300), 100);
    let opens = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(CountingSource {
      opens: opens.clone(),
      items: vec![1, 2, 3],
    });

    let mut sub1 = mux.subscribe("k", source.clone(), 0, false).await;
    let mut sub2 = mux.subscribe("k", source.clone(), 0, false).await;

    let first = sub1.receiver.recv().await.unwrap();
    assert!(matches!(first, Frame::Data(1)));
    let also_first = sub2.receiver.recv().await.unwrap();
    assert!(matches!(also_first, Frame::Data(1)));

    assert_eq!(opens.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn late_subscriber_replays_tail_before_broadcasts() {
    let mux = StreamMultiplexer::<u32>::new(10, 16, Duration::from_secs(300), 100);
    let source = Arc::new(CountingSource {
      opens: Arc::new(AtomicUsize::new(0)),
      items: vec![1, 2, 3, 4, 5],
    });

    let mut sub1 = mux.subscribe("k", source.clone(), 0, false).await;
    for _ in 0..5 {
      sub1.receiver.recv().await.unwrap();
    }

    let mut sub2 = mux.subscribe("k", source.clone(), 2, false).await;
    let replayed = sub2.receiver.recv().await.unwrap();
    assert!(matches!(replayed, Frame::Data(4)));
    let replayed2 = sub2.receiver.recv().await.unwrap();
    assert!(matches!(replayed2, Frame::Data(5)));
  }

  #[tokio::test]
  async fn degraded_mode_sends_informational_entry_without_opening_upstream() {
    let mux = StreamMultiplexer::<u32>::new(10, 16, Duration::from_secs(300), 100);
    let opens = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(CountingSource {
      opens: opens.clone(),
      items: vec![99],
    });

    let mut sub = mux.subscribe("self", source, 0, true).await;
    let frame = sub.receiver.recv().await.unwrap();
    assert!(matches!(frame, Frame::Data(0)));
    assert_eq!(opens.load(Ordering::SeqCst), 0);
  }

  struct PendingSource;

  #[async_trait]
  impl EntrySource<u32> for PendingSource {
    async fn open(&self) -> CoreResult<Pin<Box<dyn Stream<Item = CoreResult<u32>> + Send>>> {
      Ok(Box::pin(tokio_stream::pending()))
    }

    fn informational(&self) -> u32 {
      0
    }
  }

  #[tokio::test]
  async fn exceeding_max_total_streams_evicts_one_stream() {
    let mux = StreamMultiplexer::<u32>::new(10, 16, Duration::from_secs(300), 2);
    let source = Arc::new(PendingSource);

    let mut sub_a = mux.subscribe("a", source.clone(), 0, false).await;
    let mut sub_b = mux.subscribe("b", source.clone(), 0, false).await;
    let _sub_c = mux.subscribe("c", source.clone(), 0, false).await;

    assert_eq!(mux.streams.len(), 2);

    let a_evicted = matches!(
      tokio::time::timeout(Duration::from_millis(50), sub_a.receiver.recv()).await,
      Ok(Some(Frame::Error(_)))
    );
    let b_evicted = matches!(
      tokio::time::timeout(Duration::from_millis(50), sub_b.receiver.recv()).await,
      Ok(Some(Frame::Error(_)))
    );
    assert!(
      a_evicted ^ b_evicted,
      "exactly one of the two older streams should have been evicted"
    );
  }
}
