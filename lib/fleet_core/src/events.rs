//! Event Broadcaster (spec §4.9). At most one upstream Docker events
//! subscription per host; every event is enriched with the host id, then
//! matched against each subscriber's own filter before delivery. Shares the
//! dashmap-registry-of-`Arc<Mutex<...>>` shape used by
//! [`crate::connection::ConnectionManager`] and
//! [`crate::multiplexer::StreamMultiplexer`], grounded in the same
//! `docker.events(...)` call the teacher's pack-mate `dtop` uses for its
//! container lifecycle monitor.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::Docker;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::HostId;

/// Per-subscriber predicate (SPEC_FULL §2, grounded in the original
/// source's `websocket/events.py` filter shape).
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
  pub types: Vec<String>,
  pub actions: Vec<String>,
  pub labels: HashMap<String, String>,
  pub names: Vec<String>,
}

impl EventFilter {
  pub fn matches(&self, event: &EnrichedEvent) -> bool {
    if !self.types.is_empty() && !self.types.contains(&event.event_type) {
      return false;
    }
    if !self.actions.is_empty() && !self.actions.contains(&event.action) {
      return false;
    }
    if !self.names.is_empty()
      && !event
        .name
        .as_ref()
        .map(|name| self.names.contains(name))
        .unwrap_or(false)
    {
      return false;
    }
    if !self.labels.is_empty()
      && !self
        .labels
        .iter()
        .all(|(k, v)| event.labels.get(k) == Some(v))
    {
      return false;
    }
    true
  }
}

/// A Docker event, enriched with the host it came from (spec §4.9 "Each
/// event is enriched with host id").
#[derive(Debug, Clone)]
pub struct EnrichedEvent {
  pub host_id: HostId,
  pub timestamp: chrono::DateTime<chrono::Utc>,
  pub event_type: String,
  pub action: String,
  pub actor_id: Option<String>,
  pub name: Option<String>,
  pub labels: HashMap<String, String>,
  pub raw: serde_json::Value,
}

struct HostEventStream {
  subscribers: HashMap<Uuid, (mpsc::Sender<EnrichedEvent>, EventFilter)>,
  cancel: CancellationToken,
}

impl HostEventStream {
  fn new() -> Self {
    HostEventStream {
      subscribers: HashMap::new(),
      cancel: CancellationToken::new(),
    }
  }
}

pub struct EventBroadcaster {
  hosts: Arc<DashMap<HostId, Arc<Mutex<HostEventStream>>>>,
  queue_depth: usize,
}

impl EventBroadcaster {
  pub fn new(queue_depth: usize) -> Self {
    EventBroadcaster {
      hosts: Arc::new(DashMap::new()),
      queue_depth,
    }
  }

  /// Subscribes to one host's event stream, spawning the upstream
  /// `docker.events(...)` task on the first subscriber for that host
  /// (spec §4.9 "at most one upstream event subscription" per host).
  #[tracing::instrument("EventBroadcasterSubscribe", skip(self, docker, filter))]
  pub async fn subscribe(
    &self,
    host_id: &HostId,
    docker: Docker,
    filter: EventFilter,
  ) -> (Uuid, mpsc::Receiver<EnrichedEvent>) {
    let entry = if let Some(existing) = self.hosts.get(host_id) {
      existing.clone()
    } else {
      self
        .hosts
        .entry(host_id.clone())
        .or_insert_with(|| Arc::new(Mutex::new(HostEventStream::new())))
        .clone()
    };

    let mut guard = entry.lock().await;
    let newly_spawned = guard.subscribers.is_empty();
    let (tx, rx) = mpsc::channel(self.queue_depth);
    let id = Uuid::new_v4();
    guard.subscribers.insert(id, (tx, filter));
    let cancel = guard.cancel.clone();
    drop(guard);

    if newly_spawned {
      self.spawn_upstream(host_id.clone(), entry, docker, cancel);
    }

    (id, rx)
  }

  /// Removes one subscriber; cancels the upstream the moment the last one
  /// leaves (spec §4.9 "On last unsubscribe, the upstream is cancelled" -
  /// no idle grace period, unlike the Stream Multiplexer).
  pub async fn unsubscribe(&self, host_id: &HostId, id: Uuid) {
    let Some(entry) = self.hosts.get(host_id).map(|e| e.clone()) else {
      return;
    };
    let mut guard = entry.lock().await;
    guard.subscribers.remove(&id);
    if guard.subscribers.is_empty() {
      guard.cancel.cancel();
      drop(guard);
      self.hosts.remove(host_id);
    }
  }

  fn spawn_upstream(
    &self,
    host_id: HostId,
    entry: Arc<Mutex<HostEventStream>>,
    docker: Docker,
    cancel: CancellationToken,
  ) {
    tokio::spawn(async move {
      let mut stream = docker.events(None);
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          item = stream.next() => {
            match item {
              Some(Ok(raw_event)) => {
                let event = enrich(&host_id, raw_event);
                let mut guard = entry.lock().await;
                let mut dead = Vec::new();
                for (id, (tx, filter)) in guard.subscribers.iter() {
                  if !filter.matches(&event) {
                    continue;
                  }
                  if tx.try_send(event.clone()).is_err() {
                    dead.push(*id);
                  }
                }
                for id in dead {
                  guard.subscribers.remove(&id);
                }
              }
              Some(Err(_)) | None => break,
            }
          }
        }
      }
    });
  }
}

fn enrich(host_id: &HostId, event: bollard::models::EventMessage) -> EnrichedEvent {
  let actor = event.actor.unwrap_or_default();
  let labels = actor.attributes.unwrap_or_default();
  let name = labels.get("name").cloned();
  let raw = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);

  EnrichedEvent {
    host_id: host_id.clone(),
    timestamp: event
      .time
      .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
      .unwrap_or_else(chrono::Utc::now),
    event_type: event
      .typ
      .map(|t| t.to_string())
      .unwrap_or_else(|| "unknown".to_string()),
    action: event.action.unwrap_or_default(),
    actor_id: actor.id,
    name,
    labels,
    raw,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn event(event_type: &str, action: &str, name: Option<&str>) -> EnrichedEvent {
    EnrichedEvent {
      host_id: "h1".to_string(),
      timestamp: chrono::Utc::now(),
      event_type: event_type.to_string(),
      action: action.to_string(),
      actor_id: Some("abc".to_string()),
      name: name.map(str::to_string),
      labels: HashMap::new(),
      raw: serde_json::Value::Null,
    }
  }

  #[test]
  fn empty_filter_matches_everything() {
    let filter = EventFilter::default();
    assert!(filter.matches(&event("container", "start", None)));
  }

  #[test]
  fn type_filter_rejects_mismatched_type() {
    let filter = EventFilter {
      types: vec!["image".to_string()],
      ..Default::default()
    };
    assert!(!filter.matches(&event("container", "start", None)));
  }

  #[test]
  fn name_filter_requires_match() {
    let filter = EventFilter {
      names: vec!["web".to_string()],
      ..Default::default()
    };
    assert!(!filter.matches(&event("container", "start", Some("db"))));
    assert!(filter.matches(&event("container", "start", Some("web"))));
  }
}
