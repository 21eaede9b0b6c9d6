//! Self-Reference Detector (spec §4.10). Flags when a requested container
//! is the control plane's own, to avoid log/exec feedback loops.
//!
//! Resolution order (spec §9 REDESIGN FLAGS - prefer labels over name
//! substring matching):
//! 1. Container labels match a configured `self_monitor_container_labels`
//!    entry - authoritative.
//! 2. Container hostname equals the control plane's own hostname.
//! 3. Container name exactly equals a configured
//!    `self_monitor_container_names` entry - last resort, deployments that
//!    can't set labels.
//!
//! Results are memoized per `(host_id, container_id)` via
//! [`cache::TimeoutCache`] since the label/name set for a running container
//! never changes for the life of that container.

use std::collections::HashMap;
use std::time::Duration;

use cache::TimeoutCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
  host_hash: u64,
  container_hash: u64,
}

impl Key {
  fn new(host_id: &str, container_id: &str) -> Self {
    use std::hash::{Hash as _, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    host_id.hash(&mut h);
    let host_hash = h.finish();
    let mut h = std::collections::hash_map::DefaultHasher::new();
    container_id.hash(&mut h);
    let container_hash = h.finish();
    Key {
      host_hash,
      container_hash,
    }
  }
}

/// Inspected facts about a container, enough to decide self-reference
/// without the caller needing to know the detector's resolution order.
pub struct ContainerIdentity<'a> {
  pub labels: &'a HashMap<String, String>,
  pub hostname: &'a str,
  pub name: &'a str,
}

pub struct SelfReferenceDetector {
  own_hostname: String,
  monitor_labels: Vec<String>,
  monitor_names: Vec<String>,
  cache: TimeoutCache<Key, bool>,
  cache_ttl: Duration,
}

impl SelfReferenceDetector {
  pub fn new(
    own_hostname: String,
    monitor_labels: Vec<String>,
    monitor_names: Vec<String>,
    cache_ttl: Duration,
  ) -> Self {
    SelfReferenceDetector {
      own_hostname,
      monitor_labels,
      monitor_names,
      cache: TimeoutCache::default(),
      cache_ttl,
    }
  }

  pub async fn is_self(
    &self,
    host_id: &str,
    container_id: &str,
    identity: ContainerIdentity<'_>,
  ) -> bool {
    let key = Key::new(host_id, container_id);
    let lock = self.cache.get_lock(key).await;
    let mut entry = lock.lock().await;

    let now = chrono::Utc::now().timestamp();
    if now - entry.last_ts < self.cache_ttl.as_secs() as i64 {
      if let Ok(cached) = entry.clone_res() {
        return cached;
      }
    }

    let result = self.evaluate(identity);
    entry.set(&Ok(result), now);
    result
  }

  fn evaluate(&self, identity: ContainerIdentity<'_>) -> bool {
    if self.matches_labels(identity.labels) {
      return true;
    }
    if !self.own_hostname.is_empty()
      && identity.hostname == self.own_hostname
    {
      return true;
    }
    self
      .monitor_names
      .iter()
      .any(|name| name == identity.name)
  }

  fn matches_labels(&self, labels: &HashMap<String, String>) -> bool {
    self.monitor_labels.iter().any(|spec| {
      match spec.split_once('=') {
        Some((k, v)) => labels.get(k).map(|actual| actual == v).unwrap_or(false),
        None => labels.contains_key(spec.as_str()),
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detector(labels: &[&str], names: &[&str], hostname: &str) -> SelfReferenceDetector {
    SelfReferenceDetector::new(
      hostname.to_string(),
      labels.iter().map(|s| s.to_string()).collect(),
      names.iter().map(|s| s.to_string()).collect(),
      Duration::from_secs(300),
    )
  }

  #[tokio::test]
  async fn label_match_wins_even_if_hostname_differs() {
    let det = detector(&["app=fleet-core"], &[], "some-other-host");
    let mut labels = HashMap::new();
    labels.insert("app".to_string(), "fleet-core".to_string());
    let identity = ContainerIdentity {
      labels: &labels,
      hostname: "unrelated",
      name: "unrelated",
    };
    assert!(det.is_self("h1", "c1", identity).await);
  }

  #[tokio::test]
  async fn hostname_fallback_when_no_label_match() {
    let det = detector(&["app=fleet-core"], &[], "fleet-core-abc123");
    let labels = HashMap::new();
    let identity = ContainerIdentity {
      labels: &labels,
      hostname: "fleet-core-abc123",
      name: "unrelated",
    };
    assert!(det.is_self("h1", "c1", identity).await);
  }

  #[tokio::test]
  async fn exact_name_last_resort() {
    let det = detector(&[], &["fleet-core"], "");
    let labels = HashMap::new();
    let identity = ContainerIdentity {
      labels: &labels,
      hostname: "whatever",
      name: "fleet-core",
    };
    assert!(det.is_self("h1", "c1", identity).await);
  }

  #[tokio::test]
  async fn no_match_is_not_self() {
    let det = detector(&["app=fleet-core"], &["fleet-core"], "fleet-core-host");
    let labels = HashMap::new();
    let identity = ContainerIdentity {
      labels: &labels,
      hostname: "other-host",
      name: "some-app",
    };
    assert!(!det.is_self("h1", "c1", identity).await);
  }
}
