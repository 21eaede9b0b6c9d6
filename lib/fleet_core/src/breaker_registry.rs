//! Per-host circuit breaker registry backing the Connection Manager (spec
//! §4.3). One [`breaker::CircuitBreaker`] per host id, created lazily with
//! the process-wide config and kept for the life of the process.

use std::sync::Arc;

use dashmap::DashMap;

pub struct BreakerRegistry {
  breakers: DashMap<String, Arc<breaker::CircuitBreaker>>,
  config: breaker::BreakerConfig,
}

impl BreakerRegistry {
  pub fn new(config: breaker::BreakerConfig) -> Self {
    BreakerRegistry {
      breakers: DashMap::new(),
      config,
    }
  }

  pub fn get(&self, host_id: &str) -> Arc<breaker::CircuitBreaker> {
    if let Some(existing) = self.breakers.get(host_id) {
      return existing.clone();
    }
    self
      .breakers
      .entry(host_id.to_string())
      .or_insert_with(|| {
        Arc::new(breaker::CircuitBreaker::new(
          host_id.to_string(),
          self.config,
        ))
      })
      .clone()
  }

  pub async fn snapshot(
    &self,
    host_id: &str,
  ) -> Option<breaker::BreakerSnapshot> {
    match self.breakers.get(host_id) {
      Some(b) => Some(b.snapshot().await),
      None => None,
    }
  }

  pub async fn reset(&self, host_id: &str) {
    if let Some(b) = self.breakers.get(host_id) {
      b.reset().await;
    }
  }

  pub fn remove(&self, host_id: &str) {
    self.breakers.remove(host_id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn returns_the_same_breaker_for_repeated_lookups() {
    let registry = BreakerRegistry::new(breaker::BreakerConfig::default());
    let a = registry.get("host-1");
    let b = registry.get("host-1");
    assert!(Arc::ptr_eq(&a, &b));
  }

  #[test]
  fn different_hosts_get_different_breakers() {
    let registry = BreakerRegistry::new(breaker::BreakerConfig::default());
    let a = registry.get("host-1");
    let b = registry.get("host-2");
    assert!(!Arc::ptr_eq(&a, &b));
  }
}
