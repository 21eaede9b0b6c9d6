//! Environment-driven configuration (spec §6 "Environment knobs").
//! Loaded with `envy` the way the teacher's `bin/core` loads its config,
//! with an optional `.env` file picked up via `dotenvy` first.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_buffer_size() -> usize {
  1000
}
fn default_max_total_streams() -> usize {
  100
}
fn default_stream_idle_ttl_seconds() -> u64 {
  300
}
fn default_health_check_interval_seconds() -> u64 {
  300
}
fn default_breaker_failure_threshold() -> u32 {
  3
}
fn default_breaker_recovery_seconds() -> u64 {
  30
}
fn default_breaker_success_threshold() -> u32 {
  2
}
fn default_subscriber_queue_depth() -> usize {
  256
}
fn default_subscriber_send_timeout_seconds() -> u64 {
  5
}
fn default_operation_timeout_seconds() -> u64 {
  30
}
fn default_permission_cache_ttl_seconds() -> u64 {
  60
}
fn default_self_reference_cache_ttl_seconds() -> u64 {
  300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
  pub buffer_size: usize,
  pub max_total_streams: usize,
  pub stream_idle_ttl_seconds: u64,
  pub health_check_interval_seconds: u64,
  pub breaker_failure_threshold: u32,
  pub breaker_recovery_seconds: u64,
  pub breaker_success_threshold: u32,
  pub subscriber_queue_depth: usize,
  pub subscriber_send_timeout_seconds: u64,
  pub operation_timeout_seconds: u64,
  pub permission_cache_ttl_seconds: u64,
  pub self_reference_cache_ttl_seconds: u64,
  /// Comma-separated labels identifying the control plane's own
  /// container(s), e.g. `app=fleet-core`. Preferred self-reference signal
  /// (spec §9 REDESIGN FLAGS - prefer labels over name substring matching).
  /// Kept as a plain `String` (rather than `Vec<String>`) because `envy`
  /// maps one env var to one scalar field; split with `labels()`.
  pub self_monitor_container_labels: String,
  /// Comma-separated exact container names also treated as "the control
  /// plane", kept only as a fallback for deployments that can't set labels.
  pub self_monitor_container_names: String,
  /// hex-encoded 32-byte key, process-wide, used by the Credential Store.
  pub encryption_key: String,
}

impl Default for CoreConfig {
  fn default() -> Self {
    CoreConfig {
      buffer_size: default_buffer_size(),
      max_total_streams: default_max_total_streams(),
      stream_idle_ttl_seconds: default_stream_idle_ttl_seconds(),
      health_check_interval_seconds: default_health_check_interval_seconds(),
      breaker_failure_threshold: default_breaker_failure_threshold(),
      breaker_recovery_seconds: default_breaker_recovery_seconds(),
      breaker_success_threshold: default_breaker_success_threshold(),
      subscriber_queue_depth: default_subscriber_queue_depth(),
      subscriber_send_timeout_seconds: default_subscriber_send_timeout_seconds(),
      operation_timeout_seconds: default_operation_timeout_seconds(),
      permission_cache_ttl_seconds: default_permission_cache_ttl_seconds(),
      self_reference_cache_ttl_seconds: default_self_reference_cache_ttl_seconds(),
      self_monitor_container_labels: String::new(),
      self_monitor_container_names: String::new(),
      encryption_key: String::new(),
    }
  }
}

impl CoreConfig {
  /// Loads a `.env` file if present (ignored if absent), then overlays
  /// `FLEET_*`-prefixed environment variables onto the defaults above,
  /// mirroring the teacher's dotenvy + envy startup sequence.
  pub fn load() -> anyhow::Result<Self> {
    let _ = dotenvy::dotenv();
    let config =
      envy::prefixed("FLEET_").from_env::<CoreConfig>()?;
    if config.encryption_key.is_empty() {
      anyhow::bail!(
        "FLEET_ENCRYPTION_KEY must be set to a 64-character hex string (32 bytes)"
      );
    }
    Ok(config)
  }

  pub fn health_check_interval(&self) -> Duration {
    Duration::from_secs(self.health_check_interval_seconds)
  }

  pub fn stream_idle_ttl(&self) -> Duration {
    Duration::from_secs(self.stream_idle_ttl_seconds)
  }

  pub fn breaker_recovery_timeout(&self) -> Duration {
    Duration::from_secs(self.breaker_recovery_seconds)
  }

  pub fn subscriber_send_timeout(&self) -> Duration {
    Duration::from_secs(self.subscriber_send_timeout_seconds)
  }

  pub fn operation_timeout(&self) -> Duration {
    Duration::from_secs(self.operation_timeout_seconds)
  }

  pub fn permission_cache_ttl(&self) -> Duration {
    Duration::from_secs(self.permission_cache_ttl_seconds)
  }

  pub fn self_reference_cache_ttl(&self) -> Duration {
    Duration::from_secs(self.self_reference_cache_ttl_seconds)
  }

  pub fn breaker_config(&self) -> breaker::BreakerConfig {
    breaker::BreakerConfig {
      failure_threshold: self.breaker_failure_threshold,
      recovery_timeout: self.breaker_recovery_timeout(),
      success_threshold: self.breaker_success_threshold,
    }
  }

  pub fn self_monitor_labels(&self) -> Vec<&str> {
    split_csv(&self.self_monitor_container_labels)
  }

  pub fn self_monitor_names(&self) -> Vec<&str> {
    split_csv(&self.self_monitor_container_names)
  }
}

fn split_csv(raw: &str) -> Vec<&str> {
  raw
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_spec() {
    let config = CoreConfig::default();
    assert_eq!(config.buffer_size, 1000);
    assert_eq!(config.max_total_streams, 100);
    assert_eq!(config.stream_idle_ttl_seconds, 300);
    assert_eq!(config.health_check_interval_seconds, 300);
    assert_eq!(config.breaker_failure_threshold, 3);
    assert_eq!(config.breaker_recovery_seconds, 30);
    assert_eq!(config.breaker_success_threshold, 2);
  }
}
