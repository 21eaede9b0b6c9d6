//! Connection Manager (spec §4.5). Owns one live [`ConnectionHandle`] per
//! host, dialed lazily and kept warm behind a per-host circuit breaker.
//! Mirrors the teacher's `PeripheryConnections` registry shape (a
//! `CloneCache` of `Arc<...>` connection objects with a cancellation token
//! per entry) but dials directly to the engine instead of proxying through
//! an agent process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
  breaker_registry::BreakerRegistry,
  credentials::CredentialStore,
  error::{CoreError, CoreResult},
  model::{HealthStatus, HostId},
  repository::HostRepository,
  transport::{ConnectionHandle, TransportDialer},
};

/// A managed, possibly-not-yet-dialed connection slot for one host. Dialing
/// is serialized per host via `dial_lock` so concurrent callers don't open
/// redundant sockets/tunnels for the same host.
pub struct ManagedConnection {
  handle: RwLock<Option<Arc<ConnectionHandle>>>,
  dial_lock: Mutex<()>,
  cancel: CancellationToken,
  last_error: RwLock<Option<String>>,
  last_health_ok_at: RwLock<Option<Instant>>,
}

impl ManagedConnection {
  fn new() -> Self {
    ManagedConnection {
      handle: RwLock::new(None),
      dial_lock: Mutex::new(()),
      cancel: CancellationToken::new(),
      last_error: RwLock::new(None),
      last_health_ok_at: RwLock::new(None),
    }
  }

  async fn current(&self) -> Option<Arc<ConnectionHandle>> {
    self.handle.read().await.clone()
  }

  pub async fn last_error(&self) -> Option<String> {
    self.last_error.read().await.clone()
  }

  /// A handle with no recorded health check, or one older than
  /// `health_check_interval`, is due for a re-check in `get()` (spec §4.5
  /// step 3).
  async fn is_stale(&self, health_check_interval: Duration) -> bool {
    match *self.last_health_ok_at.read().await {
      Some(at) => at.elapsed() >= health_check_interval,
      None => true,
    }
  }

  async fn mark_health_ok(&self) {
    *self.last_health_ok_at.write().await = Some(Instant::now());
  }
}

pub struct ConnectionManager {
  connections: DashMap<HostId, Arc<ManagedConnection>>,
  repository: Arc<dyn HostRepository>,
  credentials: Arc<CredentialStore>,
  dialer: TransportDialer,
  breakers: Arc<BreakerRegistry>,
  health_check_interval: Duration,
}

impl ConnectionManager {
  pub fn new(
    repository: Arc<dyn HostRepository>,
    credentials: Arc<CredentialStore>,
    breakers: Arc<BreakerRegistry>,
    health_check_interval: Duration,
  ) -> Self {
    ConnectionManager {
      connections: DashMap::new(),
      repository,
      credentials,
      dialer: TransportDialer::new(),
      breakers,
      health_check_interval,
    }
  }

  fn managed(&self, host_id: &HostId) -> Arc<ManagedConnection> {
    if let Some(existing) = self.connections.get(host_id) {
      return existing.clone();
    }
    self
      .connections
      .entry(host_id.clone())
      .or_insert_with(|| Arc::new(ManagedConnection::new()))
      .clone()
  }

  /// Returns a live connection handle for `host_id`, dialing it if this is
  /// the first request or the previous handle was torn down, always routed
  /// through that host's circuit breaker.
  #[tracing::instrument("ConnectionManagerGet", skip(self))]
  pub async fn get(
    &self,
    host_id: &HostId,
  ) -> CoreResult<Arc<ConnectionHandle>> {
    let managed = self.managed(host_id);

    if let Some(handle) = managed.current().await {
      if !managed.is_stale(self.health_check_interval).await {
        return Ok(handle);
      }
      // Handle is old enough to re-check (spec §4.5 step 3): ping through
      // the breaker rather than trusting a handle the background sweep
      // hasn't re-validated yet. A tripped breaker refuses the ping
      // outright instead of reaching the host (spec §8.5).
      match self.health_check_ping(host_id, &handle).await {
        Ok(()) => {
          managed.mark_health_ok().await;
          return Ok(handle);
        }
        Err(e) => {
          tracing::warn!(host_id = %host_id, error = %e, "stale connection failed health check, redialing");
          *managed.handle.write().await = None;
          *managed.last_error.write().await = Some(e.to_string());
        }
      }
    }

    let _dial_guard = managed.dial_lock.lock().await;
    // Re-check after acquiring the lock - another caller may have dialed
    // while we were waiting.
    if let Some(handle) = managed.current().await {
      return Ok(handle);
    }

    let breaker = self.breakers.get(host_id);
    let host = self
      .repository
      .get_host(host_id)
      .await
      .map_err(CoreError::internal)?
      .ok_or_else(|| CoreError::not_found("host"))?;

    let dialer = &self.dialer;
    let credentials = &self.credentials;
    let result = breaker
      .call(CoreError::counts_as_breaker_failure, async {
        let creds = credentials.decrypt(host_id).await?;
        dialer.dial(&host, &creds).await
      })
      .await;

    match result {
      Ok(handle) => {
        let handle = Arc::new(handle);
        *managed.handle.write().await = Some(handle.clone());
        *managed.last_error.write().await = None;
        managed.mark_health_ok().await;
        self
          .repository
          .mark_host_health(host_id, HealthStatus::Healthy)
          .await
          .map_err(CoreError::internal)?;
        Ok(handle)
      }
      Err(e) => {
        let core_err: CoreError = e.into();
        *managed.last_error.write().await = Some(core_err.to_string());
        let _ = self
          .repository
          .mark_host_health(host_id, HealthStatus::Unhealthy)
          .await;
        Err(core_err)
      }
    }
  }

  /// Pings `host_id`'s engine through its circuit breaker rather than
  /// bypassing it - an open breaker refuses the ping without ever reaching
  /// the host (spec §4.5 step 3, property §8.5).
  async fn health_check_ping(&self, host_id: &HostId, handle: &Arc<ConnectionHandle>) -> CoreResult<()> {
    let breaker = self.breakers.get(host_id);
    let docker = handle.docker.clone();
    breaker
      .call(CoreError::counts_as_breaker_failure, async move {
        docker.ping().await.map(|_| ()).map_err(CoreError::transport)
      })
      .await
      .map_err(CoreError::from)
  }

  /// Tears down and forgets the connection for one host (spec §4.5 "close
  /// idle or broken connections").
  pub async fn close(&self, host_id: &HostId) {
    if let Some((_, managed)) = self.connections.remove(host_id) {
      managed.cancel.cancel();
      *managed.handle.write().await = None;
    }
  }

  /// Tears down every managed connection, used during process shutdown.
  pub async fn close_all(&self) {
    let host_ids: Vec<HostId> =
      self.connections.iter().map(|e| e.key().clone()).collect();
    for host_id in host_ids {
      self.close(&host_id).await;
    }
  }

  /// Background health-check loop: pings every currently-dialed connection
  /// on a fixed cadence and closes ones that stop answering, so the next
  /// `get()` redials instead of handing back a stale handle (spec §4.5
  /// step 3).
  pub async fn run_health_checks(&self, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(self.health_check_interval);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = ticker.tick() => {}
      }
      let entries: Vec<(HostId, Arc<ManagedConnection>)> = self
        .connections
        .iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect();
      for (host_id, managed) in entries {
        let Some(handle) = managed.current().await else {
          continue;
        };
        match self.health_check_ping(&host_id, &handle).await {
          Ok(()) => managed.mark_health_ok().await,
          Err(_) => {
            tracing::warn!(host_id = %host_id, "health check failed, closing connection");
            self.close(&host_id).await;
            let _ = self
              .repository
              .mark_host_health(&host_id, HealthStatus::Unhealthy)
              .await;
          }
        }
      }
    }
  }
}
