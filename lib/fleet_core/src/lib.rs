#[macro_use]
extern crate tracing;

pub mod breaker_registry;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod events;
pub mod exec;
pub mod executor;
pub mod framing;
pub mod model;
pub mod multiplexer;
pub mod permission;
pub mod repository;
pub mod self_reference;
pub mod sources;
pub mod transport;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
  breaker_registry::BreakerRegistry,
  config::CoreConfig,
  connection::ConnectionManager,
  credentials::CredentialStore,
  events::EventBroadcaster,
  exec::ExecSessionMediator,
  executor::OperationExecutor,
  multiplexer::StreamMultiplexer,
  permission::PermissionResolver,
  repository::{GrantRepository, HostRepository},
  self_reference::SelfReferenceDetector,
};

/// Wires every collaborator together and owns their background tasks (spec
/// §9 REDESIGN FLAG: an explicit `FleetCore::new()`/`shutdown()` object
/// replacing the teacher's process-wide `OnceLock` singleton, so a host
/// process can run more than one instance - e.g. in tests).
pub struct FleetCore {
  pub executor: Arc<OperationExecutor>,
  connections: Arc<ConnectionManager>,
  log_multiplexer: Arc<StreamMultiplexer<model::LogEntry>>,
  stats_multiplexer: Arc<StreamMultiplexer<model::StatsEntry>>,
  background: CancellationToken,
}

impl FleetCore {
  /// `own_hostname` is this process's own hostname, used by the
  /// Self-Reference Detector's hostname-fallback check (spec §4.10).
  pub fn new(
    config: CoreConfig,
    host_repository: Arc<dyn HostRepository>,
    grant_repository: Arc<dyn GrantRepository>,
    default_host_id: Option<model::HostId>,
    own_hostname: String,
  ) -> anyhow::Result<Self> {
    let credentials = Arc::new(CredentialStore::new(&config.encryption_key, host_repository.clone())?);
    let breakers = Arc::new(BreakerRegistry::new(config.breaker_config()));
    let connections = Arc::new(ConnectionManager::new(
      host_repository.clone(),
      credentials,
      breakers,
      config.health_check_interval(),
    ));
    let permissions = Arc::new(PermissionResolver::new(
      grant_repository,
      config.permission_cache_ttl(),
      default_host_id,
    ));
    let self_reference = Arc::new(SelfReferenceDetector::new(
      own_hostname,
      config.self_monitor_labels().into_iter().map(str::to_string).collect(),
      config.self_monitor_names().into_iter().map(str::to_string).collect(),
      config.self_reference_cache_ttl(),
    ));
    let log_multiplexer = Arc::new(StreamMultiplexer::new(
      config.buffer_size,
      config.subscriber_queue_depth,
      config.stream_idle_ttl(),
      config.max_total_streams,
    ));
    let stats_multiplexer = Arc::new(StreamMultiplexer::new(
      config.buffer_size,
      config.subscriber_queue_depth,
      config.stream_idle_ttl(),
      config.max_total_streams,
    ));
    let events = Arc::new(EventBroadcaster::new(config.subscriber_queue_depth));
    let exec_mediator = Arc::new(ExecSessionMediator::new());

    let executor = Arc::new(OperationExecutor::new(
      connections.clone(),
      permissions,
      self_reference,
      host_repository,
      log_multiplexer.clone(),
      stats_multiplexer.clone(),
      events,
      exec_mediator,
      config.operation_timeout(),
    ));

    let background = CancellationToken::new();
    {
      let connections = connections.clone();
      let cancel = background.clone();
      tokio::spawn(async move { connections.run_health_checks(cancel).await });
    }
    {
      let log_multiplexer = log_multiplexer.clone();
      let cancel = background.clone();
      tokio::spawn(async move { log_multiplexer.run_idle_sweep(cancel).await });
    }
    {
      let stats_multiplexer = stats_multiplexer.clone();
      let cancel = background.clone();
      tokio::spawn(async move { stats_multiplexer.run_idle_sweep(cancel).await });
    }

    Ok(FleetCore {
      executor,
      connections,
      log_multiplexer,
      stats_multiplexer,
      background,
    })
  }

  /// Stops the background sweeps, tears down every multiplexed stream, and
  /// closes every dialed connection. Safe to call once during process
  /// shutdown.
  pub async fn shutdown(&self) {
    self.background.cancel();
    self.log_multiplexer.shutdown().await;
    self.stats_multiplexer.shutdown().await;
    self.connections.close_all().await;
  }
}
