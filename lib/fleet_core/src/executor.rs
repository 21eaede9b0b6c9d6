//! Operation Executor (spec §4.11). The uniform, host-id-parametric API
//! surface every Docker domain operation goes through: acquires the engine
//! handle via the Connection Manager (which applies the Circuit Breaker),
//! checks the Permission Resolver, translates engine errors into the core
//! taxonomy (§7), and normalizes results into the small records in
//! [`crate::model`]. Streaming operations delegate to the Multiplexer,
//! Mediator, and Broadcaster rather than returning directly (§4.11).
//!
//! Grounded in the teacher's `bin/periphery/src/docker/mod.rs` (Docker
//! calls behind an instrumented async surface) and, for the swarm/service/
//! node/secret/config/task shapes specifically, in the pack-mate
//! `rosshhun-docktail` agent crate's `docker/swarm.rs`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bollard::Docker;
use bollard::models::{ConfigSpec, NodeSpec, SecretSpec, ServiceSpec, SwarmInitRequest, SwarmJoinRequest};
use bollard::query_parameters as qp;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
  connection::ConnectionManager,
  error::{CoreError, CoreResult},
  events::{EnrichedEvent, EventBroadcaster, EventFilter},
  exec::{CallerFrame, ExecRequest, ExecSessionMediator},
  model::*,
  multiplexer::{EntrySource, StreamMultiplexer, Subscription},
  permission::{Action, PermissionResolver},
  repository::HostRepository,
  self_reference::{ContainerIdentity, SelfReferenceDetector},
  sources::{
    container_logs::ContainerLogsProvider,
    container_stats::ContainerStatsProvider,
    service_logs::{HostSyslogProvider, ServiceLogsProvider},
    LogSourceProvider, SourceOptions, StatsSourceProvider,
  },
};

pub struct OperationExecutor {
  connections: Arc<ConnectionManager>,
  permissions: Arc<PermissionResolver>,
  self_reference: Arc<SelfReferenceDetector>,
  host_repository: Arc<dyn HostRepository>,
  log_multiplexer: Arc<StreamMultiplexer<LogEntry>>,
  stats_multiplexer: Arc<StreamMultiplexer<StatsEntry>>,
  events: Arc<EventBroadcaster>,
  exec_mediator: Arc<ExecSessionMediator>,
  operation_timeout: Duration,
}

impl OperationExecutor {
  pub fn new(
    connections: Arc<ConnectionManager>,
    permissions: Arc<PermissionResolver>,
    self_reference: Arc<SelfReferenceDetector>,
    host_repository: Arc<dyn HostRepository>,
    log_multiplexer: Arc<StreamMultiplexer<LogEntry>>,
    stats_multiplexer: Arc<StreamMultiplexer<StatsEntry>>,
    events: Arc<EventBroadcaster>,
    exec_mediator: Arc<ExecSessionMediator>,
    operation_timeout: Duration,
  ) -> Self {
    OperationExecutor {
      connections,
      permissions,
      self_reference,
      host_repository,
      log_multiplexer,
      stats_multiplexer,
      events,
      exec_mediator,
      operation_timeout,
    }
  }

  async fn authorized_docker(
    &self,
    user_id: &UserId,
    action: Action,
    host_id: &HostId,
  ) -> CoreResult<Docker> {
    self.permissions.authorize(user_id, action, host_id).await?;
    let handle = self.connections.get(host_id).await?;
    Ok(handle.docker.clone())
  }

  /// Bounds one engine call to `operation_timeout` (spec §5, default 30s
  /// overridable). Every direct bollard call in this module goes through
  /// this instead of awaiting the engine future bare.
  async fn engine_call<F, T>(&self, fut: F) -> CoreResult<T>
  where
    F: Future<Output = Result<T, bollard::errors::Error>>,
  {
    bounded_engine_call(self.operation_timeout, fut).await
  }

  // ── Host management (SPEC_FULL §2: test-connection is a dry run, the
  // rest of host CRUD is owned entirely by the external persistence
  // collaborator - `HostRepository` exposes no create/update/delete) ──

  pub async fn list_hosts(&self) -> CoreResult<Vec<Host>> {
    self.host_repository.list_hosts().await.map_err(CoreError::internal)
  }

  pub async fn get_host(&self, host_id: &HostId) -> CoreResult<Host> {
    self
      .host_repository
      .get_host(host_id)
      .await
      .map_err(CoreError::internal)?
      .ok_or_else(|| CoreError::not_found("host"))
  }

  /// Dials `host` without installing the resulting handle into the
  /// Connection Manager (SPEC_FULL §2 "per-host test-connection probe").
  pub async fn test_connection(
    &self,
    host: &Host,
    creds: &HashMap<CredentialKind, SecretBytes>,
  ) -> CoreResult<()> {
    crate::transport::TransportDialer::new().dial(host, creds).await.map(|_| ())
  }

  // ── Container ──────────────────────────────────────────────────

  pub async fn list_containers(
    &self,
    user_id: &UserId,
    host_id: &HostId,
  ) -> CoreResult<Vec<ContainerSummary>> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    let containers = self
      .engine_call(docker.list_containers(Some(qp::ListContainersOptions { all: true, ..Default::default() })))
      .await?;
    Ok(containers.into_iter().map(|c| container_summary(host_id, c)).collect())
  }

  pub async fn inspect_container(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    container_id: &str,
  ) -> CoreResult<ContainerSummary> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    let inspect = self
      .engine_call(docker.inspect_container(container_id, None::<qp::InspectContainerOptions>))
      .await?;
    Ok(container_summary_from_inspect(host_id, inspect))
  }

  pub async fn create_container(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    name: &str,
    config: bollard::models::ContainerCreateBody,
  ) -> CoreResult<String> {
    let docker = self.authorized_docker(user_id, Action::ContainerLifecycle, host_id).await?;
    let result = self
      .engine_call(docker.create_container(
        Some(qp::CreateContainerOptions { name: Some(name.to_string()), ..Default::default() }),
        config,
      ))
      .await?;
    Ok(result.id)
  }

  pub async fn start_container(&self, user_id: &UserId, host_id: &HostId, container_id: &str) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::ContainerLifecycle, host_id).await?;
    self
      .engine_call(docker.start_container(container_id, None::<qp::StartContainerOptions>))
      .await
  }

  pub async fn stop_container(&self, user_id: &UserId, host_id: &HostId, container_id: &str) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::ContainerLifecycle, host_id).await?;
    self
      .engine_call(docker.stop_container(container_id, None::<qp::StopContainerOptions>))
      .await
  }

  pub async fn restart_container(&self, user_id: &UserId, host_id: &HostId, container_id: &str) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::ContainerLifecycle, host_id).await?;
    self
      .engine_call(docker.restart_container(container_id, None::<qp::RestartContainerOptions>))
      .await
  }

  pub async fn remove_container(&self, user_id: &UserId, host_id: &HostId, container_id: &str, force: bool) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::ContainerLifecycle, host_id).await?;
    self
      .engine_call(docker.remove_container(container_id, Some(qp::RemoveContainerOptions { force, ..Default::default() })))
      .await
  }

  /// One-shot log read (spec §6 "logs (stream/once)"): collects the
  /// provider's finite (`follow=false`) output without touching the
  /// Multiplexer.
  pub async fn container_logs_once(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    container_id: &str,
    tail: Option<String>,
  ) -> CoreResult<Vec<LogEntry>> {
    let docker = self.authorized_docker(user_id, Action::ViewLogs, host_id).await?;
    let opts = SourceOptions { follow: false, tail, ..Default::default() };
    let mut stream = ContainerLogsProvider.stream(&docker, host_id, container_id, opts).await?;
    let mut out = Vec::new();
    while let Some(item) = stream.next().await {
      out.push(item?);
    }
    Ok(out)
  }

  /// Live, shared log stream (spec §4.6/§4.7, self-reference suppression
  /// per §4.7/§4.10/S4).
  pub async fn stream_container_logs(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    container_id: &str,
    tail: usize,
  ) -> CoreResult<Subscription<LogEntry>> {
    let docker = self.authorized_docker(user_id, Action::ViewLogs, host_id).await?;
    let self_ref = self.is_self_container(&docker, host_id, container_id).await?;
    let key = crate::multiplexer::stream_key("container_logs", host_id, container_id);
    let source: Arc<dyn EntrySource<LogEntry>> = Arc::new(LogProviderSource {
      docker,
      host_id: host_id.clone(),
      source_id: container_id.to_string(),
      provider: Arc::new(ContainerLogsProvider),
      opts: SourceOptions { follow: true, tail: Some(tail.to_string()), ..Default::default() },
    });
    Ok(self.log_multiplexer.subscribe(&key, source, tail, self_ref).await)
  }

  pub async fn unsubscribe_container_logs(&self, host_id: &HostId, container_id: &str, id: Uuid) {
    let key = crate::multiplexer::stream_key("container_logs", host_id, container_id);
    self.log_multiplexer.unsubscribe(&key, id).await;
  }

  pub async fn stream_container_stats(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    container_id: &str,
  ) -> CoreResult<Subscription<StatsEntry>> {
    let docker = self.authorized_docker(user_id, Action::ViewStats, host_id).await?;
    let self_ref = self.is_self_container(&docker, host_id, container_id).await?;
    let key = crate::multiplexer::stream_key("container_stats", host_id, container_id);
    let source: Arc<dyn EntrySource<StatsEntry>> = Arc::new(StatsProviderSource {
      docker,
      host_id: host_id.clone(),
      source_id: container_id.to_string(),
    });
    Ok(self.stats_multiplexer.subscribe(&key, source, 0, self_ref).await)
  }

  pub async fn unsubscribe_container_stats(&self, host_id: &HostId, container_id: &str, id: Uuid) {
    let key = crate::multiplexer::stream_key("container_stats", host_id, container_id);
    self.stats_multiplexer.unsubscribe(&key, id).await;
  }

  /// Runs one exec session to completion (spec §4.8); caller supplies the
  /// bidirectional channel halves.
  pub async fn exec_container(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    request: ExecRequest,
    from_caller: mpsc::Receiver<CallerFrame>,
    to_caller: mpsc::Sender<CallerFrame>,
    cancel: CancellationToken,
  ) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::ExecShell, host_id).await?;
    self.exec_mediator.run(&docker, request, from_caller, to_caller, cancel).await
  }

  async fn is_self_container(&self, docker: &Docker, host_id: &HostId, container_id: &str) -> CoreResult<bool> {
    let inspect = self
      .engine_call(docker.inspect_container(container_id, None::<qp::InspectContainerOptions>))
      .await?;
    let labels = inspect
      .config
      .as_ref()
      .and_then(|c| c.labels.clone())
      .unwrap_or_default();
    let hostname = inspect
      .config
      .as_ref()
      .and_then(|c| c.hostname.clone())
      .unwrap_or_default();
    let name = inspect.name.clone().unwrap_or_default();
    let identity = ContainerIdentity { labels: &labels, hostname: &hostname, name: &name };
    Ok(self.self_reference.is_self(host_id, container_id, identity).await)
  }

  // ── Image ──────────────────────────────────────────────────────

  pub async fn list_images(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<Vec<ImageSummary>> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    let images = self
      .engine_call(docker.list_images(Some(qp::ListImagesOptions { all: false, ..Default::default() })))
      .await?;
    Ok(
      images
        .into_iter()
        .map(|i| ImageSummary {
          host_id: host_id.clone(),
          id: i.id,
          tags: i.repo_tags,
          size_bytes: i.size.max(0) as u64,
        })
        .collect(),
    )
  }

  pub async fn remove_image(&self, user_id: &UserId, host_id: &HostId, image_id: &str, force: bool) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::ImageManage, host_id).await?;
    self
      .engine_call(docker.remove_image(image_id, Some(qp::RemoveImageOptions { force, ..Default::default() }), None))
      .await?;
    Ok(())
  }

  pub async fn prune_images(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<PruneResult> {
    let docker = self.authorized_docker(user_id, Action::SystemAdmin, host_id).await?;
    let result = self
      .engine_call(docker.prune_images(None::<qp::PruneImagesOptions>))
      .await?;
    Ok(PruneResult {
      host_id: host_id.clone(),
      deleted_ids: result
        .images_deleted
        .unwrap_or_default()
        .into_iter()
        .filter_map(|d| d.deleted.or(d.untagged))
        .collect(),
      space_reclaimed_bytes: result.space_reclaimed.unwrap_or(0).max(0) as u64,
    })
  }

  // ── Volume ─────────────────────────────────────────────────────

  pub async fn list_volumes(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<Vec<VolumeSummary>> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    let volumes = self
      .engine_call(docker.list_volumes(None::<qp::ListVolumesOptions>))
      .await?;
    Ok(
      volumes
        .volumes
        .unwrap_or_default()
        .into_iter()
        .map(|v| VolumeSummary {
          host_id: host_id.clone(),
          name: v.name,
          driver: v.driver,
          mountpoint: v.mountpoint,
        })
        .collect(),
    )
  }

  pub async fn remove_volume(&self, user_id: &UserId, host_id: &HostId, name: &str, force: bool) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::VolumeManage, host_id).await?;
    self
      .engine_call(docker.remove_volume(name, Some(qp::RemoveVolumeOptions { force, ..Default::default() })))
      .await
  }

  pub async fn prune_volumes(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<PruneResult> {
    let docker = self.authorized_docker(user_id, Action::SystemAdmin, host_id).await?;
    let result = self
      .engine_call(docker.prune_volumes(None::<qp::PruneVolumesOptions>))
      .await?;
    Ok(PruneResult {
      host_id: host_id.clone(),
      deleted_ids: result.volumes_deleted.unwrap_or_default(),
      space_reclaimed_bytes: result.space_reclaimed.unwrap_or(0).max(0) as u64,
    })
  }

  // ── Network ────────────────────────────────────────────────────

  pub async fn list_networks(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<Vec<NetworkSummary>> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    let networks = self
      .engine_call(docker.list_networks(None::<qp::ListNetworksOptions>))
      .await?;
    Ok(
      networks
        .into_iter()
        .map(|n| NetworkSummary {
          host_id: host_id.clone(),
          id: n.id.unwrap_or_default(),
          name: n.name.unwrap_or_default(),
          driver: n.driver.unwrap_or_default(),
          scope: n.scope.unwrap_or_default(),
        })
        .collect(),
    )
  }

  pub async fn remove_network(&self, user_id: &UserId, host_id: &HostId, network_id: &str) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::NetworkManage, host_id).await?;
    self.engine_call(docker.remove_network(network_id)).await
  }

  pub async fn prune_networks(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<PruneResult> {
    let docker = self.authorized_docker(user_id, Action::SystemAdmin, host_id).await?;
    let result = self
      .engine_call(docker.prune_networks(None::<qp::PruneNetworksOptions>))
      .await?;
    Ok(PruneResult {
      host_id: host_id.clone(),
      deleted_ids: result.networks_deleted.unwrap_or_default(),
      space_reclaimed_bytes: 0,
    })
  }

  // ── Swarm ──────────────────────────────────────────────────────

  /// (spec §4.11 "Swarm host role transitions (observed, not effected)")
  pub async fn swarm_init(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    listen_addr: &str,
    advertise_addr: Option<&str>,
  ) -> CoreResult<SwarmRoleTransition> {
    let docker = self.authorized_docker(user_id, Action::SwarmManage, host_id).await?;
    let request = SwarmInitRequest {
      listen_addr: Some(listen_addr.to_string()),
      advertise_addr: advertise_addr.map(str::to_string),
      ..Default::default()
    };
    self.engine_call(docker.init_swarm(request)).await?;
    self.observe_role_transition(host_id, SwarmRole::Standalone, SwarmRole::Manager).await
  }

  pub async fn swarm_join(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    remote_addrs: Vec<String>,
    join_token: &str,
    listen_addr: &str,
  ) -> CoreResult<SwarmRoleTransition> {
    let docker = self.authorized_docker(user_id, Action::SwarmManage, host_id).await?;
    let request = SwarmJoinRequest {
      remote_addrs: Some(remote_addrs),
      join_token: Some(join_token.to_string()),
      listen_addr: Some(listen_addr.to_string()),
      ..Default::default()
    };
    self.engine_call(docker.join_swarm(request)).await?;
    self.observe_role_transition(host_id, SwarmRole::Standalone, SwarmRole::Worker).await
  }

  pub async fn swarm_leave(&self, user_id: &UserId, host_id: &HostId, force: bool) -> CoreResult<SwarmRoleTransition> {
    let docker = self.authorized_docker(user_id, Action::SwarmManage, host_id).await?;
    let prior = self.swarm_membership(&docker).await?.role;
    let options = qp::LeaveSwarmOptionsBuilder::default().force(force).build();
    self.engine_call(docker.leave_swarm(Some(options))).await?;
    self.observe_role_transition(host_id, prior, SwarmRole::Standalone).await
  }

  pub async fn swarm_info(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<SwarmMembership> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    self.swarm_membership(&docker).await
  }

  async fn swarm_membership(&self, docker: &Docker) -> CoreResult<SwarmMembership> {
    let result = tokio::time::timeout(self.operation_timeout, docker.inspect_swarm())
      .await
      .map_err(|_| CoreError::timeout(self.operation_timeout))?;
    match result {
      Ok(swarm) => Ok(SwarmMembership {
        cluster_id: swarm.id,
        role: SwarmRole::Manager,
        is_leader: true,
      }),
      Err(bollard::errors::Error::DockerResponseServerError { status_code: 503, .. }) => {
        Ok(SwarmMembership { cluster_id: None, role: SwarmRole::Worker, is_leader: false })
      }
      Err(bollard::errors::Error::DockerResponseServerError { status_code: 406, .. }) => {
        Ok(SwarmMembership { cluster_id: None, role: SwarmRole::Standalone, is_leader: false })
      }
      Err(e) => Err(CoreError::engine(e)),
    }
  }

  async fn observe_role_transition(
    &self,
    host_id: &HostId,
    from: SwarmRole,
    to: SwarmRole,
  ) -> CoreResult<SwarmRoleTransition> {
    let transition = SwarmRoleTransition { from, to };
    self
      .host_repository
      .record_swarm_role(host_id, transition)
      .await
      .map_err(CoreError::internal)?;
    Ok(transition)
  }

  // ── Node ───────────────────────────────────────────────────────

  pub async fn list_nodes(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<Vec<NodeSummary>> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    let nodes = self
      .engine_call(docker.list_nodes(None::<qp::ListNodesOptions>))
      .await?;
    Ok(nodes.into_iter().map(|n| node_summary(host_id, n)).collect())
  }

  /// Returns `Ok(None)` when the node has vanished or this host is not
  /// (or no longer) a swarm manager, mirroring `inspect_swarm`'s
  /// not-a-manager handling.
  pub async fn get_node(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    node_id: &str,
  ) -> CoreResult<Option<NodeSummary>> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    let result = tokio::time::timeout(self.operation_timeout, docker.inspect_node(node_id))
      .await
      .map_err(|_| CoreError::timeout(self.operation_timeout))?;
    match result {
      Ok(node) => Ok(Some(node_summary(host_id, node))),
      Err(bollard::errors::Error::DockerResponseServerError { status_code: 503, .. }) => Ok(None),
      Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
      Err(e) => Err(CoreError::engine(e)),
    }
  }

  pub async fn update_node(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    node_id: &str,
    spec: NodeSpec,
    version: i64,
  ) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::SwarmManage, host_id).await?;
    let options = qp::UpdateNodeOptionsBuilder::new().version(version).build();
    self.engine_call(docker.update_node(node_id, spec, options)).await
  }

  pub async fn remove_node(&self, user_id: &UserId, host_id: &HostId, node_id: &str, force: bool) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::SwarmManage, host_id).await?;
    let options = qp::DeleteNodeOptionsBuilder::default().force(force).build();
    self.engine_call(docker.delete_node(node_id, Some(options))).await
  }

  // ── Service ────────────────────────────────────────────────────

  pub async fn list_services(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<Vec<ServiceSummary>> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    let services = self
      .engine_call(docker.list_services(None::<qp::ListServicesOptions>))
      .await?;
    Ok(services.into_iter().map(|s| service_summary(host_id, s)).collect())
  }

  pub async fn get_service(&self, user_id: &UserId, host_id: &HostId, service_id: &str) -> CoreResult<ServiceSummary> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    let service = self
      .engine_call(docker.inspect_service(service_id, None))
      .await?;
    Ok(service_summary(host_id, service))
  }

  pub async fn create_service(&self, user_id: &UserId, host_id: &HostId, spec: ServiceSpec) -> CoreResult<String> {
    let docker = self.authorized_docker(user_id, Action::ServiceManage, host_id).await?;
    let result = self.engine_call(docker.create_service(spec, None)).await?;
    result
      .id
      .filter(|id| !id.is_empty())
      .ok_or_else(|| CoreError::engine(anyhow::anyhow!("engine did not return a service id")))
  }

  /// `scale` is expressed as the desired replica count written into
  /// `spec.mode.replicated.replicas` by the caller before calling this -
  /// the Executor does not special-case it, it is just an update.
  pub async fn update_service(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    service_id: &str,
    spec: ServiceSpec,
    version: i32,
  ) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::ServiceManage, host_id).await?;
    let options = qp::UpdateServiceOptions { version, ..Default::default() };
    self
      .engine_call(docker.update_service(service_id, spec, options, None))
      .await
      .map(|_| ())
  }

  /// Scales a replicated service to `replicas` tasks by re-fetching its
  /// current spec, overwriting the replica count, and issuing the same
  /// versioned update every other service change goes through - Docker has
  /// no separate "scale" endpoint, `docker service scale` is this same
  /// update call under the hood.
  pub async fn scale_service(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    service_id: &str,
    replicas: u64,
  ) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::ServiceManage, host_id).await?;
    let current = self
      .engine_call(docker.inspect_service(service_id, None))
      .await?;
    let version = current
      .version
      .as_ref()
      .and_then(|v| v.index)
      .ok_or_else(|| CoreError::engine(anyhow::anyhow!("service has no version index")))?;
    let mut spec = current.spec.unwrap_or_default();
    if let Some(mode) = spec.mode.as_mut() {
      if let Some(replicated) = mode.replicated.as_mut() {
        replicated.replicas = Some(replicas as i64);
      }
    }
    let options = qp::UpdateServiceOptions {
      version: i32::try_from(version).map_err(|_| CoreError::engine(anyhow::anyhow!("service version overflows i32")))?,
      ..Default::default()
    };
    self
      .engine_call(docker.update_service(service_id, spec, options, None))
      .await
      .map(|_| ())
  }

  pub async fn remove_service(&self, user_id: &UserId, host_id: &HostId, service_id: &str) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::ServiceManage, host_id).await?;
    self.engine_call(docker.delete_service(service_id)).await
  }

  pub async fn list_service_tasks(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<Vec<bollard::models::Task>> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    self.engine_call(docker.list_tasks(None::<qp::ListTasksOptions>)).await
  }

  pub async fn service_logs_once(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    service_id: &str,
    tail: Option<String>,
  ) -> CoreResult<Vec<LogEntry>> {
    let docker = self.authorized_docker(user_id, Action::ViewLogs, host_id).await?;
    let opts = SourceOptions { follow: false, tail, ..Default::default() };
    let mut stream = ServiceLogsProvider.stream(&docker, host_id, service_id, opts).await?;
    let mut out = Vec::new();
    while let Some(item) = stream.next().await {
      out.push(item?);
    }
    Ok(out)
  }

  pub async fn stream_service_logs(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    service_id: &str,
    tail: usize,
  ) -> CoreResult<Subscription<LogEntry>> {
    let docker = self.authorized_docker(user_id, Action::ViewLogs, host_id).await?;
    let key = crate::multiplexer::stream_key("service_logs", host_id, service_id);
    let source: Arc<dyn EntrySource<LogEntry>> = Arc::new(LogProviderSource {
      docker,
      host_id: host_id.clone(),
      source_id: service_id.to_string(),
      provider: Arc::new(ServiceLogsProvider),
      opts: SourceOptions { follow: true, tail: Some(tail.to_string()), ..Default::default() },
    });
    Ok(self.log_multiplexer.subscribe(&key, source, tail, false).await)
  }

  /// Host syslog is modeled as a container log stream tagged
  /// `SourceType::HostSyslog` (SPEC_FULL §2); `sidecar_container_id` is
  /// whatever log-shipping container bind-mounts the host's log files.
  pub async fn stream_host_syslog(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    sidecar_container_id: &str,
    tail: usize,
  ) -> CoreResult<Subscription<LogEntry>> {
    let docker = self.authorized_docker(user_id, Action::ViewLogs, host_id).await?;
    let key = crate::multiplexer::stream_key("host_syslog", host_id, sidecar_container_id);
    let source: Arc<dyn EntrySource<LogEntry>> = Arc::new(LogProviderSource {
      docker,
      host_id: host_id.clone(),
      source_id: sidecar_container_id.to_string(),
      provider: Arc::new(HostSyslogProvider::new()),
      opts: SourceOptions { follow: true, tail: Some(tail.to_string()), ..Default::default() },
    });
    Ok(self.log_multiplexer.subscribe(&key, source, tail, false).await)
  }

  // ── Secret / Config ────────────────────────────────────────────

  pub async fn create_secret(&self, user_id: &UserId, host_id: &HostId, spec: SecretSpec) -> CoreResult<String> {
    let docker = self.authorized_docker(user_id, Action::SwarmManage, host_id).await?;
    let result = self.engine_call(docker.create_secret(spec)).await?;
    Ok(result.id)
  }

  pub async fn remove_secret(&self, user_id: &UserId, host_id: &HostId, secret_id: &str) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::SwarmManage, host_id).await?;
    self.engine_call(docker.delete_secret(secret_id)).await
  }

  pub async fn create_config(&self, user_id: &UserId, host_id: &HostId, spec: ConfigSpec) -> CoreResult<String> {
    let docker = self.authorized_docker(user_id, Action::SwarmManage, host_id).await?;
    let result = self.engine_call(docker.create_config(spec)).await?;
    Ok(result.id)
  }

  pub async fn remove_config(&self, user_id: &UserId, host_id: &HostId, config_id: &str) -> CoreResult<()> {
    let docker = self.authorized_docker(user_id, Action::SwarmManage, host_id).await?;
    self.engine_call(docker.delete_config(config_id)).await
  }

  // ── System ─────────────────────────────────────────────────────

  pub async fn system_info(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<SystemSummary> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    let info = self.engine_call(docker.info()).await?;
    Ok(SystemSummary {
      host_id: host_id.clone(),
      containers: info.containers.unwrap_or(0).max(0) as u64,
      containers_running: info.containers_running.unwrap_or(0).max(0) as u64,
      images: info.images.unwrap_or(0).max(0) as u64,
      server_version: info.server_version.unwrap_or_default(),
    })
  }

  pub async fn system_version(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<String> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    let version = self.engine_call(docker.version()).await?;
    Ok(version.version.unwrap_or_default())
  }

  pub async fn disk_usage(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<DiskUsage> {
    let docker = self.authorized_docker(user_id, Action::ListResources, host_id).await?;
    let usage = self.engine_call(docker.df()).await?;
    let images_bytes = usage.images.unwrap_or_default().iter().map(|i| i.size.max(0) as u64).sum();
    let containers_bytes = usage
      .containers
      .unwrap_or_default()
      .iter()
      .map(|c| c.size_rw.unwrap_or(0).max(0) as u64)
      .sum();
    let volumes_bytes = usage
      .volumes
      .unwrap_or_default()
      .iter()
      .filter_map(|v| v.usage_data.as_ref())
      .map(|u| u.size.max(0) as u64)
      .sum();
    Ok(DiskUsage { host_id: host_id.clone(), images_bytes, containers_bytes, volumes_bytes })
  }

  pub async fn system_prune(&self, user_id: &UserId, host_id: &HostId) -> CoreResult<()> {
    self.permissions.authorize(user_id, Action::SystemAdmin, host_id).await?;
    self.prune_images(user_id, host_id).await?;
    self.prune_volumes(user_id, host_id).await?;
    self.prune_networks(user_id, host_id).await?;
    Ok(())
  }

  pub async fn subscribe_events(
    &self,
    user_id: &UserId,
    host_id: &HostId,
    filter: EventFilter,
  ) -> CoreResult<(Uuid, mpsc::Receiver<EnrichedEvent>)> {
    let docker = self.authorized_docker(user_id, Action::ViewEvents, host_id).await?;
    Ok(self.events.subscribe(host_id, docker, filter).await)
  }

  pub async fn unsubscribe_events(&self, host_id: &HostId, id: Uuid) {
    self.events.unsubscribe(host_id, id).await;
  }
}

async fn bounded_engine_call<F, T>(budget: Duration, fut: F) -> CoreResult<T>
where
  F: Future<Output = Result<T, bollard::errors::Error>>,
{
  match tokio::time::timeout(budget, fut).await {
    Ok(result) => result.map_err(CoreError::engine),
    Err(_) => Err(CoreError::timeout(budget)),
  }
}

struct LogProviderSource {
  docker: Docker,
  host_id: HostId,
  source_id: String,
  provider: Arc<dyn LogSourceProvider>,
  opts: SourceOptions,
}

#[async_trait::async_trait]
impl EntrySource<LogEntry> for LogProviderSource {
  async fn open(
    &self,
  ) -> CoreResult<std::pin::Pin<Box<dyn tokio_stream::Stream<Item = CoreResult<LogEntry>> + Send>>> {
    self
      .provider
      .stream(&self.docker, &self.host_id, &self.source_id, self.opts.clone())
      .await
  }

  fn informational(&self) -> LogEntry {
    LogEntry {
      timestamp: chrono::Utc::now(),
      source_type: self.provider.source_type(),
      source_id: self.source_id.clone(),
      host_id: self.host_id.clone(),
      level: LogLevel::Info,
      message: "log stream suppressed: this resource is the control plane itself".to_string(),
      metadata: serde_json::Value::Null,
      raw: String::new(),
    }
  }
}

struct StatsProviderSource {
  docker: Docker,
  host_id: HostId,
  source_id: String,
}

#[async_trait::async_trait]
impl EntrySource<StatsEntry> for StatsProviderSource {
  async fn open(
    &self,
  ) -> CoreResult<std::pin::Pin<Box<dyn tokio_stream::Stream<Item = CoreResult<StatsEntry>> + Send>>> {
    ContainerStatsProvider.stream(&self.docker, &self.host_id, &self.source_id).await
  }

  fn informational(&self) -> StatsEntry {
    StatsEntry {
      timestamp: chrono::Utc::now(),
      source_id: self.source_id.clone(),
      host_id: self.host_id.clone(),
      cpu_percent: 0.0,
      memory_used_bytes: 0,
      memory_limit_bytes: 0,
      network_rx_bytes: 0,
      network_tx_bytes: 0,
      block_read_bytes: 0,
      block_write_bytes: 0,
    }
  }
}

fn container_summary(host_id: &HostId, c: bollard::models::ContainerSummary) -> ContainerSummary {
  ContainerSummary {
    host_id: host_id.clone(),
    id: c.id.unwrap_or_default(),
    name: c
      .names
      .unwrap_or_default()
      .into_iter()
      .next()
      .map(|n| n.trim_start_matches('/').to_string())
      .unwrap_or_default(),
    image: c.image.unwrap_or_default(),
    state: container_state(c.state.as_deref().unwrap_or("")),
    status: c.status.unwrap_or_default(),
    labels: c.labels.unwrap_or_default(),
  }
}

fn container_summary_from_inspect(
  host_id: &HostId,
  inspect: bollard::models::ContainerInspectResponse,
) -> ContainerSummary {
  let state = inspect
    .state
    .as_ref()
    .and_then(|s| s.status.as_ref())
    .map(|s| s.to_string())
    .unwrap_or_default();
  ContainerSummary {
    host_id: host_id.clone(),
    id: inspect.id.unwrap_or_default(),
    name: inspect.name.unwrap_or_default().trim_start_matches('/').to_string(),
    image: inspect.config.as_ref().and_then(|c| c.image.clone()).unwrap_or_default(),
    state: container_state(&state),
    status: state,
    labels: inspect.config.as_ref().and_then(|c| c.labels.clone()).unwrap_or_default(),
  }
}

fn container_state(raw: &str) -> ContainerState {
  match raw.to_ascii_lowercase().as_str() {
    "created" => ContainerState::Created,
    "running" => ContainerState::Running,
    "paused" => ContainerState::Paused,
    "exited" | "dead" => ContainerState::Exited,
    "removing" => ContainerState::Removed,
    _ => ContainerState::Exited,
  }
}

fn node_summary(host_id: &HostId, n: bollard::models::Node) -> NodeSummary {
  let spec = n.spec.unwrap_or_default();
  let status = n.status.unwrap_or_default();
  NodeSummary {
    host_id: host_id.clone(),
    id: n.id.unwrap_or_default(),
    hostname: status.addr.unwrap_or_default(),
    role: match spec.role {
      Some(bollard::models::NodeSpecRoleEnum::MANAGER) => SwarmRole::Manager,
      Some(bollard::models::NodeSpecRoleEnum::WORKER) => SwarmRole::Worker,
      _ => SwarmRole::Standalone,
    },
    availability: spec
      .availability
      .map(|a| a.to_string())
      .unwrap_or_default(),
    status: status.state.map(|s| s.to_string()).unwrap_or_default(),
  }
}

fn service_summary(host_id: &HostId, s: bollard::models::Service) -> ServiceSummary {
  let spec = s.spec.unwrap_or_default();
  let image = spec
    .task_template
    .as_ref()
    .and_then(|t| t.container_spec.as_ref())
    .and_then(|c| c.image.clone())
    .unwrap_or_default();
  let replicas_desired = spec
    .mode
    .as_ref()
    .and_then(|m| m.replicated.as_ref())
    .and_then(|r| r.replicas)
    .unwrap_or(0)
    .max(0) as u64;
  ServiceSummary {
    host_id: host_id.clone(),
    id: s.id.unwrap_or_default(),
    name: spec.name.unwrap_or_default(),
    image,
    replicas_desired,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn engine_call_within_budget_returns_ok() {
    let result: CoreResult<u32> = bounded_engine_call(Duration::from_millis(50), async { Ok(7u32) }).await;
    assert_eq!(result.unwrap(), 7);
  }

  #[tokio::test]
  async fn engine_call_past_budget_times_out() {
    let result: CoreResult<u32> = bounded_engine_call(Duration::from_millis(10), async {
      tokio::time::sleep(Duration::from_millis(200)).await;
      Ok(7u32)
    })
    .await;
    assert!(matches!(result, Err(CoreError::Timeout(_))));
  }
}
