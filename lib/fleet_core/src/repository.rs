//! The narrow contract the core consumes from the external persistence
//! collaborator (spec §6 "Persisted state layout": "none is owned by the
//! core... consumes an external store... through a narrow repository
//! interface"). The HTTP/CLI layer supplies a concrete implementation
//! backed by whatever database it uses; the core never depends on one.

use async_trait::async_trait;

use crate::model::{EncryptedCredential, Grant, Host, HostId, User, UserId};

#[async_trait]
pub trait HostRepository: Send + Sync {
  async fn get_host(&self, id: &HostId) -> anyhow::Result<Option<Host>>;
  async fn list_hosts(&self) -> anyhow::Result<Vec<Host>>;
  async fn credentials_for_host(
    &self,
    id: &HostId,
  ) -> anyhow::Result<Vec<EncryptedCredential>>;

  /// Called by the Connection Manager when a health check fails or a host
  /// is otherwise observed to be down (§4.5 step 3). The core never writes
  /// any other part of the host record.
  async fn mark_host_health(
    &self,
    id: &HostId,
    health: crate::model::HealthStatus,
  ) -> anyhow::Result<()>;

  /// Called after an observed swarm role transition (§4.11 "Swarm host
  /// role transitions (observed, not effected)"). The core never enforces
  /// these, only reports them.
  async fn record_swarm_role(
    &self,
    id: &HostId,
    transition: crate::model::SwarmRoleTransition,
  ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait GrantRepository: Send + Sync {
  async fn get_user(&self, id: &UserId) -> anyhow::Result<Option<User>>;
  async fn grants_for_user(
    &self,
    user_id: &UserId,
  ) -> anyhow::Result<Vec<Grant>>;
}
