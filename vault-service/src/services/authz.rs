//! Scope + role gate in front of every vault operation.

use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use super::error::{AuthzDenial, ServiceError};
use super::store::VaultStore;
use crate::models::{Membership, Role, Scope};

#[derive(Clone)]
pub struct AuthorizationEngine {
    store: Arc<dyn VaultStore>,
}

impl AuthorizationEngine {
    pub fn new(store: Arc<dyn VaultStore>) -> Self {
        Self { store }
    }

    /// Resolve the caller's membership at `scope` and require one of `allowed`.
    ///
    /// Callers only ever see `Forbidden`; whether the user is not a member or
    /// merely under-privileged is logged, not returned.
    #[instrument(skip(self, allowed), fields(user_id = %user_id, scope = %scope))]
    pub async fn require_role(
        &self,
        user_id: Uuid,
        scope: Scope,
        allowed: &[Role],
    ) -> Result<Membership, ServiceError> {
        let denial = match self.store.find_membership(user_id, scope).await? {
            Some(membership) if allowed.contains(&membership.role) => return Ok(membership),
            Some(membership) => AuthzDenial::InsufficientRole {
                held: membership.role,
            },
            None => AuthzDenial::NotAMember,
        };

        warn!(reason = %denial, "Authorization denied");
        Err(ServiceError::Forbidden(denial))
    }

    pub async fn require_member(
        &self,
        user_id: Uuid,
        scope: Scope,
    ) -> Result<Membership, ServiceError> {
        self.require_role(user_id, scope, Role::ALL).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Organization, VerifiedIdentity};
    use crate::services::store::InMemoryStore;

    async fn engine_with_owner() -> (AuthorizationEngine, Uuid, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let user = store
            .upsert_identity(
                &VerifiedIdentity {
                    provider: "github".to_string(),
                    provider_account_id: "1".to_string(),
                    email: "a@example.com".to_string(),
                    name: None,
                    image: None,
                },
                "hash",
            )
            .await
            .unwrap();
        let org = Organization::new("Acme".to_string());
        store.create_org(&org, user.user_id).await.unwrap();
        (AuthorizationEngine::new(store), user.user_id, org.org_id)
    }

    #[tokio::test]
    async fn owner_passes_manager_check() {
        let (authz, user, org) = engine_with_owner().await;
        let membership = authz
            .require_role(user, Scope::Org(org), Role::MANAGERS)
            .await
            .unwrap();
        assert_eq!(membership.role, Role::Owner);
    }

    #[tokio::test]
    async fn stranger_is_not_a_member() {
        let (authz, _, org) = engine_with_owner().await;
        let err = authz
            .require_member(Uuid::new_v4(), Scope::Org(org))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Forbidden(AuthzDenial::NotAMember)
        ));
    }

    #[tokio::test]
    async fn membership_at_org_does_not_grant_project_scope() {
        let (authz, user, org) = engine_with_owner().await;
        let err = authz
            .require_member(user, Scope::Project(org))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }
}
