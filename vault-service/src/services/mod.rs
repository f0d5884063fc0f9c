//! Services layer for vault-service.
//!
//! Every operation follows the same order: rate limit, authorize, validate,
//! mutate through the store, then invalidate cache keys and record audit.

pub mod archive;
pub mod audit;
mod audit_log;
pub mod authz;
pub mod cache;
pub mod crypto;
pub mod error;
mod identity;
mod membership;
mod org;
mod project;
pub mod rate_limit;
pub mod redis;
pub mod store;
mod vault;

pub use archive::{AuditArchive, FileAuditArchive, MemoryArchive};
pub use audit::{AuditEvent, AuditWriter, RequestContext};
pub use audit_log::AuditLogService;
pub use authz::AuthorizationEngine;
pub use cache::{CacheLayer, Ttl};
pub use crypto::CryptoEngine;
pub use error::{AuthzDenial, ServiceError};
pub use identity::{generate_token, hash_token, IdentityService};
pub use membership::MembershipService;
pub use org::OrgService;
pub use project::ProjectService;
pub use rate_limit::{ActorRateLimiter, OperationClass};
pub use redis::{CacheBackend, MockCache, RedisService};
pub use store::{InMemoryStore, PgStore, ProfileChanges, SecretChanges, VaultStore};
pub use vault::SecretVault;

use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::models::Scope;

/// Process-wide collaborators shared by every service.
#[derive(Clone)]
pub struct ServiceContext {
    pub store: Arc<dyn VaultStore>,
    pub authz: AuthorizationEngine,
    pub audit: AuditWriter,
    pub cache: CacheLayer,
    pub limiter: ActorRateLimiter,
}

impl ServiceContext {
    pub fn new(store: Arc<dyn VaultStore>, cache: CacheLayer, limiter: ActorRateLimiter) -> Self {
        Self {
            authz: AuthorizationEngine::new(store.clone()),
            audit: AuditWriter::new(store.clone(), cache.clone()),
            store,
            cache,
            limiter,
        }
    }

    /// Drop every cached view of an org: its per-member details and the org
    /// and project lists of its members and of `extra_users`.
    pub async fn refresh_org(&self, org_id: Uuid, extra_users: &[Uuid]) {
        self.cache
            .invalidate_prefix(&cache::org_data_prefix(org_id))
            .await;

        let mut users = match self.store.list_members(Scope::Org(org_id)).await {
            Ok(members) => members.into_iter().map(|m| m.user_id).collect(),
            Err(e) => {
                warn!(org_id = %org_id, error = %e, "Failed to list members for cache refresh");
                self.cache.invalidate_prefix("user:").await;
                Vec::new()
            }
        };
        users.extend_from_slice(extra_users);
        self.invalidate_user_views(&users).await;
    }

    /// Drop a project's secret list and the project lists of its members and
    /// of `extra_users`.
    pub async fn refresh_project(&self, project_id: Uuid, extra_users: &[Uuid]) {
        let mut keys = vec![cache::project_secrets_key(project_id)];

        match self.store.list_members(Scope::Project(project_id)).await {
            Ok(members) => keys.extend(
                members
                    .iter()
                    .map(|m| cache::user_projects_key(m.user_id)),
            ),
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "Failed to list members for cache refresh");
                self.cache.invalidate_prefix("user:projects:").await;
            }
        }
        keys.extend(extra_users.iter().map(|u| cache::user_projects_key(*u)));
        self.cache.invalidate(&keys).await;
    }

    pub async fn invalidate_user_views(&self, users: &[Uuid]) {
        let keys: Vec<String> = users
            .iter()
            .flat_map(|u| [cache::user_orgs_key(*u), cache::user_projects_key(*u)])
            .collect();
        self.cache.invalidate(&keys).await;
    }

    /// The org (and project, if any) an audit entry for `scope` belongs to.
    pub async fn audit_scope(&self, scope: Scope) -> Result<(Uuid, Option<Uuid>), ServiceError> {
        match scope {
            Scope::Org(org_id) => Ok((org_id, None)),
            Scope::Project(project_id) => {
                let project = self
                    .store
                    .find_project(project_id)
                    .await?
                    .ok_or_else(|| ServiceError::not_found("Project"))?;
                Ok((project.org_id, Some(project_id)))
            }
        }
    }
}
