//! Users provisioned from an already-verified OAuth identity, the opaque
//! API tokens that authenticate them afterwards, and self-service profile
//! management.

use rand::{rngs::OsRng, RngCore};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::audit::{AuditEvent, RequestContext};
use super::error::ServiceError;
use super::rate_limit::OperationClass;
use super::store::ProfileChanges;
use super::ServiceContext;
use crate::dtos::identity::{ProvisionIdentityResponse, UpdateProfileRequest, UserProfile};
use crate::models::{AuditAction, Scope, User, VerifiedIdentity};

const TOKEN_BYTES: usize = 16;

/// 128 random bits, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Clone)]
pub struct IdentityService {
    ctx: ServiceContext,
}

impl IdentityService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Upsert the user behind `identity` and issue a fresh API token,
    /// revoking any previous one.
    #[instrument(skip(self, identity), fields(provider = %identity.provider))]
    pub async fn provision(
        &self,
        mut identity: VerifiedIdentity,
    ) -> Result<ProvisionIdentityResponse, ServiceError> {
        identity.email = identity.email.trim().to_lowercase();
        identity.validate()?;

        let api_token = generate_token();
        let user = self
            .ctx
            .store
            .upsert_identity(&identity, &hash_token(&api_token))
            .await?;

        info!(user_id = %user.user_id, "Provisioned identity");
        Ok(ProvisionIdentityResponse { user, api_token })
    }

    pub async fn authenticate(&self, token: &str) -> Result<Option<User>, ServiceError> {
        if token.is_empty() {
            return Ok(None);
        }
        self.ctx.store.find_user_by_token_hash(&hash_token(token)).await
    }

    pub async fn profile(&self, user: User) -> Result<UserProfile, ServiceError> {
        let orgs = self.ctx.store.list_orgs_for_user(user.user_id).await?;
        let projects = self.ctx.store.list_projects_for_user(user.user_id).await?;
        Ok(UserProfile {
            user,
            orgs,
            projects,
        })
    }

    #[instrument(skip(self, request), fields(user_id = %actor))]
    pub async fn update_profile(
        &self,
        actor: Uuid,
        mut request: UpdateProfileRequest,
    ) -> Result<User, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        request.name = request.name.map(|n| n.trim().to_string());
        request.image = request.image.map(|i| i.trim().to_string());
        request.validate()?;

        let user = self
            .ctx
            .store
            .update_user(
                actor,
                &ProfileChanges {
                    name: request.name,
                    image: request.image,
                },
            )
            .await?;

        info!("Profile updated");
        Ok(user)
    }

    /// Delete the caller's account. Each org and project they leave gets a
    /// removal entry in its audit trail.
    #[instrument(skip(self, rctx), fields(user_id = %actor))]
    pub async fn delete_account(
        &self,
        actor: Uuid,
        rctx: &RequestContext,
    ) -> Result<(), ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        let dropped = self.ctx.store.delete_user(actor).await?;

        for membership in &dropped {
            let (org_id, project_id) = match self.ctx.audit_scope(membership.scope).await {
                Ok(scope) => scope,
                Err(e) => {
                    warn!(scope = %membership.scope, error = %e, "Skipping audit for vanished scope");
                    continue;
                }
            };
            let action = match membership.scope {
                Scope::Org(_) => AuditAction::RemoveOrgMember,
                Scope::Project(_) => AuditAction::RemoveProjectMember,
            };
            let mut event = AuditEvent::new(
                action,
                "membership",
                format!("Left {} on account deletion", membership.scope.kind()),
            )
            .org(org_id)
            .metadata(json!({
                "target_user_id": actor,
                "role": membership.role,
                "account_deleted": true,
            }));
            if let Some(project_id) = project_id {
                event = event.project(project_id);
            }
            self.ctx.audit.record(actor, event, rctx).await;

            match membership.scope {
                Scope::Org(org_id) => self.ctx.refresh_org(org_id, &[actor]).await,
                Scope::Project(project_id) => {
                    self.ctx.refresh_project(project_id, &[actor]).await
                }
            }
        }

        info!(memberships = dropped.len(), "Account deleted");
        Ok(())
    }
}
