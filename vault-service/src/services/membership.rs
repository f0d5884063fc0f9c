//! Invitations and membership changes at org and project scope.
//!
//! Self role changes are rejected here. OWNER-only promotion to and demotion
//! from OWNER, and the last-owner invariant, are checked by the store against
//! the rows read inside the mutating transaction.

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::audit::{AuditEvent, RequestContext};
use super::error::ServiceError;
use super::identity::{generate_token, hash_token};
use super::rate_limit::OperationClass;
use super::store::check_owner_hierarchy;
use super::ServiceContext;
use crate::dtos::member::AddProjectMemberRequest;
use crate::models::{
    AuditAction, Invitation, IssuedInvitation, MemberDetails, Membership, OrgMembership,
    ProjectMembership, Role, Scope,
};

const TOKEN_ATTEMPTS: usize = 5;

fn role_change_action(scope: Scope) -> AuditAction {
    match scope {
        Scope::Org(_) => AuditAction::UpdateOrgMemberRole,
        Scope::Project(_) => AuditAction::UpdateProjectMemberRole,
    }
}

fn removal_action(scope: Scope) -> AuditAction {
    match scope {
        Scope::Org(_) => AuditAction::RemoveOrgMember,
        Scope::Project(_) => AuditAction::RemoveProjectMember,
    }
}

fn transfer_action(scope: Scope) -> AuditAction {
    match scope {
        Scope::Org(_) => AuditAction::TransferOrgOwnership,
        Scope::Project(_) => AuditAction::TransferProjectOwnership,
    }
}

fn deny_warning(err: &ServiceError, actor: &Membership) {
    if matches!(err, ServiceError::Forbidden(_)) {
        warn!(user_id = %actor.user_id, scope = %actor.scope, "Only an owner may grant or revoke ownership");
    }
}

#[derive(Clone)]
pub struct MembershipService {
    ctx: ServiceContext,
    invitation_ttl: Duration,
}

impl MembershipService {
    pub fn new(ctx: ServiceContext, invitation_ttl_hours: i64) -> Self {
        Self {
            ctx,
            invitation_ttl: Duration::hours(invitation_ttl_hours),
        }
    }

    // ==================== Invitations ====================

    /// Issue a single-use invitation. The raw token is only ever returned here.
    #[instrument(skip(self, rctx), fields(user_id = %actor, org_id = %org_id))]
    pub async fn create_invite(
        &self,
        actor: Uuid,
        org_id: Uuid,
        rctx: &RequestContext,
    ) -> Result<IssuedInvitation, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Invite)?;
        self.ctx
            .authz
            .require_role(actor, Scope::Org(org_id), Role::MANAGERS)
            .await?;

        let expiry_utc = Utc::now() + self.invitation_ttl;
        let mut attempt = 0;
        let (invitation, token) = loop {
            attempt += 1;
            let token = generate_token();
            let invitation = Invitation::new(org_id, hash_token(&token), actor, expiry_utc);
            match self.ctx.store.insert_invitation(&invitation).await {
                Ok(()) => break (invitation, token),
                Err(ServiceError::Conflict(_)) if attempt < TOKEN_ATTEMPTS => {
                    warn!(attempt, "Invitation token collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        };

        self.ctx
            .audit
            .record(
                actor,
                AuditEvent::new(
                    AuditAction::CreateOrgInvite,
                    "invitation",
                    "Created organization invitation",
                )
                .org(org_id)
                .metadata(json!({
                    "invitation_id": invitation.invitation_id,
                    "expiry_utc": invitation.expiry_utc,
                })),
                rctx,
            )
            .await;

        info!(invitation_id = %invitation.invitation_id, "Invitation issued");
        Ok(IssuedInvitation {
            invitation_id: invitation.invitation_id,
            org_id,
            token,
            expiry_utc: invitation.expiry_utc,
        })
    }

    /// Join the invitation's org as an active MEMBER.
    #[instrument(skip(self, token, rctx), fields(user_id = %actor))]
    pub async fn accept_invite(
        &self,
        actor: Uuid,
        token: &str,
        rctx: &RequestContext,
    ) -> Result<OrgMembership, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Invite)?;

        let invitation = self
            .ctx
            .store
            .find_invitation_by_token_hash(&hash_token(token.trim()))
            .await?
            .ok_or_else(|| ServiceError::not_found("Invitation"))?;

        if invitation.is_expired(Utc::now()) {
            return Err(ServiceError::Gone("Invitation has expired".to_string()));
        }

        let org_scope = Scope::Org(invitation.org_id);
        if self.ctx.store.find_membership(actor, org_scope).await?.is_some() {
            self.ctx
                .store
                .delete_invitation(invitation.invitation_id)
                .await?;
            return Err(ServiceError::Conflict(
                "You are already a member of this organization".to_string(),
            ));
        }

        let membership = self.ctx.store.accept_invitation(&invitation, actor).await?;

        self.ctx.refresh_org(invitation.org_id, &[actor]).await;
        self.ctx
            .audit
            .record(
                actor,
                AuditEvent::new(
                    AuditAction::AcceptOrgInvite,
                    "invitation",
                    "Accepted organization invitation",
                )
                .org(invitation.org_id)
                .metadata(json!({
                    "invitation_id": invitation.invitation_id,
                    "invited_by": invitation.invited_by,
                })),
                rctx,
            )
            .await;

        info!(org_id = %invitation.org_id, "Invitation accepted");
        Ok(membership)
    }

    // ==================== Members ====================

    pub async fn list_members(
        &self,
        actor: Uuid,
        scope: Scope,
    ) -> Result<Vec<MemberDetails>, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Membership)?;
        self.ctx.authz.require_member(actor, scope).await?;
        self.ctx.store.list_members(scope).await
    }

    #[instrument(skip(self, rctx), fields(user_id = %actor, scope = %scope, target = %target))]
    pub async fn change_member_role(
        &self,
        actor: Uuid,
        scope: Scope,
        target: Uuid,
        role: Role,
        rctx: &RequestContext,
    ) -> Result<Membership, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Membership)?;
        let acting = self
            .ctx
            .authz
            .require_role(actor, scope, Role::MANAGERS)
            .await?;

        if target == actor {
            return Err(ServiceError::invalid("user_id", "You cannot change your own role"));
        }

        let (org_id, project_id) = self.ctx.audit_scope(scope).await?;
        let previous = self
            .ctx
            .store
            .change_role(scope, target, role, acting.role)
            .await
            .inspect_err(|e| deny_warning(e, &acting))?;
        let updated = Membership { role, ..previous };

        self.refresh(scope, target).await;
        let mut event = AuditEvent::new(
            role_change_action(scope),
            "membership",
            format!("Changed member role from {} to {}", previous.role, role),
        )
        .org(org_id)
        .metadata(json!({
            "target_user_id": target,
            "previous_role": previous.role,
            "role": role,
        }));
        if let Some(project_id) = project_id {
            event = event.project(project_id);
        }
        self.ctx.audit.record(actor, event, rctx).await;

        Ok(updated)
    }

    /// Remove `target`, or leave when `target` is the caller.
    #[instrument(skip(self, rctx), fields(user_id = %actor, scope = %scope, target = %target))]
    pub async fn remove_member(
        &self,
        actor: Uuid,
        scope: Scope,
        target: Uuid,
        rctx: &RequestContext,
    ) -> Result<(), ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Membership)?;

        let acting = if target == actor {
            self.ctx.authz.require_member(actor, scope).await?;
            None
        } else {
            let acting = self
                .ctx
                .authz
                .require_role(actor, scope, Role::MANAGERS)
                .await?;
            Some(acting)
        };

        let (org_id, project_id) = self.ctx.audit_scope(scope).await?;
        let removed = self
            .ctx
            .store
            .remove_member(scope, target, acting.as_ref().map(|m| m.role))
            .await
            .inspect_err(|e| {
                if let Some(acting) = &acting {
                    deny_warning(e, acting);
                }
            })?;

        self.refresh(scope, target).await;
        let description = if target == actor {
            format!("Left {}", scope.kind())
        } else {
            format!("Removed member from {}", scope.kind())
        };
        let mut event = AuditEvent::new(removal_action(scope), "membership", description)
            .org(org_id)
            .metadata(json!({
                "target_user_id": target,
                "role": removed.role,
            }));
        if let Some(project_id) = project_id {
            event = event.project(project_id);
        }
        self.ctx.audit.record(actor, event, rctx).await;

        Ok(())
    }

    /// Hand OWNER to `target` and step down to ADMIN, atomically.
    #[instrument(skip(self, rctx), fields(user_id = %actor, scope = %scope, target = %target))]
    pub async fn transfer_ownership(
        &self,
        actor: Uuid,
        scope: Scope,
        target: Uuid,
        rctx: &RequestContext,
    ) -> Result<(), ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Membership)?;
        self.ctx
            .authz
            .require_role(actor, scope, Role::OWNER_ONLY)
            .await?;

        if target == actor {
            return Err(ServiceError::invalid(
                "user_id",
                "Ownership must be transferred to another member",
            ));
        }
        let current = self
            .ctx
            .store
            .find_membership(target, scope)
            .await?
            .ok_or_else(|| ServiceError::not_found("Member"))?;
        if current.role == Role::Owner {
            return Err(ServiceError::invalid("user_id", "User is already an owner"));
        }

        let (org_id, project_id) = self.ctx.audit_scope(scope).await?;
        self.ctx.store.transfer_ownership(scope, actor, target).await?;

        self.refresh(scope, target).await;
        let mut event = AuditEvent::new(
            transfer_action(scope),
            "membership",
            format!("Transferred {} ownership", scope.kind()),
        )
        .org(org_id)
        .metadata(json!({
            "new_owner_id": target,
            "previous_owner_id": actor,
        }));
        if let Some(project_id) = project_id {
            event = event.project(project_id);
        }
        self.ctx.audit.record(actor, event, rctx).await;

        info!("Ownership transferred");
        Ok(())
    }

    #[instrument(skip(self, request, rctx), fields(user_id = %actor, project_id = %project_id))]
    pub async fn add_project_member(
        &self,
        actor: Uuid,
        project_id: Uuid,
        request: AddProjectMemberRequest,
        rctx: &RequestContext,
    ) -> Result<ProjectMembership, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Membership)?;
        let scope = Scope::Project(project_id);
        let acting = self
            .ctx
            .authz
            .require_role(actor, scope, Role::MANAGERS)
            .await?;

        let role = request.role.unwrap_or(Role::Member);
        check_owner_hierarchy(acting.role, Role::Member, Some(role))
            .inspect_err(|e| deny_warning(e, &acting))?;

        let (org_id, _) = self.ctx.audit_scope(scope).await?;
        let membership = self
            .ctx
            .store
            .add_project_member(project_id, request.user_id, role)
            .await?;

        self.refresh(scope, request.user_id).await;
        self.ctx
            .audit
            .record(
                actor,
                AuditEvent::new(
                    AuditAction::AddProjectMember,
                    "membership",
                    format!("Added project member as {}", role),
                )
                .org(org_id)
                .project(project_id)
                .metadata(json!({
                    "target_user_id": request.user_id,
                    "role": role,
                })),
                rctx,
            )
            .await;

        Ok(membership)
    }

    async fn refresh(&self, scope: Scope, target: Uuid) {
        match scope {
            Scope::Org(org_id) => self.ctx.refresh_org(org_id, &[target]).await,
            Scope::Project(project_id) => self.ctx.refresh_project(project_id, &[target]).await,
        }
    }
}
