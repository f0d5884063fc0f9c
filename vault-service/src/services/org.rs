//! Organization lifecycle and the caller's active-org switch.

use metrics::counter;
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use super::audit::{AuditEvent, RequestContext};
use super::cache::{self, Ttl};
use super::error::ServiceError;
use super::rate_limit::OperationClass;
use super::ServiceContext;
use crate::dtos::org::{CreateOrgRequest, UpdateOrgRequest};
use crate::models::{
    AuditAction, OrgDetails, OrgMembership, OrgSummary, Organization, Role, Scope,
};

#[derive(Clone)]
pub struct OrgService {
    ctx: ServiceContext,
}

impl OrgService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Create an org with the caller as its active OWNER.
    #[instrument(skip(self, request, rctx), fields(user_id = %actor))]
    pub async fn create_org(
        &self,
        actor: Uuid,
        mut request: CreateOrgRequest,
        rctx: &RequestContext,
    ) -> Result<Organization, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        request.name = request.name.trim().to_string();
        request.validate()?;

        let org = Organization::new(request.name);
        self.ctx.store.create_org(&org, actor).await?;

        self.ctx.invalidate_user_views(&[actor]).await;
        self.ctx
            .audit
            .record(
                actor,
                AuditEvent::new(
                    AuditAction::CreateOrg,
                    "organization",
                    format!("Created organization {}", org.name),
                )
                .org(org.org_id)
                .metadata(json!({ "name": org.name })),
                rctx,
            )
            .await;

        counter!("vault_org_operations_total", "operation" => "create").increment(1);
        info!(org_id = %org.org_id, "Organization created");
        Ok(org)
    }

    pub async fn list_orgs(&self, actor: Uuid) -> Result<Vec<OrgSummary>, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        let store = self.ctx.store.clone();
        self.ctx
            .cache
            .get_or_compute(&cache::user_orgs_key(actor), Ttl::Long, move || async move {
                store.list_orgs_for_user(actor).await
            })
            .await
    }

    #[instrument(skip(self), fields(user_id = %actor, org_id = %org_id))]
    pub async fn get_org(&self, actor: Uuid, org_id: Uuid) -> Result<OrgDetails, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        let membership = self.ctx.authz.require_member(actor, Scope::Org(org_id)).await?;

        let store = self.ctx.store.clone();
        let role = membership.role;
        self.ctx
            .cache
            .get_or_compute(
                &cache::org_data_key(org_id, actor),
                Ttl::Short,
                move || async move {
                    let org = store
                        .find_org(org_id)
                        .await?
                        .ok_or_else(|| ServiceError::not_found("Organization"))?;
                    let members = store.list_members(Scope::Org(org_id)).await?;
                    Ok(OrgDetails { org, role, members })
                },
            )
            .await
    }

    #[instrument(skip(self, request, rctx), fields(user_id = %actor, org_id = %org_id))]
    pub async fn update_org(
        &self,
        actor: Uuid,
        org_id: Uuid,
        mut request: UpdateOrgRequest,
        rctx: &RequestContext,
    ) -> Result<Organization, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        self.ctx
            .authz
            .require_role(actor, Scope::Org(org_id), Role::MANAGERS)
            .await?;
        request.name = request.name.trim().to_string();
        request.validate()?;

        let org = self.ctx.store.rename_org(org_id, &request.name).await?;

        self.ctx.refresh_org(org_id, &[]).await;
        self.ctx
            .audit
            .record(
                actor,
                AuditEvent::new(
                    AuditAction::UpdateOrg,
                    "organization",
                    format!("Renamed organization to {}", org.name),
                )
                .org(org_id)
                .metadata(json!({ "name": org.name })),
                rctx,
            )
            .await;

        Ok(org)
    }

    /// Cascade-delete the org. Audit rows survive with their org reference
    /// cleared, so the deletion itself is recorded without one.
    #[instrument(skip(self, rctx), fields(user_id = %actor, org_id = %org_id))]
    pub async fn delete_org(
        &self,
        actor: Uuid,
        org_id: Uuid,
        rctx: &RequestContext,
    ) -> Result<(), ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        self.ctx
            .authz
            .require_role(actor, Scope::Org(org_id), Role::OWNER_ONLY)
            .await?;

        let org = self
            .ctx
            .store
            .find_org(org_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Organization"))?;
        let former_members = self.ctx.store.delete_org(org_id).await?;

        self.ctx
            .cache
            .invalidate_prefix(&cache::org_data_prefix(org_id))
            .await;
        self.ctx
            .cache
            .invalidate_prefix(&cache::audit_prefix(org_id))
            .await;
        self.ctx.invalidate_user_views(&former_members).await;

        self.ctx
            .audit
            .record(
                actor,
                AuditEvent::new(
                    AuditAction::DeleteOrg,
                    "organization",
                    format!("Deleted organization {}", org.name),
                )
                .metadata(json!({
                    "org_id": org_id,
                    "name": org.name,
                    "members_removed": former_members.len(),
                })),
                rctx,
            )
            .await;

        counter!("vault_org_operations_total", "operation" => "delete").increment(1);
        info!(members = former_members.len(), "Organization deleted");
        Ok(())
    }

    /// The org the caller is currently working in.
    pub async fn active_org(&self, actor: Uuid) -> Result<Uuid, ServiceError> {
        self.list_orgs(actor)
            .await?
            .into_iter()
            .find(|o| o.is_active)
            .map(|o| o.org_id)
            .ok_or_else(|| {
                ServiceError::invalid("org_id", "No active organization; specify org_id")
            })
    }

    /// Make `org_id` the caller's only active org.
    #[instrument(skip(self), fields(user_id = %actor, org_id = %org_id))]
    pub async fn switch_active_org(
        &self,
        actor: Uuid,
        org_id: Uuid,
    ) -> Result<OrgMembership, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        self.ctx.authz.require_member(actor, Scope::Org(org_id)).await?;

        let membership = self.ctx.store.activate_org(actor, org_id).await?;
        self.ctx.invalidate_user_views(&[actor]).await;
        Ok(membership)
    }
}
