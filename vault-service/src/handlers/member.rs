//! Membership and invitation endpoints for both org and project scope.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::member::{
    AcceptInvitationRequest, AddProjectMemberRequest, ChangeRoleRequest, TransferOwnershipRequest,
};
use crate::middleware::AuthUser;
use crate::models::{IssuedInvitation, MemberDetails, Membership, OrgMembership, ProjectMembership, Scope};
use crate::services::RequestContext;
use crate::AppState;

// ==================== Invitations ====================

/// POST /orgs/:org_id/invitations
pub async fn create_invite(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path(org_id): Path<Uuid>,
) -> Result<(StatusCode, Json<IssuedInvitation>), AppError> {
    let invitation = state.members.create_invite(user.id(), org_id, &ctx).await?;
    Ok((StatusCode::CREATED, Json(invitation)))
}

/// POST /invitations/accept
pub async fn accept_invite(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Json(req): Json<AcceptInvitationRequest>,
) -> Result<Json<OrgMembership>, AppError> {
    req.validate()?;
    Ok(Json(state.members.accept_invite(user.id(), &req.token, &ctx).await?))
}

// ==================== Org Members ====================

/// GET /orgs/:org_id/members
pub async fn list_org_members(
    State(state): State<AppState>,
    user: AuthUser,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Vec<MemberDetails>>, AppError> {
    Ok(Json(state.members.list_members(user.id(), Scope::Org(org_id)).await?))
}

/// PATCH /orgs/:org_id/members/:user_id
pub async fn change_org_member_role(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path((org_id, target)): Path<(Uuid, Uuid)>,
    Json(req): Json<ChangeRoleRequest>,
) -> Result<Json<Membership>, AppError> {
    let membership = state
        .members
        .change_member_role(user.id(), Scope::Org(org_id), target, req.role, &ctx)
        .await?;
    Ok(Json(membership))
}

/// DELETE /orgs/:org_id/members/:user_id
pub async fn remove_org_member(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path((org_id, target)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state
        .members
        .remove_member(user.id(), Scope::Org(org_id), target, &ctx)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /orgs/:org_id/transfer-ownership
pub async fn transfer_org_ownership(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path(org_id): Path<Uuid>,
    Json(req): Json<TransferOwnershipRequest>,
) -> Result<StatusCode, AppError> {
    state
        .members
        .transfer_ownership(user.id(), Scope::Org(org_id), req.user_id, &ctx)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ==================== Project Members ====================

/// GET /projects/:project_id/members
pub async fn list_project_members(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Vec<MemberDetails>>, AppError> {
    Ok(Json(
        state
            .members
            .list_members(user.id(), Scope::Project(project_id))
            .await?,
    ))
}

/// POST /projects/:project_id/members
pub async fn add_project_member(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path(project_id): Path<Uuid>,
    Json(req): Json<AddProjectMemberRequest>,
) -> Result<(StatusCode, Json<ProjectMembership>), AppError> {
    let membership = state
        .members
        .add_project_member(user.id(), project_id, req, &ctx)
        .await?;
    Ok((StatusCode::CREATED, Json(membership)))
}

/// PATCH /projects/:project_id/members/:user_id
pub async fn change_project_member_role(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path((project_id, target)): Path<(Uuid, Uuid)>,
    Json(req): Json<ChangeRoleRequest>,
) -> Result<Json<Membership>, AppError> {
    let membership = state
        .members
        .change_member_role(user.id(), Scope::Project(project_id), target, req.role, &ctx)
        .await?;
    Ok(Json(membership))
}

/// DELETE /projects/:project_id/members/:user_id
pub async fn remove_project_member(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path((project_id, target)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state
        .members
        .remove_member(user.id(), Scope::Project(project_id), target, &ctx)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /projects/:project_id/transfer-ownership
pub async fn transfer_project_ownership(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path(project_id): Path<Uuid>,
    Json(req): Json<TransferOwnershipRequest>,
) -> Result<StatusCode, AppError> {
    state
        .members
        .transfer_ownership(user.id(), Scope::Project(project_id), req.user_id, &ctx)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
