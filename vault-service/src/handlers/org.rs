use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::org::{CreateOrgRequest, UpdateOrgRequest};
use crate::middleware::AuthUser;
use crate::models::{OrgDetails, OrgMembership, OrgSummary, Organization};
use crate::services::RequestContext;
use crate::AppState;

/// POST /orgs
pub async fn create_org(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Json(req): Json<CreateOrgRequest>,
) -> Result<(StatusCode, Json<Organization>), AppError> {
    let org = state.orgs.create_org(user.id(), req, &ctx).await?;
    Ok((StatusCode::CREATED, Json(org)))
}

/// GET /orgs
pub async fn list_orgs(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<OrgSummary>>, AppError> {
    Ok(Json(state.orgs.list_orgs(user.id()).await?))
}

/// GET /orgs/:org_id
pub async fn get_org(
    State(state): State<AppState>,
    user: AuthUser,
    Path(org_id): Path<Uuid>,
) -> Result<Json<OrgDetails>, AppError> {
    Ok(Json(state.orgs.get_org(user.id(), org_id).await?))
}

/// PATCH /orgs/:org_id
pub async fn update_org(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path(org_id): Path<Uuid>,
    Json(req): Json<UpdateOrgRequest>,
) -> Result<Json<Organization>, AppError> {
    Ok(Json(state.orgs.update_org(user.id(), org_id, req, &ctx).await?))
}

/// DELETE /orgs/:org_id
pub async fn delete_org(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path(org_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.orgs.delete_org(user.id(), org_id, &ctx).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /orgs/:org_id/activate
pub async fn switch_active_org(
    State(state): State<AppState>,
    user: AuthUser,
    Path(org_id): Path<Uuid>,
) -> Result<Json<OrgMembership>, AppError> {
    Ok(Json(state.orgs.switch_active_org(user.id(), org_id).await?))
}
