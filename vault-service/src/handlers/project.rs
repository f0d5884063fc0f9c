use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::project::{CreateProjectRequest, UpdateProjectRequest};
use crate::middleware::AuthUser;
use crate::models::{Project, ProjectDetails, ProjectSummary};
use crate::services::RequestContext;
use crate::AppState;

/// Create a project in `org_id`, or in the caller's active org.
///
/// POST /projects
pub async fn create_project(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), AppError> {
    let org_id = match req.org_id {
        Some(org_id) => org_id,
        None => state.orgs.active_org(user.id()).await?,
    };
    let project = state
        .projects
        .create_project(user.id(), org_id, req, &ctx)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /projects
pub async fn list_projects(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<ProjectSummary>>, AppError> {
    Ok(Json(state.projects.list_projects(user.id()).await?))
}

/// GET /projects/:project_id
pub async fn get_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<Uuid>,
) -> Result<Json<ProjectDetails>, AppError> {
    Ok(Json(state.projects.get_project(user.id(), project_id).await?))
}

/// PATCH /projects/:project_id
pub async fn update_project(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path(project_id): Path<Uuid>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<Json<Project>, AppError> {
    let project = state
        .projects
        .update_project(user.id(), project_id, req, &ctx)
        .await?;
    Ok(Json(project))
}

/// DELETE /projects/:project_id
pub async fn delete_project(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path(project_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state
        .projects
        .delete_project(user.id(), project_id, &ctx)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
