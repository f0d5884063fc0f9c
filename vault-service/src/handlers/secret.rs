use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::secret::{CreateSecretRequest, DeleteSecretResponse, UpdateSecretRequest};
use crate::middleware::AuthUser;
use crate::models::{SecretHistoryView, SecretView};
use crate::services::RequestContext;
use crate::AppState;

/// POST /projects/:project_id/secrets
pub async fn create_secret(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path(project_id): Path<Uuid>,
    Json(req): Json<CreateSecretRequest>,
) -> Result<(StatusCode, Json<SecretView>), AppError> {
    let secret = state
        .vault
        .create_secret(user.id(), project_id, req, &ctx)
        .await?;
    Ok((StatusCode::CREATED, Json(secret)))
}

/// GET /projects/:project_id/secrets
pub async fn list_secrets(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Vec<SecretView>>, AppError> {
    Ok(Json(state.vault.list_secrets(user.id(), project_id).await?))
}

/// PATCH /projects/:project_id/secrets/:secret_id
pub async fn update_secret(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path((project_id, secret_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateSecretRequest>,
) -> Result<Json<SecretView>, AppError> {
    let secret = state
        .vault
        .update_secret(user.id(), project_id, secret_id, req, &ctx)
        .await?;
    Ok(Json(secret))
}

/// DELETE /projects/:project_id/secrets/:secret_id
pub async fn delete_secret(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path((project_id, secret_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<DeleteSecretResponse>, AppError> {
    let deleted = state
        .vault
        .delete_secret(user.id(), project_id, secret_id, &ctx)
        .await?;
    Ok(Json(deleted))
}

/// GET /projects/:project_id/secrets/:secret_id/history
pub async fn secret_history(
    State(state): State<AppState>,
    user: AuthUser,
    Path((project_id, secret_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<SecretHistoryView>, AppError> {
    let history = state
        .vault
        .secret_history(user.id(), project_id, secret_id)
        .await?;
    Ok(Json(history))
}
