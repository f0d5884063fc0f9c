use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;

use crate::dtos::identity::{
    ProvisionIdentityResponse, TokenValidationResponse, UpdateProfileRequest, UserProfile,
};
use crate::middleware::AuthUser;
use crate::models::{User, VerifiedIdentity};
use crate::services::RequestContext;
use crate::AppState;

/// Provision a user from an identity verified upstream and issue an API token.
///
/// POST /internal/identities
pub async fn provision_identity(
    State(state): State<AppState>,
    Json(identity): Json<VerifiedIdentity>,
) -> Result<(StatusCode, Json<ProvisionIdentityResponse>), AppError> {
    let response = state.identity.provision(identity).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /me
pub async fn get_profile(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<UserProfile>, AppError> {
    Ok(Json(state.identity.profile(user).await?))
}

/// PATCH /me
pub async fn update_profile(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<User>, AppError> {
    Ok(Json(state.identity.update_profile(user.id(), req).await?))
}

/// DELETE /me
pub async fn delete_account(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
) -> Result<StatusCode, AppError> {
    state.identity.delete_account(user.id(), &ctx).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Check the bearer token; the auth middleware has already rejected bad ones.
///
/// POST /auth/validate
pub async fn validate_token(AuthUser(user): AuthUser) -> Json<TokenValidationResponse> {
    Json(TokenValidationResponse { valid: true, user })
}
