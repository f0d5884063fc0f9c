use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use subtle::ConstantTimeEq;

use crate::AppState;

pub const ADMIN_API_KEY_HEADER: &str = "x-admin-api-key";

/// Guards internal routes with the operator's admin API key.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state.config.security.admin_api_key.expose_secret().as_bytes();
    let provided = headers
        .get(ADMIN_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::as_bytes);

    match provided {
        Some(key) if !expected.is_empty() && bool::from(key.ct_eq(expected)) => {
            Ok(next.run(request).await)
        }
        _ => {
            tracing::warn!("Failed admin authentication attempt");
            Err(AppError::Unauthorized(anyhow::anyhow!(
                "Invalid or missing admin API key"
            )))
        }
    }
}
