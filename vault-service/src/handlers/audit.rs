use axum::{
    extract::{Path, Query, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::audit::{AuditLogQuery, PurgeAuditLogsRequest, PurgeAuditLogsResponse};
use crate::middleware::AuthUser;
use crate::models::AuditPage;
use crate::services::RequestContext;
use crate::AppState;

/// GET /orgs/:org_id/audit-logs
pub async fn list_audit_logs(
    State(state): State<AppState>,
    user: AuthUser,
    Path(org_id): Path<Uuid>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<AuditPage>, AppError> {
    Ok(Json(
        state
            .audit_logs
            .list_audit_logs(user.id(), org_id, query)
            .await?,
    ))
}

/// Archive then delete matching entries.
///
/// DELETE /orgs/:org_id/audit-logs
pub async fn purge_audit_logs(
    State(state): State<AppState>,
    user: AuthUser,
    ctx: RequestContext,
    Path(org_id): Path<Uuid>,
    Json(req): Json<PurgeAuditLogsRequest>,
) -> Result<Json<PurgeAuditLogsResponse>, AppError> {
    Ok(Json(
        state
            .audit_logs
            .purge_audit_logs(user.id(), org_id, req, &ctx)
            .await?,
    ))
}
