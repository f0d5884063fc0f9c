use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_AUDIT_PAGE_SIZE: u32 = 20;
pub const MAX_AUDIT_PAGE_SIZE: u32 = 100;

/// Query string of the audit listing. `action` is parsed by the service so
/// unknown codes surface as field errors.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuditLogQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub project_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub action: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PurgeAuditLogsRequest {
    pub older_than: Option<DateTime<Utc>>,
    pub user_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub action: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeAuditLogsResponse {
    pub purged: u64,
    pub archive: Option<String>,
}
