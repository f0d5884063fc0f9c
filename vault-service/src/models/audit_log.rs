//! Append-only audit trail entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::UnknownVariant;

/// Namespaced `VERB.NOUN` action codes. Filtering is exact-match on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "CREATE.ORG")]
    CreateOrg,
    #[serde(rename = "UPDATE.ORG")]
    UpdateOrg,
    #[serde(rename = "DELETE.ORG")]
    DeleteOrg,
    #[serde(rename = "CREATE.ORG_INVITE")]
    CreateOrgInvite,
    #[serde(rename = "ACCEPT.ORG_INVITE")]
    AcceptOrgInvite,
    #[serde(rename = "UPDATE.ORG_MEMBER_ROLE")]
    UpdateOrgMemberRole,
    #[serde(rename = "REMOVE.ORG_MEMBER")]
    RemoveOrgMember,
    #[serde(rename = "TRANSFER.ORG_OWNERSHIP")]
    TransferOrgOwnership,
    #[serde(rename = "CREATE.PROJECT")]
    CreateProject,
    #[serde(rename = "UPDATE.PROJECT")]
    UpdateProject,
    #[serde(rename = "DELETE.PROJECT")]
    DeleteProject,
    #[serde(rename = "ADD.PROJECT_MEMBER")]
    AddProjectMember,
    #[serde(rename = "UPDATE.PROJECT_MEMBER_ROLE")]
    UpdateProjectMemberRole,
    #[serde(rename = "REMOVE.PROJECT_MEMBER")]
    RemoveProjectMember,
    #[serde(rename = "TRANSFER.PROJECT_OWNERSHIP")]
    TransferProjectOwnership,
    #[serde(rename = "CREATE.SECRET")]
    CreateSecret,
    #[serde(rename = "UPDATE.SECRET")]
    UpdateSecret,
    #[serde(rename = "DELETE.SECRET")]
    DeleteSecret,
    #[serde(rename = "PURGE.AUDIT_LOG")]
    PurgeAuditLog,
}

impl AuditAction {
    pub const ALL: &'static [AuditAction] = &[
        AuditAction::CreateOrg,
        AuditAction::UpdateOrg,
        AuditAction::DeleteOrg,
        AuditAction::CreateOrgInvite,
        AuditAction::AcceptOrgInvite,
        AuditAction::UpdateOrgMemberRole,
        AuditAction::RemoveOrgMember,
        AuditAction::TransferOrgOwnership,
        AuditAction::CreateProject,
        AuditAction::UpdateProject,
        AuditAction::DeleteProject,
        AuditAction::AddProjectMember,
        AuditAction::UpdateProjectMemberRole,
        AuditAction::RemoveProjectMember,
        AuditAction::TransferProjectOwnership,
        AuditAction::CreateSecret,
        AuditAction::UpdateSecret,
        AuditAction::DeleteSecret,
        AuditAction::PurgeAuditLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::CreateOrg => "CREATE.ORG",
            AuditAction::UpdateOrg => "UPDATE.ORG",
            AuditAction::DeleteOrg => "DELETE.ORG",
            AuditAction::CreateOrgInvite => "CREATE.ORG_INVITE",
            AuditAction::AcceptOrgInvite => "ACCEPT.ORG_INVITE",
            AuditAction::UpdateOrgMemberRole => "UPDATE.ORG_MEMBER_ROLE",
            AuditAction::RemoveOrgMember => "REMOVE.ORG_MEMBER",
            AuditAction::TransferOrgOwnership => "TRANSFER.ORG_OWNERSHIP",
            AuditAction::CreateProject => "CREATE.PROJECT",
            AuditAction::UpdateProject => "UPDATE.PROJECT",
            AuditAction::DeleteProject => "DELETE.PROJECT",
            AuditAction::AddProjectMember => "ADD.PROJECT_MEMBER",
            AuditAction::UpdateProjectMemberRole => "UPDATE.PROJECT_MEMBER_ROLE",
            AuditAction::RemoveProjectMember => "REMOVE.PROJECT_MEMBER",
            AuditAction::TransferProjectOwnership => "TRANSFER.PROJECT_OWNERSHIP",
            AuditAction::CreateSecret => "CREATE.SECRET",
            AuditAction::UpdateSecret => "UPDATE.SECRET",
            AuditAction::DeleteSecret => "DELETE.SECRET",
            AuditAction::PurgeAuditLog => "PURGE.AUDIT_LOG",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "audit action",
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for AuditAction {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct AuditLogEntry {
    pub audit_id: Uuid,
    pub user_id: Uuid,
    pub org_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub action: AuditAction,
    pub resource: String,
    pub description: String,
    pub metadata: serde_json::Value,
    pub ip_address: String,
    pub user_agent: String,
    pub created_utc: DateTime<Utc>,
}

/// Exact-match filters over an org's audit trail.
///
/// `from`/`to` bound `created_utc` inclusively; `before` is exclusive and is
/// what bulk purges use.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuditFilter {
    pub project_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub action: Option<AuditAction>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.project_id.map_or(true, |p| entry.project_id == Some(p))
            && self.user_id.map_or(true, |u| entry.user_id == u)
            && self.action.map_or(true, |a| entry.action == a)
            && self.from.map_or(true, |t| entry.created_utc >= t)
            && self.to.map_or(true, |t| entry.created_utc <= t)
            && self.before.map_or(true, |t| entry.created_utc < t)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total_items: i64,
    pub total_pages: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Pagination {
    pub fn new(page: u32, limit: u32, total_items: i64) -> Self {
        let limit_i = i64::from(limit.max(1));
        let total_pages = (total_items + limit_i - 1) / limit_i;
        Self {
            page,
            limit,
            total_items,
            total_pages,
            has_next: i64::from(page) < total_pages,
            has_prev: page > 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditPage {
    pub entries: Vec<AuditLogEntry>,
    pub pagination: Pagination,
    /// Distinct actions present in the org's trail, for filter pickers.
    pub actions: Vec<AuditAction>,
}
