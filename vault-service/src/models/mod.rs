pub mod audit_log;
pub mod invitation;
pub mod membership;
pub mod organization;
pub mod project;
pub mod secret;
pub mod user;

pub use audit_log::{AuditAction, AuditFilter, AuditLogEntry, AuditPage, Pagination};
pub use invitation::{Invitation, IssuedInvitation};
pub use membership::{MemberDetails, Membership, OrgMembership, ProjectMembership, Role, Scope};
pub use organization::{OrgDetails, OrgSummary, Organization};
pub use project::{Project, ProjectDetails, ProjectSummary};
pub use secret::{
    EncryptedValue, Environment, HistoryEntryView, SecretHistoryView, SecretRecord, Secret,
    SecretValue, SecretValueHistory, SecretValueView, SecretView, ValueHistory,
    ValueHistoryView,
};
pub use user::{User, VerifiedIdentity};

/// A stored enum code that does not match any known variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}
