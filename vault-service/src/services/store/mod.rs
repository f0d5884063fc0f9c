//! Transactional storage behind the vault.
//!
//! Every compound mutation is a single trait method so that implementations
//! can run it inside one transaction. Cross-request invariants (last owner,
//! single active org, single-use invitations) are enforced here, not in
//! process memory.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use uuid::Uuid;

use super::error::{AuthzDenial, ServiceError};
use crate::models::{
    AuditAction, AuditFilter, AuditLogEntry, EncryptedValue, Invitation, MemberDetails,
    Membership, OrgMembership, OrgSummary, Organization, Project, ProjectMembership,
    ProjectSummary, Role, Scope, Secret, SecretRecord, User, ValueHistory, VerifiedIdentity,
};

/// Partial secret update: `description` of `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct SecretChanges {
    pub description: Option<Option<String>>,
    pub values: Vec<EncryptedValue>,
}

/// Profile edit; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub name: Option<String>,
    pub image: Option<String>,
}

pub(crate) fn last_owner_message(scope: Scope) -> String {
    format!(
        "Cannot remove the last owner of {} {}; transfer ownership or promote another owner first",
        scope.kind(),
        scope.id()
    )
}

/// Only an OWNER may grant the OWNER role or demote or remove an OWNER.
/// Checked against the target row as read inside the mutating transaction.
pub(crate) fn check_owner_hierarchy(
    acting: Role,
    current: Role,
    new: Option<Role>,
) -> Result<(), ServiceError> {
    let touches_owner = current == Role::Owner || new == Some(Role::Owner);
    if touches_owner && acting != Role::Owner {
        return Err(ServiceError::Forbidden(AuthzDenial::InsufficientRole { held: acting }));
    }
    Ok(())
}

#[async_trait]
pub trait VaultStore: Send + Sync {
    async fn health_check(&self) -> Result<(), ServiceError>;

    // ==================== User Operations ====================

    /// Create or refresh the user behind an external identity and rotate
    /// their API token hash.
    async fn upsert_identity(
        &self,
        identity: &VerifiedIdentity,
        api_token_hash: &str,
    ) -> Result<User, ServiceError>;

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError>;

    async fn find_user_by_token_hash(&self, token_hash: &str)
        -> Result<Option<User>, ServiceError>;

    async fn update_user(
        &self,
        user_id: Uuid,
        changes: &ProfileChanges,
    ) -> Result<User, ServiceError>;

    /// Delete the user together with their identities, token, memberships and
    /// pending invitations. Rejected while they are the last OWNER of any org
    /// or project. Returns the memberships that were dropped.
    async fn delete_user(&self, user_id: Uuid) -> Result<Vec<Membership>, ServiceError>;

    // ==================== Organization Operations ====================

    /// Insert the org, make `owner_id` its active OWNER, and deactivate the
    /// owner's other memberships.
    async fn create_org(
        &self,
        org: &Organization,
        owner_id: Uuid,
    ) -> Result<OrgMembership, ServiceError>;

    async fn find_org(&self, org_id: Uuid) -> Result<Option<Organization>, ServiceError>;

    async fn rename_org(&self, org_id: Uuid, name: &str) -> Result<Organization, ServiceError>;

    /// Cascade-delete the org. Returns the ids of its former members.
    async fn delete_org(&self, org_id: Uuid) -> Result<Vec<Uuid>, ServiceError>;

    async fn list_orgs_for_user(&self, user_id: Uuid) -> Result<Vec<OrgSummary>, ServiceError>;

    /// Make `org_id` the user's only active org.
    async fn activate_org(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<OrgMembership, ServiceError>;

    // ==================== Membership Operations ====================

    async fn find_membership(
        &self,
        user_id: Uuid,
        scope: Scope,
    ) -> Result<Option<Membership>, ServiceError>;

    async fn list_members(&self, scope: Scope) -> Result<Vec<MemberDetails>, ServiceError>;

    async fn count_owners(&self, scope: Scope) -> Result<i64, ServiceError>;

    /// Change a member's role on behalf of a caller holding `acting`,
    /// rejecting a demotion of the last OWNER. Returns the membership as it
    /// was before the change.
    async fn change_role(
        &self,
        scope: Scope,
        user_id: Uuid,
        role: Role,
        acting: Role,
    ) -> Result<Membership, ServiceError>;

    /// Remove a member, rejecting removal of the last OWNER. `acting` is the
    /// caller's role, or `None` when the member is leaving. Org removals also
    /// drop the user's memberships in that org's projects and re-home their
    /// active org.
    async fn remove_member(
        &self,
        scope: Scope,
        user_id: Uuid,
        acting: Option<Role>,
    ) -> Result<Membership, ServiceError>;

    /// Promote `to` to OWNER and demote `from` to ADMIN atomically.
    async fn transfer_ownership(
        &self,
        scope: Scope,
        from: Uuid,
        to: Uuid,
    ) -> Result<(), ServiceError>;

    /// Add a project member; the user must already belong to the project's org.
    async fn add_project_member(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<ProjectMembership, ServiceError>;

    // ==================== Invitation Operations ====================

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), ServiceError>;

    async fn find_invitation_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Invitation>, ServiceError>;

    async fn delete_invitation(&self, invitation_id: Uuid) -> Result<bool, ServiceError>;

    /// Consume the invitation and create an active MEMBER membership for the
    /// user. Fails with `NotFound` if the invitation was already consumed.
    async fn accept_invitation(
        &self,
        invitation: &Invitation,
        user_id: Uuid,
    ) -> Result<OrgMembership, ServiceError>;

    // ==================== Project Operations ====================

    /// Insert the project with `owner_id` as its OWNER.
    async fn create_project(&self, project: &Project, owner_id: Uuid)
        -> Result<Project, ServiceError>;

    async fn find_project(&self, project_id: Uuid) -> Result<Option<Project>, ServiceError>;

    async fn update_project(&self, project: &Project) -> Result<Project, ServiceError>;

    /// Cascade-delete the project. Returns the ids of its former members.
    async fn delete_project(&self, project_id: Uuid) -> Result<Vec<Uuid>, ServiceError>;

    async fn list_projects_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ProjectSummary>, ServiceError>;

    // ==================== Secret Operations ====================

    async fn create_secret(
        &self,
        secret: &Secret,
        values: &[EncryptedValue],
    ) -> Result<SecretRecord, ServiceError>;

    async fn find_secret(&self, secret_id: Uuid) -> Result<Option<Secret>, ServiceError>;

    async fn list_secrets(&self, project_id: Uuid) -> Result<Vec<SecretRecord>, ServiceError>;

    /// Upsert values per environment, appending each overwritten ciphertext
    /// to the value's history.
    async fn update_secret(
        &self,
        secret_id: Uuid,
        changes: &SecretChanges,
        changed_by: Uuid,
    ) -> Result<SecretRecord, ServiceError>;

    /// Delete the secret and its values. Returns the number of values removed.
    async fn delete_secret(&self, secret_id: Uuid) -> Result<u64, ServiceError>;

    async fn secret_history(&self, secret_id: Uuid) -> Result<Vec<ValueHistory>, ServiceError>;

    // ==================== Audit Operations ====================

    async fn insert_audit_entry(&self, entry: &AuditLogEntry) -> Result<(), ServiceError>;

    /// Newest-first page of matching entries plus the total match count.
    async fn query_audit_entries(
        &self,
        org_id: Uuid,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<AuditLogEntry>, i64), ServiceError>;

    async fn audit_actions(&self, org_id: Uuid) -> Result<Vec<AuditAction>, ServiceError>;

    /// Every matching entry, oldest first, for archiving.
    async fn select_audit_entries(
        &self,
        org_id: Uuid,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditLogEntry>, ServiceError>;

    /// Insert `record` and delete the listed entries in one transaction.
    async fn purge_audit_entries(
        &self,
        org_id: Uuid,
        audit_ids: &[Uuid],
        record: &AuditLogEntry,
    ) -> Result<u64, ServiceError>;
}
