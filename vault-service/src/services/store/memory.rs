//! In-process store used by tests and local development.
//!
//! A single mutex guards all state, so every trait method is trivially a
//! serializable transaction.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    check_owner_hierarchy, last_owner_message, ProfileChanges, SecretChanges, VaultStore,
};
use crate::models::{
    AuditAction, AuditFilter, AuditLogEntry, EncryptedValue, Invitation, MemberDetails,
    Membership, OrgMembership, OrgSummary, Organization, Project, ProjectMembership,
    ProjectSummary, Role, Scope, Secret, SecretRecord, SecretValue, SecretValueHistory, User,
    ValueHistory, VerifiedIdentity,
};
use crate::services::error::{AuthzDenial, ServiceError};

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    token_hashes: HashMap<String, Uuid>,
    identities: HashMap<(String, String), Uuid>,
    orgs: HashMap<Uuid, Organization>,
    org_members: HashMap<(Uuid, Uuid), OrgMembership>,
    projects: HashMap<Uuid, Project>,
    project_members: HashMap<(Uuid, Uuid), ProjectMembership>,
    secrets: HashMap<Uuid, Secret>,
    values: HashMap<Uuid, SecretValue>,
    history: Vec<SecretValueHistory>,
    invitations: HashMap<Uuid, Invitation>,
    audit: Vec<AuditLogEntry>,
}

impl MemoryState {
    fn membership(&self, scope: Scope, user_id: Uuid) -> Option<Membership> {
        match scope {
            Scope::Org(org_id) => self.org_members.get(&(org_id, user_id)).map(Membership::from),
            Scope::Project(project_id) => self
                .project_members
                .get(&(project_id, user_id))
                .map(Membership::from),
        }
    }

    fn owner_count(&self, scope: Scope) -> usize {
        match scope {
            Scope::Org(org_id) => self
                .org_members
                .values()
                .filter(|m| m.org_id == org_id && m.role == Role::Owner)
                .count(),
            Scope::Project(project_id) => self
                .project_members
                .values()
                .filter(|m| m.project_id == project_id && m.role == Role::Owner)
                .count(),
        }
    }

    fn ensure_not_last_owner(&self, scope: Scope, current: Role) -> Result<(), ServiceError> {
        if current == Role::Owner && self.owner_count(scope) <= 1 {
            return Err(ServiceError::LastOwnerViolation(last_owner_message(scope)));
        }
        Ok(())
    }

    fn set_role(&mut self, scope: Scope, user_id: Uuid, role: Role) {
        let now = Utc::now();
        match scope {
            Scope::Org(org_id) => {
                if let Some(m) = self.org_members.get_mut(&(org_id, user_id)) {
                    m.role = role;
                    m.updated_utc = now;
                }
            }
            Scope::Project(project_id) => {
                if let Some(m) = self.project_members.get_mut(&(project_id, user_id)) {
                    m.role = role;
                    m.updated_utc = now;
                }
            }
        }
    }

    fn deactivate_all(&mut self, user_id: Uuid) {
        for m in self.org_members.values_mut().filter(|m| m.user_id == user_id) {
            m.is_active = false;
        }
    }

    /// Activate the user's oldest remaining membership, if any.
    fn rehome(&mut self, user_id: Uuid) {
        if self
            .org_members
            .values()
            .any(|m| m.user_id == user_id && m.is_active)
        {
            return;
        }
        if let Some(m) = self
            .org_members
            .values_mut()
            .filter(|m| m.user_id == user_id)
            .min_by_key(|m| (m.created_utc, m.org_id))
        {
            m.is_active = true;
        }
    }

    fn project_conflict(&self, project: &Project) -> Option<&'static str> {
        self.projects
            .values()
            .filter(|p| p.org_id == project.org_id && p.project_id != project.project_id)
            .find_map(|p| {
                if p.slug == project.slug {
                    Some("A project with this slug already exists in the organization")
                } else if p.name == project.name {
                    Some("A project with this name already exists in the organization")
                } else {
                    None
                }
            })
    }

    fn drop_project(&mut self, project_id: Uuid) -> Vec<Uuid> {
        self.projects.remove(&project_id);
        let members: Vec<Uuid> = self
            .project_members
            .keys()
            .filter(|(p, _)| *p == project_id)
            .map(|(_, u)| *u)
            .collect();
        self.project_members.retain(|(p, _), _| *p != project_id);

        let secret_ids: Vec<Uuid> = self
            .secrets
            .values()
            .filter(|s| s.project_id == project_id)
            .map(|s| s.secret_id)
            .collect();
        for secret_id in secret_ids {
            self.drop_secret(secret_id);
        }

        for entry in self
            .audit
            .iter_mut()
            .filter(|e| e.project_id == Some(project_id))
        {
            entry.project_id = None;
        }
        members
    }

    fn drop_secret(&mut self, secret_id: Uuid) -> u64 {
        self.secrets.remove(&secret_id);
        let value_ids: Vec<Uuid> = self
            .values
            .values()
            .filter(|v| v.secret_id == secret_id)
            .map(|v| v.value_id)
            .collect();
        for value_id in &value_ids {
            self.values.remove(value_id);
        }
        self.history.retain(|h| !value_ids.contains(&h.value_id));
        value_ids.len() as u64
    }

    fn secret_record(&self, secret_id: Uuid) -> Option<SecretRecord> {
        let secret = self.secrets.get(&secret_id)?.clone();
        let mut values: Vec<SecretValue> = self
            .values
            .values()
            .filter(|v| v.secret_id == secret_id)
            .cloned()
            .collect();
        values.sort_by(|a, b| a.environment.as_str().cmp(b.environment.as_str()));
        Some(SecretRecord { secret, values })
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    fail_audit_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every audit insert fail, to exercise best-effort and purge paths.
    pub fn fail_audit_writes(&self, fail: bool) {
        self.fail_audit_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of every audit entry, oldest first.
    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.state
            .lock()
            .map(|s| s.audit.clone())
            .unwrap_or_default()
    }

    /// Number of stored value rows for a secret.
    pub fn value_rows(&self, secret_id: Uuid) -> usize {
        self.state
            .lock()
            .map(|s| s.values.values().filter(|v| v.secret_id == secret_id).count())
            .unwrap_or_default()
    }

    /// Raw stored ciphertext, for tests that inspect persistence.
    pub fn ciphertexts(&self, secret_id: Uuid) -> Vec<String> {
        self.state
            .lock()
            .map(|s| {
                s.values
                    .values()
                    .filter(|v| v.secret_id == secret_id)
                    .map(|v| v.ciphertext.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, ServiceError> {
        self.state.lock().map_err(|_| ServiceError::poisoned())
    }

    fn check_audit_writable(&self) -> Result<(), ServiceError> {
        if self.fail_audit_writes.load(Ordering::SeqCst) {
            return Err(ServiceError::Database(anyhow::anyhow!(
                "audit_logs is unavailable"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VaultStore for InMemoryStore {
    async fn health_check(&self) -> Result<(), ServiceError> {
        self.lock().map(|_| ())
    }

    // ==================== User Operations ====================

    async fn upsert_identity(
        &self,
        identity: &VerifiedIdentity,
        api_token_hash: &str,
    ) -> Result<User, ServiceError> {
        let mut state = self.lock()?;
        let identity_key = (
            identity.provider.clone(),
            identity.provider_account_id.clone(),
        );

        let existing = state.identities.get(&identity_key).copied().or_else(|| {
            state
                .users
                .values()
                .find(|u| u.email.eq_ignore_ascii_case(&identity.email))
                .map(|u| u.user_id)
        });

        let user_id = match existing {
            Some(user_id) => {
                let user = state
                    .users
                    .get_mut(&user_id)
                    .ok_or_else(|| ServiceError::not_found("User"))?;
                user.name = identity.name.clone().or(user.name.take());
                user.image = identity.image.clone().or(user.image.take());
                user.updated_utc = Utc::now();
                user_id
            }
            None => {
                let user = User::new(
                    identity.email.clone(),
                    identity.name.clone(),
                    identity.image.clone(),
                );
                let user_id = user.user_id;
                state.users.insert(user_id, user);
                user_id
            }
        };

        state.identities.insert(identity_key, user_id);
        state.token_hashes.retain(|_, u| *u != user_id);
        state
            .token_hashes
            .insert(api_token_hash.to_string(), user_id);

        state
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found("User"))
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        Ok(self.lock()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<User>, ServiceError> {
        let state = self.lock()?;
        Ok(state
            .token_hashes
            .get(token_hash)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn update_user(
        &self,
        user_id: Uuid,
        changes: &ProfileChanges,
    ) -> Result<User, ServiceError> {
        let mut state = self.lock()?;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| ServiceError::not_found("User"))?;
        if let Some(name) = &changes.name {
            user.name = Some(name.clone());
        }
        if let Some(image) = &changes.image {
            user.image = Some(image.clone());
        }
        user.updated_utc = Utc::now();
        Ok(user.clone())
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<Vec<Membership>, ServiceError> {
        let mut state = self.lock()?;
        if !state.users.contains_key(&user_id) {
            return Err(ServiceError::not_found("User"));
        }

        let memberships: Vec<Membership> = state
            .org_members
            .values()
            .filter(|m| m.user_id == user_id)
            .map(Membership::from)
            .chain(
                state
                    .project_members
                    .values()
                    .filter(|m| m.user_id == user_id)
                    .map(Membership::from),
            )
            .collect();
        for m in &memberships {
            state.ensure_not_last_owner(m.scope, m.role)?;
        }

        state.org_members.retain(|(_, u), _| *u != user_id);
        state.project_members.retain(|(_, u), _| *u != user_id);
        state.identities.retain(|_, u| *u != user_id);
        state.token_hashes.retain(|_, u| *u != user_id);
        state.invitations.retain(|_, i| i.invited_by != user_id);
        for h in state.history.iter_mut().filter(|h| h.changed_by == Some(user_id)) {
            h.changed_by = None;
        }
        state.users.remove(&user_id);

        Ok(memberships)
    }

    // ==================== Organization Operations ====================

    async fn create_org(
        &self,
        org: &Organization,
        owner_id: Uuid,
    ) -> Result<OrgMembership, ServiceError> {
        let mut state = self.lock()?;
        state.orgs.insert(org.org_id, org.clone());
        state.deactivate_all(owner_id);
        let membership = OrgMembership::new(org.org_id, owner_id, Role::Owner, true);
        state
            .org_members
            .insert((org.org_id, owner_id), membership.clone());
        Ok(membership)
    }

    async fn find_org(&self, org_id: Uuid) -> Result<Option<Organization>, ServiceError> {
        Ok(self.lock()?.orgs.get(&org_id).cloned())
    }

    async fn rename_org(&self, org_id: Uuid, name: &str) -> Result<Organization, ServiceError> {
        let mut state = self.lock()?;
        let org = state
            .orgs
            .get_mut(&org_id)
            .ok_or_else(|| ServiceError::not_found("Organization"))?;
        org.name = name.to_string();
        org.updated_utc = Utc::now();
        Ok(org.clone())
    }

    async fn delete_org(&self, org_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        let mut state = self.lock()?;
        if state.orgs.remove(&org_id).is_none() {
            return Err(ServiceError::not_found("Organization"));
        }

        let project_ids: Vec<Uuid> = state
            .projects
            .values()
            .filter(|p| p.org_id == org_id)
            .map(|p| p.project_id)
            .collect();
        for project_id in project_ids {
            state.drop_project(project_id);
        }

        let members: Vec<Uuid> = state
            .org_members
            .values()
            .filter(|m| m.org_id == org_id)
            .map(|m| m.user_id)
            .collect();
        state.org_members.retain(|(o, _), _| *o != org_id);
        state.invitations.retain(|_, i| i.org_id != org_id);
        for entry in state.audit.iter_mut().filter(|e| e.org_id == Some(org_id)) {
            entry.org_id = None;
        }
        for user_id in &members {
            state.rehome(*user_id);
        }

        Ok(members)
    }

    async fn list_orgs_for_user(&self, user_id: Uuid) -> Result<Vec<OrgSummary>, ServiceError> {
        let state = self.lock()?;
        let mut orgs: Vec<OrgSummary> = state
            .org_members
            .values()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| {
                state.orgs.get(&m.org_id).map(|o| OrgSummary {
                    org_id: o.org_id,
                    name: o.name.clone(),
                    role: m.role,
                    is_active: m.is_active,
                    joined_utc: m.created_utc,
                })
            })
            .collect();
        orgs.sort_by_key(|o| (o.joined_utc, o.org_id));
        Ok(orgs)
    }

    async fn activate_org(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<OrgMembership, ServiceError> {
        let mut state = self.lock()?;
        if !state.org_members.contains_key(&(org_id, user_id)) {
            return Err(ServiceError::not_found("Membership"));
        }
        state.deactivate_all(user_id);
        let membership = state
            .org_members
            .get_mut(&(org_id, user_id))
            .ok_or_else(|| ServiceError::not_found("Membership"))?;
        membership.is_active = true;
        Ok(membership.clone())
    }

    // ==================== Membership Operations ====================

    async fn find_membership(
        &self,
        user_id: Uuid,
        scope: Scope,
    ) -> Result<Option<Membership>, ServiceError> {
        Ok(self.lock()?.membership(scope, user_id))
    }

    async fn list_members(&self, scope: Scope) -> Result<Vec<MemberDetails>, ServiceError> {
        let state = self.lock()?;
        let rows: Vec<(Uuid, Role, chrono::DateTime<Utc>)> = match scope {
            Scope::Org(org_id) => state
                .org_members
                .values()
                .filter(|m| m.org_id == org_id)
                .map(|m| (m.user_id, m.role, m.created_utc))
                .collect(),
            Scope::Project(project_id) => state
                .project_members
                .values()
                .filter(|m| m.project_id == project_id)
                .map(|m| (m.user_id, m.role, m.created_utc))
                .collect(),
        };

        let mut members: Vec<MemberDetails> = rows
            .into_iter()
            .filter_map(|(user_id, role, created_utc)| {
                state.users.get(&user_id).map(|u| MemberDetails {
                    user_id,
                    email: u.email.clone(),
                    name: u.name.clone(),
                    image: u.image.clone(),
                    role,
                    created_utc,
                })
            })
            .collect();
        members.sort_by_key(|m| (m.created_utc, m.user_id));
        Ok(members)
    }

    async fn count_owners(&self, scope: Scope) -> Result<i64, ServiceError> {
        Ok(self.lock()?.owner_count(scope) as i64)
    }

    async fn change_role(
        &self,
        scope: Scope,
        user_id: Uuid,
        role: Role,
        acting: Role,
    ) -> Result<Membership, ServiceError> {
        let mut state = self.lock()?;
        let current = state
            .membership(scope, user_id)
            .ok_or_else(|| ServiceError::not_found("Member"))?;
        check_owner_hierarchy(acting, current.role, Some(role))?;
        if role != Role::Owner {
            state.ensure_not_last_owner(scope, current.role)?;
        }
        state.set_role(scope, user_id, role);
        Ok(current)
    }

    async fn remove_member(
        &self,
        scope: Scope,
        user_id: Uuid,
        acting: Option<Role>,
    ) -> Result<Membership, ServiceError> {
        let mut state = self.lock()?;
        let current = state
            .membership(scope, user_id)
            .ok_or_else(|| ServiceError::not_found("Member"))?;
        if let Some(acting) = acting {
            check_owner_hierarchy(acting, current.role, None)?;
        }
        state.ensure_not_last_owner(scope, current.role)?;

        match scope {
            Scope::Org(org_id) => {
                let project_memberships: Vec<(Uuid, Role)> = state
                    .project_members
                    .values()
                    .filter(|m| m.user_id == user_id)
                    .filter(|m| {
                        state
                            .projects
                            .get(&m.project_id)
                            .is_some_and(|p| p.org_id == org_id)
                    })
                    .map(|m| (m.project_id, m.role))
                    .collect();

                for (project_id, role) in &project_memberships {
                    state.ensure_not_last_owner(Scope::Project(*project_id), *role)?;
                }
                for (project_id, _) in project_memberships {
                    state.project_members.remove(&(project_id, user_id));
                }

                let removed = state.org_members.remove(&(org_id, user_id));
                if removed.is_some_and(|m| m.is_active) {
                    state.rehome(user_id);
                }
            }
            Scope::Project(project_id) => {
                state.project_members.remove(&(project_id, user_id));
            }
        }

        Ok(current)
    }

    async fn transfer_ownership(
        &self,
        scope: Scope,
        from: Uuid,
        to: Uuid,
    ) -> Result<(), ServiceError> {
        let mut state = self.lock()?;
        let current = state
            .membership(scope, from)
            .ok_or(ServiceError::Forbidden(AuthzDenial::NotAMember))?;
        if current.role != Role::Owner {
            return Err(ServiceError::Forbidden(AuthzDenial::InsufficientRole {
                held: current.role,
            }));
        }
        if state.membership(scope, to).is_none() {
            return Err(ServiceError::not_found("Member"));
        }

        state.set_role(scope, to, Role::Owner);
        state.set_role(scope, from, Role::Admin);
        Ok(())
    }

    async fn add_project_member(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<ProjectMembership, ServiceError> {
        let mut state = self.lock()?;
        let org_id = state
            .projects
            .get(&project_id)
            .map(|p| p.org_id)
            .ok_or_else(|| ServiceError::not_found("Project"))?;
        if !state.org_members.contains_key(&(org_id, user_id)) {
            return Err(ServiceError::invalid(
                "user_id",
                "User must be a member of the organization first",
            ));
        }
        if state.project_members.contains_key(&(project_id, user_id)) {
            return Err(ServiceError::Conflict(
                "User is already a member of this project".to_string(),
            ));
        }

        let membership = ProjectMembership::new(project_id, user_id, role);
        state
            .project_members
            .insert((project_id, user_id), membership.clone());
        Ok(membership)
    }

    // ==================== Invitation Operations ====================

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), ServiceError> {
        let mut state = self.lock()?;
        if state
            .invitations
            .values()
            .any(|i| i.token_hash == invitation.token_hash)
        {
            return Err(ServiceError::Conflict("Invitation token collision".to_string()));
        }
        state
            .invitations
            .insert(invitation.invitation_id, invitation.clone());
        Ok(())
    }

    async fn find_invitation_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Invitation>, ServiceError> {
        Ok(self
            .lock()?
            .invitations
            .values()
            .find(|i| i.token_hash == token_hash)
            .cloned())
    }

    async fn delete_invitation(&self, invitation_id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.lock()?.invitations.remove(&invitation_id).is_some())
    }

    async fn accept_invitation(
        &self,
        invitation: &Invitation,
        user_id: Uuid,
    ) -> Result<OrgMembership, ServiceError> {
        let mut state = self.lock()?;
        if !state.invitations.contains_key(&invitation.invitation_id) {
            return Err(ServiceError::not_found("Invitation"));
        }
        if state
            .org_members
            .contains_key(&(invitation.org_id, user_id))
        {
            return Err(ServiceError::Conflict(
                "You are already a member of this organization".to_string(),
            ));
        }

        state.invitations.remove(&invitation.invitation_id);
        state.deactivate_all(user_id);
        let membership = OrgMembership::new(invitation.org_id, user_id, Role::Member, true);
        state
            .org_members
            .insert((invitation.org_id, user_id), membership.clone());
        Ok(membership)
    }

    // ==================== Project Operations ====================

    async fn create_project(
        &self,
        project: &Project,
        owner_id: Uuid,
    ) -> Result<Project, ServiceError> {
        let mut state = self.lock()?;
        if let Some(conflict) = state.project_conflict(project) {
            return Err(ServiceError::Conflict(conflict.to_string()));
        }
        state.projects.insert(project.project_id, project.clone());
        state.project_members.insert(
            (project.project_id, owner_id),
            ProjectMembership::new(project.project_id, owner_id, Role::Owner),
        );
        Ok(project.clone())
    }

    async fn find_project(&self, project_id: Uuid) -> Result<Option<Project>, ServiceError> {
        Ok(self.lock()?.projects.get(&project_id).cloned())
    }

    async fn update_project(&self, project: &Project) -> Result<Project, ServiceError> {
        let mut state = self.lock()?;
        if !state.projects.contains_key(&project.project_id) {
            return Err(ServiceError::not_found("Project"));
        }
        if let Some(conflict) = state.project_conflict(project) {
            return Err(ServiceError::Conflict(conflict.to_string()));
        }
        let mut updated = project.clone();
        updated.updated_utc = Utc::now();
        state.projects.insert(updated.project_id, updated.clone());
        Ok(updated)
    }

    async fn delete_project(&self, project_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        let mut state = self.lock()?;
        if !state.projects.contains_key(&project_id) {
            return Err(ServiceError::not_found("Project"));
        }
        Ok(state.drop_project(project_id))
    }

    async fn list_projects_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ProjectSummary>, ServiceError> {
        let state = self.lock()?;
        let mut projects: Vec<ProjectSummary> = state
            .project_members
            .values()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| {
                let p = state.projects.get(&m.project_id)?;
                Some(ProjectSummary {
                    project_id: p.project_id,
                    org_id: p.org_id,
                    name: p.name.clone(),
                    slug: p.slug.clone(),
                    description: p.description.clone(),
                    role: m.role,
                    secret_count: state
                        .secrets
                        .values()
                        .filter(|s| s.project_id == p.project_id)
                        .count() as i64,
                    member_count: state
                        .project_members
                        .keys()
                        .filter(|(pid, _)| *pid == p.project_id)
                        .count() as i64,
                    updated_utc: p.updated_utc,
                })
            })
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    // ==================== Secret Operations ====================

    async fn create_secret(
        &self,
        secret: &Secret,
        values: &[EncryptedValue],
    ) -> Result<SecretRecord, ServiceError> {
        let mut state = self.lock()?;
        if state
            .secrets
            .values()
            .any(|s| s.project_id == secret.project_id && s.key == secret.key)
        {
            return Err(ServiceError::Conflict(format!(
                "Secret with key '{}' already exists in this project",
                secret.key
            )));
        }

        state.secrets.insert(secret.secret_id, secret.clone());
        for value in values {
            let row = SecretValue::new(
                secret.secret_id,
                value.environment,
                value.ciphertext.clone(),
            );
            state.values.insert(row.value_id, row);
        }

        state
            .secret_record(secret.secret_id)
            .ok_or_else(|| ServiceError::not_found("Secret"))
    }

    async fn find_secret(&self, secret_id: Uuid) -> Result<Option<Secret>, ServiceError> {
        Ok(self.lock()?.secrets.get(&secret_id).cloned())
    }

    async fn list_secrets(&self, project_id: Uuid) -> Result<Vec<SecretRecord>, ServiceError> {
        let state = self.lock()?;
        let mut records: Vec<SecretRecord> = state
            .secrets
            .values()
            .filter(|s| s.project_id == project_id)
            .filter_map(|s| state.secret_record(s.secret_id))
            .collect();
        records.sort_by(|a, b| a.secret.key.cmp(&b.secret.key));
        Ok(records)
    }

    async fn update_secret(
        &self,
        secret_id: Uuid,
        changes: &SecretChanges,
        changed_by: Uuid,
    ) -> Result<SecretRecord, ServiceError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let secret = state
            .secrets
            .get_mut(&secret_id)
            .ok_or_else(|| ServiceError::not_found("Secret"))?;
        if let Some(description) = &changes.description {
            secret.description = description.clone();
        }
        secret.updated_utc = now;

        for value in &changes.values {
            let existing = state
                .values
                .values_mut()
                .find(|v| v.secret_id == secret_id && v.environment == value.environment);

            match existing {
                Some(row) => {
                    let previous = std::mem::replace(&mut row.ciphertext, value.ciphertext.clone());
                    row.updated_utc = now;
                    let value_id = row.value_id;
                    state.history.push(SecretValueHistory {
                        history_id: Uuid::new_v4(),
                        value_id,
                        ciphertext: previous,
                        changed_by: Some(changed_by),
                        changed_utc: now,
                    });
                }
                None => {
                    let row =
                        SecretValue::new(secret_id, value.environment, value.ciphertext.clone());
                    state.values.insert(row.value_id, row);
                }
            }
        }

        state
            .secret_record(secret_id)
            .ok_or_else(|| ServiceError::not_found("Secret"))
    }

    async fn delete_secret(&self, secret_id: Uuid) -> Result<u64, ServiceError> {
        let mut state = self.lock()?;
        if !state.secrets.contains_key(&secret_id) {
            return Err(ServiceError::not_found("Secret"));
        }
        Ok(state.drop_secret(secret_id))
    }

    async fn secret_history(&self, secret_id: Uuid) -> Result<Vec<ValueHistory>, ServiceError> {
        let state = self.lock()?;
        let record = state
            .secret_record(secret_id)
            .ok_or_else(|| ServiceError::not_found("Secret"))?;

        Ok(record
            .values
            .into_iter()
            .map(|value| {
                // Appended chronologically, so reverse order is newest first.
                let history = state
                    .history
                    .iter()
                    .rev()
                    .filter(|h| h.value_id == value.value_id)
                    .cloned()
                    .collect();
                ValueHistory { value, history }
            })
            .collect())
    }

    // ==================== Audit Operations ====================

    async fn insert_audit_entry(&self, entry: &AuditLogEntry) -> Result<(), ServiceError> {
        self.check_audit_writable()?;
        self.lock()?.audit.push(entry.clone());
        Ok(())
    }

    async fn query_audit_entries(
        &self,
        org_id: Uuid,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<AuditLogEntry>, i64), ServiceError> {
        let state = self.lock()?;
        let matching: Vec<&AuditLogEntry> = state
            .audit
            .iter()
            .rev()
            .filter(|e| e.org_id == Some(org_id) && filter.matches(e))
            .collect();
        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn audit_actions(&self, org_id: Uuid) -> Result<Vec<AuditAction>, ServiceError> {
        let state = self.lock()?;
        let mut actions: Vec<AuditAction> = state
            .audit
            .iter()
            .filter(|e| e.org_id == Some(org_id))
            .map(|e| e.action)
            .collect();
        actions.sort_by_key(|a| a.as_str());
        actions.dedup();
        Ok(actions)
    }

    async fn select_audit_entries(
        &self,
        org_id: Uuid,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditLogEntry>, ServiceError> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .filter(|e| e.org_id == Some(org_id) && filter.matches(e))
            .cloned()
            .collect())
    }

    async fn purge_audit_entries(
        &self,
        org_id: Uuid,
        audit_ids: &[Uuid],
        record: &AuditLogEntry,
    ) -> Result<u64, ServiceError> {
        self.check_audit_writable()?;
        let mut state = self.lock()?;
        state.audit.push(record.clone());
        let before = state.audit.len();
        state.audit.retain(|e| {
            e.audit_id == record.audit_id
                || e.org_id != Some(org_id)
                || !audit_ids.contains(&e.audit_id)
        });
        Ok((before - state.audit.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (InMemoryStore, Uuid, Uuid, Uuid) {
        let store = InMemoryStore::new();
        let mut ids = Vec::new();
        for n in 0..2 {
            let user = store
                .upsert_identity(
                    &VerifiedIdentity {
                        provider: "github".to_string(),
                        provider_account_id: format!("acct-{n}"),
                        email: format!("user{n}@example.com"),
                        name: None,
                        image: None,
                    },
                    &format!("hash-{n}"),
                )
                .await
                .unwrap();
            ids.push(user.user_id);
        }
        let org = Organization::new("Acme".to_string());
        store.create_org(&org, ids[0]).await.unwrap();
        (store, org.org_id, ids[0], ids[1])
    }

    #[tokio::test]
    async fn sole_owner_cannot_be_demoted_or_removed() {
        let (store, org_id, owner, _) = seeded().await;
        let scope = Scope::Org(org_id);

        assert!(matches!(
            store.change_role(scope, owner, Role::Admin, Role::Owner).await,
            Err(ServiceError::LastOwnerViolation(_))
        ));
        assert!(matches!(
            store.remove_member(scope, owner, None).await,
            Err(ServiceError::LastOwnerViolation(_))
        ));
        assert_eq!(store.count_owners(scope).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn admin_cannot_demote_promote_or_remove_an_owner() {
        let (store, org_id, owner, other) = seeded().await;
        let invitation = Invitation::new(org_id, "t".to_string(), owner, Utc::now());
        store.insert_invitation(&invitation).await.unwrap();
        store.accept_invitation(&invitation, other).await.unwrap();
        let scope = Scope::Org(org_id);
        store
            .change_role(scope, other, Role::Admin, Role::Owner)
            .await
            .unwrap();

        let denied = |r: Result<Membership, ServiceError>| {
            matches!(
                r,
                Err(ServiceError::Forbidden(AuthzDenial::InsufficientRole { held: Role::Admin }))
            )
        };
        assert!(denied(store.change_role(scope, owner, Role::Member, Role::Admin).await));
        assert!(denied(store.change_role(scope, other, Role::Owner, Role::Admin).await));
        assert!(denied(store.remove_member(scope, owner, Some(Role::Admin)).await));

        let owner_row = store.find_membership(owner, scope).await.unwrap().unwrap();
        assert_eq!(owner_row.role, Role::Owner);

        let previous = store
            .change_role(scope, other, Role::Owner, Role::Owner)
            .await
            .unwrap();
        assert_eq!(previous.role, Role::Admin);
        assert_eq!(store.count_owners(scope).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn deleting_a_user_keeps_an_owner_and_drops_their_rows() {
        let (store, org_id, owner, other) = seeded().await;
        let invitation = Invitation::new(org_id, "t".to_string(), owner, Utc::now());
        store.insert_invitation(&invitation).await.unwrap();
        store.accept_invitation(&invitation, other).await.unwrap();

        assert!(matches!(
            store.delete_user(owner).await,
            Err(ServiceError::LastOwnerViolation(_))
        ));

        let dropped = store.delete_user(other).await.unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].scope, Scope::Org(org_id));
        assert!(store.find_user(other).await.unwrap().is_none());
        assert!(store
            .find_membership(other, Scope::Org(org_id))
            .await
            .unwrap()
            .is_none());
        assert!(store.find_user_by_token_hash("hash-1").await.unwrap().is_none());
        assert!(store.find_user(owner).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn transfer_swaps_owner_and_admin() {
        let (store, org_id, owner, other) = seeded().await;
        let org = store.find_org(org_id).await.unwrap().unwrap();
        let invitation = Invitation::new(org.org_id, "t".to_string(), owner, Utc::now());
        store.insert_invitation(&invitation).await.unwrap();
        store.accept_invitation(&invitation, other).await.unwrap();

        let scope = Scope::Org(org_id);
        store.transfer_ownership(scope, owner, other).await.unwrap();

        let from = store.find_membership(owner, scope).await.unwrap().unwrap();
        let to = store.find_membership(other, scope).await.unwrap().unwrap();
        assert_eq!(from.role, Role::Admin);
        assert_eq!(to.role, Role::Owner);
        assert_eq!(store.count_owners(scope).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn token_rotation_replaces_previous_hash() {
        let (store, _, owner, _) = seeded().await;
        let identity = VerifiedIdentity {
            provider: "github".to_string(),
            provider_account_id: "acct-0".to_string(),
            email: "user0@example.com".to_string(),
            name: Some("Zero".to_string()),
            image: None,
        };
        let user = store.upsert_identity(&identity, "rotated").await.unwrap();

        assert_eq!(user.user_id, owner);
        assert_eq!(user.name.as_deref(), Some("Zero"));
        assert!(store.find_user_by_token_hash("hash-0").await.unwrap().is_none());
        assert!(store.find_user_by_token_hash("rotated").await.unwrap().is_some());
    }
}
