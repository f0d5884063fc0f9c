//! PostgreSQL-backed store.

use async_trait::async_trait;
use metrics::histogram;
use sqlx::postgres::{PgConnection, PgPool, Postgres};
use sqlx::QueryBuilder;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
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

const USER_COLUMNS: &str = "user_id, email, name, image, created_utc, updated_utc";
const ORG_MEMBERSHIP_COLUMNS: &str = "org_id, user_id, role, is_active, created_utc, updated_utc";
const PROJECT_COLUMNS: &str = "project_id, org_id, name, slug, description, created_utc, updated_utc";
const SECRET_COLUMNS: &str = "secret_id, project_id, key, description, created_utc, updated_utc";
const VALUE_COLUMNS: &str = "value_id, secret_id, environment, ciphertext, created_utc, updated_utc";
const INVITATION_COLUMNS: &str =
    "invitation_id, org_id, token_hash, invited_by, expiry_utc, created_utc";
const AUDIT_COLUMNS: &str = "audit_id, user_id, org_id, project_id, action, resource, description, metadata, ip_address, user_agent, created_utc";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    tx_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, tx_timeout: Duration) -> Self {
        Self { pool, tx_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run one storage operation under the transaction deadline. A transaction
    /// dropped on timeout is rolled back by sqlx.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        work: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.tx_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = self.tx_timeout.as_millis() as u64, "Storage operation timed out");
                Err(ServiceError::Timeout)
            }
        };
        histogram!("vault_db_query_duration_seconds", "operation" => operation)
            .record(start.elapsed().as_secs_f64());
        result
    }
}

fn scope_table(scope: Scope) -> (&'static str, &'static str) {
    match scope {
        Scope::Org(_) => ("org_memberships", "org_id"),
        Scope::Project(_) => ("project_memberships", "project_id"),
    }
}

fn parse_role(code: String) -> Result<Role, ServiceError> {
    code.parse()
        .map_err(|e: crate::models::UnknownVariant| ServiceError::Internal(e.into()))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn project_conflict(err: sqlx::Error) -> ServiceError {
    match err {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            let message = if db_err.constraint() == Some("uq_projects_org_slug") {
                "A project with this slug already exists in the organization"
            } else {
                "A project with this name already exists in the organization"
            };
            ServiceError::Conflict(message.to_string())
        }
        _ => ServiceError::database("Failed to write project", err),
    }
}

/// Lock every OWNER row of the scope and return how many there are.
async fn lock_owners(conn: &mut PgConnection, scope: Scope) -> Result<i64, ServiceError> {
    let (table, column) = scope_table(scope);
    let owners: Vec<Uuid> = sqlx::query_scalar(&format!(
        "SELECT user_id FROM {table} WHERE {column} = $1 AND role = 'OWNER' ORDER BY user_id FOR UPDATE"
    ))
    .bind(scope.id())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| ServiceError::database("Failed to lock owners", e))?;
    Ok(owners.len() as i64)
}

async fn lock_role(
    conn: &mut PgConnection,
    scope: Scope,
    user_id: Uuid,
) -> Result<Option<Role>, ServiceError> {
    let (table, column) = scope_table(scope);
    let role: Option<String> = sqlx::query_scalar(&format!(
        "SELECT role FROM {table} WHERE {column} = $1 AND user_id = $2 FOR UPDATE"
    ))
    .bind(scope.id())
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ServiceError::database("Failed to lock membership", e))?;
    role.map(parse_role).transpose()
}

async fn set_role(
    conn: &mut PgConnection,
    scope: Scope,
    user_id: Uuid,
    role: Role,
) -> Result<(), ServiceError> {
    let (table, column) = scope_table(scope);
    sqlx::query(&format!(
        "UPDATE {table} SET role = $3, updated_utc = NOW() WHERE {column} = $1 AND user_id = $2"
    ))
    .bind(scope.id())
    .bind(user_id)
    .bind(role.as_str())
    .execute(&mut *conn)
    .await
    .map_err(|e| ServiceError::database("Failed to update role", e))?;
    Ok(())
}

async fn deactivate_all(conn: &mut PgConnection, user_id: Uuid) -> Result<(), ServiceError> {
    sqlx::query(
        "UPDATE org_memberships SET is_active = FALSE, updated_utc = NOW() WHERE user_id = $1 AND is_active",
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| ServiceError::database("Failed to deactivate memberships", e))?;
    Ok(())
}

/// Activate the user's oldest remaining membership when none is active.
async fn rehome(conn: &mut PgConnection, user_id: Uuid) -> Result<(), ServiceError> {
    sqlx::query(
        r#"
        UPDATE org_memberships SET is_active = TRUE, updated_utc = NOW()
        WHERE user_id = $1
          AND org_id = (
              SELECT org_id FROM org_memberships
              WHERE user_id = $1
              ORDER BY created_utc, org_id
              LIMIT 1
          )
          AND NOT EXISTS (
              SELECT 1 FROM org_memberships WHERE user_id = $1 AND is_active
          )
        "#,
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| ServiceError::database("Failed to re-home active org", e))?;
    Ok(())
}

async fn load_record(
    conn: &mut PgConnection,
    secret_id: Uuid,
) -> Result<Option<SecretRecord>, ServiceError> {
    let secret = sqlx::query_as::<_, Secret>(&format!(
        "SELECT {SECRET_COLUMNS} FROM secrets WHERE secret_id = $1"
    ))
    .bind(secret_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ServiceError::database("Failed to get secret", e))?;

    let Some(secret) = secret else {
        return Ok(None);
    };

    let mut values = sqlx::query_as::<_, SecretValue>(&format!(
        "SELECT {VALUE_COLUMNS} FROM secret_values WHERE secret_id = $1"
    ))
    .bind(secret_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| ServiceError::database("Failed to get secret values", e))?;
    values.sort_by(|a, b| a.environment.as_str().cmp(b.environment.as_str()));

    Ok(Some(SecretRecord { secret, values }))
}

fn push_audit_filter(qb: &mut QueryBuilder<'_, Postgres>, org_id: Uuid, filter: &AuditFilter) {
    qb.push(" WHERE org_id = ").push_bind(org_id);
    if let Some(project_id) = filter.project_id {
        qb.push(" AND project_id = ").push_bind(project_id);
    }
    if let Some(user_id) = filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(action) = filter.action {
        qb.push(" AND action = ").push_bind(action.as_str());
    }
    if let Some(from) = filter.from {
        qb.push(" AND created_utc >= ").push_bind(from);
    }
    if let Some(to) = filter.to {
        qb.push(" AND created_utc <= ").push_bind(to);
    }
    if let Some(before) = filter.before {
        qb.push(" AND created_utc < ").push_bind(before);
    }
}

#[async_trait]
impl VaultStore for PgStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| ServiceError::database("Health check failed", e))?;
        Ok(())
    }

    // ==================== User Operations ====================

    #[instrument(skip(self, identity, api_token_hash), fields(provider = %identity.provider))]
    async fn upsert_identity(
        &self,
        identity: &VerifiedIdentity,
        api_token_hash: &str,
    ) -> Result<User, ServiceError> {
        self.bounded("upsert_identity", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            let linked: Option<Uuid> = sqlx::query_scalar(
                "SELECT user_id FROM user_identities WHERE provider = $1 AND provider_account_id = $2",
            )
            .bind(&identity.provider)
            .bind(&identity.provider_account_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to find identity", e))?;

            let existing = match linked {
                Some(user_id) => Some(user_id),
                None => sqlx::query_scalar(
                    "SELECT user_id FROM users WHERE lower(email) = lower($1)",
                )
                .bind(&identity.email)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| ServiceError::database("Failed to find user by email", e))?,
            };

            let user = match existing {
                Some(user_id) => sqlx::query_as::<_, User>(&format!(
                    r#"
                    UPDATE users
                    SET name = COALESCE($2, name), image = COALESCE($3, image),
                        api_token_hash = $4, updated_utc = NOW()
                    WHERE user_id = $1
                    RETURNING {USER_COLUMNS}
                    "#
                ))
                .bind(user_id)
                .bind(&identity.name)
                .bind(&identity.image)
                .bind(api_token_hash)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| ServiceError::database("Failed to update user", e))?,
                None => {
                    let user = User::new(
                        identity.email.clone(),
                        identity.name.clone(),
                        identity.image.clone(),
                    );
                    sqlx::query_as::<_, User>(&format!(
                        r#"
                        INSERT INTO users (user_id, email, name, image, api_token_hash, created_utc, updated_utc)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        RETURNING {USER_COLUMNS}
                        "#
                    ))
                    .bind(user.user_id)
                    .bind(&user.email)
                    .bind(&user.name)
                    .bind(&user.image)
                    .bind(api_token_hash)
                    .bind(user.created_utc)
                    .bind(user.updated_utc)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| match e {
                        ref err if is_unique_violation(err) => {
                            ServiceError::Conflict("User already exists".to_string())
                        }
                        _ => ServiceError::database("Failed to create user", e),
                    })?
                }
            };

            sqlx::query(
                r#"
                INSERT INTO user_identities (provider, provider_account_id, user_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (provider, provider_account_id) DO NOTHING
                "#,
            )
            .bind(&identity.provider)
            .bind(&identity.provider_account_id)
            .bind(user.user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to link identity", e))?;

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;

            info!(user_id = %user.user_id, "Identity provisioned");
            Ok(user)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = $1"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ServiceError::database("Failed to get user", e))
    }

    #[instrument(skip(self, token_hash))]
    async fn find_user_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<User>, ServiceError> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE api_token_hash = $1"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to get user by token", e))
    }

    #[instrument(skip(self, changes))]
    async fn update_user(
        &self,
        user_id: Uuid,
        changes: &ProfileChanges,
    ) -> Result<User, ServiceError> {
        sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
            SET name = COALESCE($2, name), image = COALESCE($3, image), updated_utc = NOW()
            WHERE user_id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(&changes.name)
        .bind(&changes.image)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to update user", e))?
        .ok_or_else(|| ServiceError::not_found("User"))
    }

    #[instrument(skip(self))]
    async fn delete_user(&self, user_id: Uuid) -> Result<Vec<Membership>, ServiceError> {
        self.bounded("delete_user", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            let org_rows: Vec<(Uuid, String)> = sqlx::query_as(
                "SELECT org_id, role FROM org_memberships WHERE user_id = $1 ORDER BY org_id",
            )
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to list org memberships", e))?;
            let project_rows: Vec<(Uuid, String)> = sqlx::query_as(
                "SELECT project_id, role FROM project_memberships WHERE user_id = $1 ORDER BY project_id",
            )
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to list project memberships", e))?;

            let mut memberships = Vec::with_capacity(org_rows.len() + project_rows.len());
            for (org_id, role) in org_rows {
                memberships.push(Membership {
                    user_id,
                    scope: Scope::Org(org_id),
                    role: parse_role(role)?,
                });
            }
            for (project_id, role) in project_rows {
                memberships.push(Membership {
                    user_id,
                    scope: Scope::Project(project_id),
                    role: parse_role(role)?,
                });
            }

            for m in memberships.iter().filter(|m| m.role == Role::Owner) {
                if lock_owners(&mut tx, m.scope).await? <= 1 {
                    return Err(ServiceError::LastOwnerViolation(last_owner_message(m.scope)));
                }
            }

            // Identities, memberships and invitations cascade.
            let deleted = sqlx::query("DELETE FROM users WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| ServiceError::database("Failed to delete user", e))?;
            if deleted.rows_affected() == 0 {
                return Err(ServiceError::not_found("User"));
            }

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;

            info!(user_id = %user_id, "Deleted user");
            Ok(memberships)
        })
        .await
    }

    // ==================== Organization Operations ====================

    #[instrument(skip(self, org), fields(org_id = %org.org_id))]
    async fn create_org(
        &self,
        org: &Organization,
        owner_id: Uuid,
    ) -> Result<OrgMembership, ServiceError> {
        self.bounded("create_org", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            sqlx::query(
                "INSERT INTO organizations (org_id, name, created_utc, updated_utc) VALUES ($1, $2, $3, $4)",
            )
            .bind(org.org_id)
            .bind(&org.name)
            .bind(org.created_utc)
            .bind(org.updated_utc)
            .execute(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to create organization", e))?;

            deactivate_all(&mut tx, owner_id).await?;

            let membership = OrgMembership::new(org.org_id, owner_id, Role::Owner, true);
            let membership = sqlx::query_as::<_, OrgMembership>(&format!(
                r#"
                INSERT INTO org_memberships (org_id, user_id, role, is_active, created_utc, updated_utc)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING {ORG_MEMBERSHIP_COLUMNS}
                "#
            ))
            .bind(membership.org_id)
            .bind(membership.user_id)
            .bind(membership.role.as_str())
            .bind(membership.is_active)
            .bind(membership.created_utc)
            .bind(membership.updated_utc)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to create owner membership", e))?;

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;
            Ok(membership)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn find_org(&self, org_id: Uuid) -> Result<Option<Organization>, ServiceError> {
        sqlx::query_as::<_, Organization>(
            "SELECT org_id, name, created_utc, updated_utc FROM organizations WHERE org_id = $1",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to get organization", e))
    }

    #[instrument(skip(self))]
    async fn rename_org(&self, org_id: Uuid, name: &str) -> Result<Organization, ServiceError> {
        sqlx::query_as::<_, Organization>(
            r#"
            UPDATE organizations SET name = $2, updated_utc = NOW()
            WHERE org_id = $1
            RETURNING org_id, name, created_utc, updated_utc
            "#,
        )
        .bind(org_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to update organization", e))?
        .ok_or_else(|| ServiceError::not_found("Organization"))
    }

    #[instrument(skip(self))]
    async fn delete_org(&self, org_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        self.bounded("delete_org", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            let members: Vec<(Uuid, bool)> = sqlx::query_as(
                "SELECT user_id, is_active FROM org_memberships WHERE org_id = $1 FOR UPDATE",
            )
            .bind(org_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to list org members", e))?;

            let deleted = sqlx::query("DELETE FROM organizations WHERE org_id = $1")
                .bind(org_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| ServiceError::database("Failed to delete organization", e))?;
            if deleted.rows_affected() == 0 {
                return Err(ServiceError::not_found("Organization"));
            }

            for (user_id, was_active) in &members {
                if *was_active {
                    rehome(&mut tx, *user_id).await?;
                }
            }

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;

            Ok(members.into_iter().map(|(user_id, _)| user_id).collect())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_orgs_for_user(&self, user_id: Uuid) -> Result<Vec<OrgSummary>, ServiceError> {
        sqlx::query_as::<_, OrgSummary>(
            r#"
            SELECT o.org_id, o.name, m.role, m.is_active, m.created_utc AS joined_utc
            FROM org_memberships m
            JOIN organizations o ON o.org_id = m.org_id
            WHERE m.user_id = $1
            ORDER BY m.created_utc, o.org_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to list organizations", e))
    }

    #[instrument(skip(self))]
    async fn activate_org(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<OrgMembership, ServiceError> {
        self.bounded("activate_org", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            if lock_role(&mut tx, Scope::Org(org_id), user_id).await?.is_none() {
                return Err(ServiceError::not_found("Membership"));
            }

            deactivate_all(&mut tx, user_id).await?;

            let membership = sqlx::query_as::<_, OrgMembership>(&format!(
                r#"
                UPDATE org_memberships SET is_active = TRUE, updated_utc = NOW()
                WHERE org_id = $1 AND user_id = $2
                RETURNING {ORG_MEMBERSHIP_COLUMNS}
                "#
            ))
            .bind(org_id)
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to activate organization", e))?;

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;
            Ok(membership)
        })
        .await
    }

    // ==================== Membership Operations ====================

    #[instrument(skip(self))]
    async fn find_membership(
        &self,
        user_id: Uuid,
        scope: Scope,
    ) -> Result<Option<Membership>, ServiceError> {
        let (table, column) = scope_table(scope);
        let role: Option<String> = sqlx::query_scalar(&format!(
            "SELECT role FROM {table} WHERE {column} = $1 AND user_id = $2"
        ))
        .bind(scope.id())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to get membership", e))?;

        role.map(|code| {
            parse_role(code).map(|role| Membership {
                user_id,
                scope,
                role,
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn list_members(&self, scope: Scope) -> Result<Vec<MemberDetails>, ServiceError> {
        let (table, column) = scope_table(scope);
        sqlx::query_as::<_, MemberDetails>(&format!(
            r#"
            SELECT u.user_id, u.email, u.name, u.image, m.role, m.created_utc
            FROM {table} m
            JOIN users u ON u.user_id = m.user_id
            WHERE m.{column} = $1
            ORDER BY m.created_utc, u.user_id
            "#
        ))
        .bind(scope.id())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to list members", e))
    }

    #[instrument(skip(self))]
    async fn count_owners(&self, scope: Scope) -> Result<i64, ServiceError> {
        let (table, column) = scope_table(scope);
        sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE {column} = $1 AND role = 'OWNER'"
        ))
        .bind(scope.id())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to count owners", e))
    }

    #[instrument(skip(self))]
    async fn change_role(
        &self,
        scope: Scope,
        user_id: Uuid,
        role: Role,
        acting: Role,
    ) -> Result<Membership, ServiceError> {
        self.bounded("change_role", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            let owners = lock_owners(&mut tx, scope).await?;
            let current = lock_role(&mut tx, scope, user_id)
                .await?
                .ok_or_else(|| ServiceError::not_found("Member"))?;
            check_owner_hierarchy(acting, current, Some(role))?;

            if current == Role::Owner && role != Role::Owner && owners <= 1 {
                return Err(ServiceError::LastOwnerViolation(last_owner_message(scope)));
            }

            set_role(&mut tx, scope, user_id, role).await?;

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;

            Ok(Membership {
                user_id,
                scope,
                role: current,
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn remove_member(
        &self,
        scope: Scope,
        user_id: Uuid,
        acting: Option<Role>,
    ) -> Result<Membership, ServiceError> {
        self.bounded("remove_member", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            let owners = lock_owners(&mut tx, scope).await?;
            let current = lock_role(&mut tx, scope, user_id)
                .await?
                .ok_or_else(|| ServiceError::not_found("Member"))?;
            if let Some(acting) = acting {
                check_owner_hierarchy(acting, current, None)?;
            }
            if current == Role::Owner && owners <= 1 {
                return Err(ServiceError::LastOwnerViolation(last_owner_message(scope)));
            }

            match scope {
                Scope::Org(org_id) => {
                    let owned: Vec<Uuid> = sqlx::query_scalar(
                        r#"
                        SELECT pm.project_id
                        FROM project_memberships pm
                        JOIN projects p ON p.project_id = pm.project_id
                        WHERE p.org_id = $1 AND pm.user_id = $2 AND pm.role = 'OWNER'
                        ORDER BY pm.project_id
                        "#,
                    )
                    .bind(org_id)
                    .bind(user_id)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(|e| ServiceError::database("Failed to list owned projects", e))?;

                    for project_id in owned {
                        let project = Scope::Project(project_id);
                        if lock_owners(&mut tx, project).await? <= 1 {
                            return Err(ServiceError::LastOwnerViolation(last_owner_message(
                                project,
                            )));
                        }
                    }

                    sqlx::query(
                        r#"
                        DELETE FROM project_memberships
                        WHERE user_id = $2
                          AND project_id IN (SELECT project_id FROM projects WHERE org_id = $1)
                        "#,
                    )
                    .bind(org_id)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| ServiceError::database("Failed to remove project memberships", e))?;

                    let was_active: bool = sqlx::query_scalar(
                        "DELETE FROM org_memberships WHERE org_id = $1 AND user_id = $2 RETURNING is_active",
                    )
                    .bind(org_id)
                    .bind(user_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| ServiceError::database("Failed to remove member", e))?;

                    if was_active {
                        rehome(&mut tx, user_id).await?;
                    }
                }
                Scope::Project(project_id) => {
                    sqlx::query(
                        "DELETE FROM project_memberships WHERE project_id = $1 AND user_id = $2",
                    )
                    .bind(project_id)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| ServiceError::database("Failed to remove member", e))?;
                }
            }

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;

            Ok(Membership {
                user_id,
                scope,
                role: current,
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn transfer_ownership(
        &self,
        scope: Scope,
        from: Uuid,
        to: Uuid,
    ) -> Result<(), ServiceError> {
        self.bounded("transfer_ownership", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            lock_owners(&mut tx, scope).await?;
            match lock_role(&mut tx, scope, from).await? {
                None => return Err(ServiceError::Forbidden(AuthzDenial::NotAMember)),
                Some(Role::Owner) => {}
                Some(held) => {
                    return Err(ServiceError::Forbidden(AuthzDenial::InsufficientRole { held }))
                }
            }
            if lock_role(&mut tx, scope, to).await?.is_none() {
                return Err(ServiceError::not_found("Member"));
            }

            set_role(&mut tx, scope, to, Role::Owner).await?;
            set_role(&mut tx, scope, from, Role::Admin).await?;

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn add_project_member(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<ProjectMembership, ServiceError> {
        self.bounded("add_project_member", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            let org_id: Uuid = sqlx::query_scalar("SELECT org_id FROM projects WHERE project_id = $1")
                .bind(project_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| ServiceError::database("Failed to get project", e))?
                .ok_or_else(|| ServiceError::not_found("Project"))?;

            if lock_role(&mut tx, Scope::Org(org_id), user_id).await?.is_none() {
                return Err(ServiceError::invalid(
                    "user_id",
                    "User must be a member of the organization first",
                ));
            }

            let membership = ProjectMembership::new(project_id, user_id, role);
            let membership = sqlx::query_as::<_, ProjectMembership>(
                r#"
                INSERT INTO project_memberships (project_id, user_id, role, created_utc, updated_utc)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING project_id, user_id, role, created_utc, updated_utc
                "#,
            )
            .bind(membership.project_id)
            .bind(membership.user_id)
            .bind(membership.role.as_str())
            .bind(membership.created_utc)
            .bind(membership.updated_utc)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| match e {
                ref err if is_unique_violation(err) => ServiceError::Conflict(
                    "User is already a member of this project".to_string(),
                ),
                _ => ServiceError::database("Failed to add project member", e),
            })?;

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;
            Ok(membership)
        })
        .await
    }

    // ==================== Invitation Operations ====================

    #[instrument(skip(self, invitation), fields(org_id = %invitation.org_id))]
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO invitations (invitation_id, org_id, token_hash, invited_by, expiry_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(invitation.invitation_id)
        .bind(invitation.org_id)
        .bind(&invitation.token_hash)
        .bind(invitation.invited_by)
        .bind(invitation.expiry_utc)
        .bind(invitation.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            ref err if is_unique_violation(err) => {
                ServiceError::Conflict("Invitation token collision".to_string())
            }
            _ => ServiceError::database("Failed to create invitation", e),
        })?;
        Ok(())
    }

    #[instrument(skip(self, token_hash))]
    async fn find_invitation_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Invitation>, ServiceError> {
        sqlx::query_as::<_, Invitation>(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations WHERE token_hash = $1"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to get invitation", e))
    }

    #[instrument(skip(self))]
    async fn delete_invitation(&self, invitation_id: Uuid) -> Result<bool, ServiceError> {
        let result = sqlx::query("DELETE FROM invitations WHERE invitation_id = $1")
            .bind(invitation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| ServiceError::database("Failed to delete invitation", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, invitation), fields(invitation_id = %invitation.invitation_id))]
    async fn accept_invitation(
        &self,
        invitation: &Invitation,
        user_id: Uuid,
    ) -> Result<OrgMembership, ServiceError> {
        self.bounded("accept_invitation", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            // The delete is the single-use gate: a concurrent accept sees 0 rows.
            let consumed = sqlx::query("DELETE FROM invitations WHERE invitation_id = $1")
                .bind(invitation.invitation_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| ServiceError::database("Failed to consume invitation", e))?;
            if consumed.rows_affected() == 0 {
                return Err(ServiceError::not_found("Invitation"));
            }

            deactivate_all(&mut tx, user_id).await?;

            let membership = OrgMembership::new(invitation.org_id, user_id, Role::Member, true);
            let membership = sqlx::query_as::<_, OrgMembership>(&format!(
                r#"
                INSERT INTO org_memberships (org_id, user_id, role, is_active, created_utc, updated_utc)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING {ORG_MEMBERSHIP_COLUMNS}
                "#
            ))
            .bind(membership.org_id)
            .bind(membership.user_id)
            .bind(membership.role.as_str())
            .bind(membership.is_active)
            .bind(membership.created_utc)
            .bind(membership.updated_utc)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| match e {
                ref err if is_unique_violation(err) => ServiceError::Conflict(
                    "You are already a member of this organization".to_string(),
                ),
                _ => ServiceError::database("Failed to create membership", e),
            })?;

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;
            Ok(membership)
        })
        .await
    }

    // ==================== Project Operations ====================

    #[instrument(skip(self, project), fields(org_id = %project.org_id, slug = %project.slug))]
    async fn create_project(
        &self,
        project: &Project,
        owner_id: Uuid,
    ) -> Result<Project, ServiceError> {
        self.bounded("create_project", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            let created = sqlx::query_as::<_, Project>(&format!(
                r#"
                INSERT INTO projects (project_id, org_id, name, slug, description, created_utc, updated_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING {PROJECT_COLUMNS}
                "#
            ))
            .bind(project.project_id)
            .bind(project.org_id)
            .bind(&project.name)
            .bind(&project.slug)
            .bind(&project.description)
            .bind(project.created_utc)
            .bind(project.updated_utc)
            .fetch_one(&mut *tx)
            .await
            .map_err(project_conflict)?;

            sqlx::query(
                r#"
                INSERT INTO project_memberships (project_id, user_id, role)
                VALUES ($1, $2, 'OWNER')
                "#,
            )
            .bind(created.project_id)
            .bind(owner_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to create project owner", e))?;

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;
            Ok(created)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn find_project(&self, project_id: Uuid) -> Result<Option<Project>, ServiceError> {
        sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE project_id = $1"
        ))
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to get project", e))
    }

    #[instrument(skip(self, project), fields(project_id = %project.project_id))]
    async fn update_project(&self, project: &Project) -> Result<Project, ServiceError> {
        sqlx::query_as::<_, Project>(&format!(
            r#"
            UPDATE projects SET name = $2, slug = $3, description = $4, updated_utc = NOW()
            WHERE project_id = $1
            RETURNING {PROJECT_COLUMNS}
            "#
        ))
        .bind(project.project_id)
        .bind(&project.name)
        .bind(&project.slug)
        .bind(&project.description)
        .fetch_optional(&self.pool)
        .await
        .map_err(project_conflict)?
        .ok_or_else(|| ServiceError::not_found("Project"))
    }

    #[instrument(skip(self))]
    async fn delete_project(&self, project_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        self.bounded("delete_project", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            let members: Vec<Uuid> = sqlx::query_scalar(
                "SELECT user_id FROM project_memberships WHERE project_id = $1",
            )
            .bind(project_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to list project members", e))?;

            let deleted = sqlx::query("DELETE FROM projects WHERE project_id = $1")
                .bind(project_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| ServiceError::database("Failed to delete project", e))?;
            if deleted.rows_affected() == 0 {
                return Err(ServiceError::not_found("Project"));
            }

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;
            Ok(members)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_projects_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ProjectSummary>, ServiceError> {
        sqlx::query_as::<_, ProjectSummary>(
            r#"
            SELECT p.project_id, p.org_id, p.name, p.slug, p.description, pm.role,
                   (SELECT COUNT(*) FROM secrets s WHERE s.project_id = p.project_id) AS secret_count,
                   (SELECT COUNT(*) FROM project_memberships m WHERE m.project_id = p.project_id) AS member_count,
                   p.updated_utc
            FROM project_memberships pm
            JOIN projects p ON p.project_id = pm.project_id
            WHERE pm.user_id = $1
            ORDER BY p.name COLLATE "C"
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to list projects", e))
    }

    // ==================== Secret Operations ====================

    #[instrument(skip(self, secret, values), fields(project_id = %secret.project_id, key = %secret.key))]
    async fn create_secret(
        &self,
        secret: &Secret,
        values: &[EncryptedValue],
    ) -> Result<SecretRecord, ServiceError> {
        self.bounded("create_secret", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            sqlx::query(
                r#"
                INSERT INTO secrets (secret_id, project_id, key, description, created_utc, updated_utc)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(secret.secret_id)
            .bind(secret.project_id)
            .bind(&secret.key)
            .bind(&secret.description)
            .bind(secret.created_utc)
            .bind(secret.updated_utc)
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                ref err if is_unique_violation(err) => ServiceError::Conflict(format!(
                    "Secret with key '{}' already exists in this project",
                    secret.key
                )),
                _ => ServiceError::database("Failed to create secret", e),
            })?;

            for value in values {
                let row = SecretValue::new(
                    secret.secret_id,
                    value.environment,
                    value.ciphertext.clone(),
                );
                sqlx::query(
                    r#"
                    INSERT INTO secret_values (value_id, secret_id, environment, ciphertext, created_utc, updated_utc)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(row.value_id)
                .bind(row.secret_id)
                .bind(row.environment.as_str())
                .bind(&row.ciphertext)
                .bind(row.created_utc)
                .bind(row.updated_utc)
                .execute(&mut *tx)
                .await
                .map_err(|e| ServiceError::database("Failed to create secret value", e))?;
            }

            let record = load_record(&mut tx, secret.secret_id)
                .await?
                .ok_or_else(|| ServiceError::not_found("Secret"))?;

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;
            Ok(record)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn find_secret(&self, secret_id: Uuid) -> Result<Option<Secret>, ServiceError> {
        sqlx::query_as::<_, Secret>(&format!(
            "SELECT {SECRET_COLUMNS} FROM secrets WHERE secret_id = $1"
        ))
        .bind(secret_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to get secret", e))
    }

    #[instrument(skip(self))]
    async fn list_secrets(&self, project_id: Uuid) -> Result<Vec<SecretRecord>, ServiceError> {
        let secrets = sqlx::query_as::<_, Secret>(&format!(
            r#"SELECT {SECRET_COLUMNS} FROM secrets WHERE project_id = $1 ORDER BY key COLLATE "C""#
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to list secrets", e))?;

        let ids: Vec<Uuid> = secrets.iter().map(|s| s.secret_id).collect();
        let values = sqlx::query_as::<_, SecretValue>(&format!(
            "SELECT {VALUE_COLUMNS} FROM secret_values WHERE secret_id = ANY($1)"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to list secret values", e))?;

        let mut by_secret: HashMap<Uuid, Vec<SecretValue>> = HashMap::new();
        for value in values {
            by_secret.entry(value.secret_id).or_default().push(value);
        }

        Ok(secrets
            .into_iter()
            .map(|secret| {
                let mut values = by_secret.remove(&secret.secret_id).unwrap_or_default();
                values.sort_by(|a, b| a.environment.as_str().cmp(b.environment.as_str()));
                SecretRecord { secret, values }
            })
            .collect())
    }

    #[instrument(skip(self, changes), fields(values = changes.values.len()))]
    async fn update_secret(
        &self,
        secret_id: Uuid,
        changes: &SecretChanges,
        changed_by: Uuid,
    ) -> Result<SecretRecord, ServiceError> {
        self.bounded("update_secret", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            let updated = sqlx::query(
                r#"
                UPDATE secrets
                SET description = CASE WHEN $2 THEN $3 ELSE description END,
                    updated_utc = NOW()
                WHERE secret_id = $1
                "#,
            )
            .bind(secret_id)
            .bind(changes.description.is_some())
            .bind(changes.description.clone().flatten())
            .execute(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to update secret", e))?;
            if updated.rows_affected() == 0 {
                return Err(ServiceError::not_found("Secret"));
            }

            for value in &changes.values {
                let existing: Option<(Uuid, String)> = sqlx::query_as(
                    r#"
                    SELECT value_id, ciphertext FROM secret_values
                    WHERE secret_id = $1 AND environment = $2
                    FOR UPDATE
                    "#,
                )
                .bind(secret_id)
                .bind(value.environment.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| ServiceError::database("Failed to get secret value", e))?;

                match existing {
                    Some((value_id, previous)) => {
                        sqlx::query(
                            r#"
                            INSERT INTO secret_value_history (history_id, value_id, ciphertext, changed_by)
                            VALUES ($1, $2, $3, $4)
                            "#,
                        )
                        .bind(Uuid::new_v4())
                        .bind(value_id)
                        .bind(&previous)
                        .bind(changed_by)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| ServiceError::database("Failed to record history", e))?;

                        sqlx::query(
                            "UPDATE secret_values SET ciphertext = $2, updated_utc = NOW() WHERE value_id = $1",
                        )
                        .bind(value_id)
                        .bind(&value.ciphertext)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| ServiceError::database("Failed to update secret value", e))?;
                    }
                    None => {
                        let row = SecretValue::new(
                            secret_id,
                            value.environment,
                            value.ciphertext.clone(),
                        );
                        sqlx::query(
                            r#"
                            INSERT INTO secret_values (value_id, secret_id, environment, ciphertext, created_utc, updated_utc)
                            VALUES ($1, $2, $3, $4, $5, $6)
                            "#,
                        )
                        .bind(row.value_id)
                        .bind(row.secret_id)
                        .bind(row.environment.as_str())
                        .bind(&row.ciphertext)
                        .bind(row.created_utc)
                        .bind(row.updated_utc)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| ServiceError::database("Failed to create secret value", e))?;
                    }
                }
            }

            let record = load_record(&mut tx, secret_id)
                .await?
                .ok_or_else(|| ServiceError::not_found("Secret"))?;

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;
            Ok(record)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_secret(&self, secret_id: Uuid) -> Result<u64, ServiceError> {
        self.bounded("delete_secret", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            let values = sqlx::query("DELETE FROM secret_values WHERE secret_id = $1")
                .bind(secret_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| ServiceError::database("Failed to delete secret values", e))?;

            let deleted = sqlx::query("DELETE FROM secrets WHERE secret_id = $1")
                .bind(secret_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| ServiceError::database("Failed to delete secret", e))?;
            if deleted.rows_affected() == 0 {
                return Err(ServiceError::not_found("Secret"));
            }

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;
            Ok(values.rows_affected())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn secret_history(&self, secret_id: Uuid) -> Result<Vec<ValueHistory>, ServiceError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| ServiceError::database("Failed to acquire connection", e))?;

        let record = load_record(&mut conn, secret_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Secret"))?;

        let value_ids: Vec<Uuid> = record.values.iter().map(|v| v.value_id).collect();
        let history = sqlx::query_as::<_, SecretValueHistory>(
            r#"
            SELECT history_id, value_id, ciphertext, changed_by, changed_utc
            FROM secret_value_history
            WHERE value_id = ANY($1)
            ORDER BY changed_utc DESC
            "#,
        )
        .bind(&value_ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ServiceError::database("Failed to get secret history", e))?;

        let mut by_value: HashMap<Uuid, Vec<SecretValueHistory>> = HashMap::new();
        for entry in history {
            by_value.entry(entry.value_id).or_default().push(entry);
        }

        Ok(record
            .values
            .into_iter()
            .map(|value| ValueHistory {
                history: by_value.remove(&value.value_id).unwrap_or_default(),
                value,
            })
            .collect())
    }

    // ==================== Audit Operations ====================

    #[instrument(skip(self, entry), fields(action = %entry.action))]
    async fn insert_audit_entry(&self, entry: &AuditLogEntry) -> Result<(), ServiceError> {
        sqlx::query(&format!(
            "INSERT INTO audit_logs ({AUDIT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(entry.audit_id)
        .bind(entry.user_id)
        .bind(entry.org_id)
        .bind(entry.project_id)
        .bind(entry.action.as_str())
        .bind(&entry.resource)
        .bind(&entry.description)
        .bind(&entry.metadata)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to write audit entry", e))?;
        Ok(())
    }

    #[instrument(skip(self, filter))]
    async fn query_audit_entries(
        &self,
        org_id: Uuid,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<AuditLogEntry>, i64), ServiceError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM audit_logs");
        push_audit_filter(&mut count, org_id, filter);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ServiceError::database("Failed to count audit entries", e))?;

        let mut page = QueryBuilder::<Postgres>::new(format!("SELECT {AUDIT_COLUMNS} FROM audit_logs"));
        push_audit_filter(&mut page, org_id, filter);
        page.push(" ORDER BY created_utc DESC, audit_id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let entries = page
            .build_query_as::<AuditLogEntry>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ServiceError::database("Failed to query audit entries", e))?;

        Ok((entries, total))
    }

    #[instrument(skip(self))]
    async fn audit_actions(&self, org_id: Uuid) -> Result<Vec<AuditAction>, ServiceError> {
        let codes: Vec<String> = sqlx::query_scalar(
            r#"SELECT DISTINCT action COLLATE "C" AS action FROM audit_logs WHERE org_id = $1 ORDER BY 1"#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ServiceError::database("Failed to list audit actions", e))?;

        Ok(codes.into_iter().filter_map(|c| c.parse().ok()).collect())
    }

    #[instrument(skip(self, filter))]
    async fn select_audit_entries(
        &self,
        org_id: Uuid,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditLogEntry>, ServiceError> {
        let mut query = QueryBuilder::<Postgres>::new(format!("SELECT {AUDIT_COLUMNS} FROM audit_logs"));
        push_audit_filter(&mut query, org_id, filter);
        query.push(" ORDER BY created_utc, audit_id");
        query
            .build_query_as::<AuditLogEntry>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ServiceError::database("Failed to select audit entries", e))
    }

    #[instrument(skip(self, audit_ids, record), fields(count = audit_ids.len()))]
    async fn purge_audit_entries(
        &self,
        org_id: Uuid,
        audit_ids: &[Uuid],
        record: &AuditLogEntry,
    ) -> Result<u64, ServiceError> {
        self.bounded("purge_audit_entries", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ServiceError::database("Failed to begin transaction", e))?;

            sqlx::query(&format!(
                "INSERT INTO audit_logs ({AUDIT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
            ))
            .bind(record.audit_id)
            .bind(record.user_id)
            .bind(record.org_id)
            .bind(record.project_id)
            .bind(record.action.as_str())
            .bind(&record.resource)
            .bind(&record.description)
            .bind(&record.metadata)
            .bind(&record.ip_address)
            .bind(&record.user_agent)
            .bind(record.created_utc)
            .execute(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to write purge record", e))?;

            let deleted = sqlx::query(
                "DELETE FROM audit_logs WHERE org_id = $1 AND audit_id = ANY($2) AND audit_id <> $3",
            )
            .bind(org_id)
            .bind(audit_ids)
            .bind(record.audit_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| ServiceError::database("Failed to purge audit entries", e))?;

            tx.commit()
                .await
                .map_err(|e| ServiceError::database("Failed to commit transaction", e))?;

            info!(org_id = %org_id, purged = deleted.rows_affected(), "Audit entries purged");
            Ok(deleted.rows_affected())
        })
        .await
    }
}
