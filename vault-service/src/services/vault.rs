//! Secret CRUD with encryption and authorization applied on every path.
//!
//! Storage and cache only ever see ciphertext; plaintext exists in
//! [`SecretView`]s built per request.

use metrics::counter;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, instrument};
use uuid::Uuid;

use super::audit::{AuditEvent, RequestContext};
use super::cache::{self, Ttl};
use super::crypto::CryptoEngine;
use super::error::ServiceError;
use super::rate_limit::OperationClass;
use super::store::SecretChanges;
use super::ServiceContext;
use crate::dtos::secret::{
    CreateSecretRequest, DeleteSecretResponse, SecretValueInput, UpdateSecretRequest,
};
use crate::models::{
    AuditAction, EncryptedValue, Environment, HistoryEntryView, Role, Scope, Secret,
    SecretHistoryView, SecretRecord, SecretValue, SecretValueView, SecretView, ValueHistoryView,
};

const KEY_MAX: usize = 50;
const DESCRIPTION_MAX: usize = 255;
const VALUE_MAX: usize = 1000;

/// Upper-case, with every run outside `[A-Z0-9]` collapsed into one `_`.
pub fn normalize_key(raw: &str) -> Result<String, ServiceError> {
    let mut key = String::with_capacity(raw.len());
    for c in raw.trim().chars().flat_map(char::to_uppercase) {
        if c.is_ascii_uppercase() || c.is_ascii_digit() {
            key.push(c);
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }
    let key = key.trim_matches('_').to_string();

    if key.is_empty() || key.len() > KEY_MAX {
        return Err(ServiceError::invalid(
            "key",
            format!("Key must be between 1 and {} characters after normalization", KEY_MAX),
        ));
    }
    Ok(key)
}

fn normalize_description(raw: Option<String>) -> Result<Option<String>, ServiceError> {
    let description = raw.map(|d| d.trim().to_string()).filter(|d| !d.is_empty());
    if description
        .as_ref()
        .is_some_and(|d| d.chars().count() > DESCRIPTION_MAX)
    {
        return Err(ServiceError::invalid(
            "description",
            format!("Description must be at most {} characters", DESCRIPTION_MAX),
        ));
    }
    Ok(description)
}

/// Parse one value entry, explaining what is wrong with it.
fn parse_value(input: &SecretValueInput) -> Result<(Environment, &str), String> {
    let environment = input
        .environment
        .as_deref()
        .ok_or_else(|| "environment is required".to_string())?
        .trim()
        .to_uppercase()
        .parse::<Environment>()
        .map_err(|e| e.to_string())?;
    let value = input
        .value
        .as_deref()
        .ok_or_else(|| format!("value for {} is required", environment))?;
    let length = value.chars().count();
    if length == 0 || length > VALUE_MAX {
        return Err(format!(
            "value for {} must be between 1 and {} characters",
            environment, VALUE_MAX
        ));
    }
    Ok((environment, value))
}

fn environments(values: &[EncryptedValue]) -> Vec<&'static str> {
    values.iter().map(|v| v.environment.as_str()).collect()
}

#[derive(Clone)]
pub struct SecretVault {
    ctx: ServiceContext,
    crypto: Arc<CryptoEngine>,
}

impl SecretVault {
    pub fn new(ctx: ServiceContext, crypto: Arc<CryptoEngine>) -> Self {
        Self { ctx, crypto }
    }

    #[instrument(skip(self, request, rctx), fields(user_id = %actor, project_id = %project_id))]
    pub async fn create_secret(
        &self,
        actor: Uuid,
        project_id: Uuid,
        request: CreateSecretRequest,
        rctx: &RequestContext,
    ) -> Result<SecretView, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::SecretWrite)?;
        self.ctx
            .authz
            .require_role(actor, Scope::Project(project_id), Role::MANAGERS)
            .await?;

        let key = normalize_key(&request.key)?;
        let description = normalize_description(request.description)?;

        let mut seen = HashSet::new();
        let mut values = Vec::with_capacity(request.values.len());
        for input in &request.values {
            let (environment, plaintext) =
                parse_value(input).map_err(|msg| ServiceError::invalid("values", msg))?;
            if !seen.insert(environment) {
                return Err(ServiceError::invalid(
                    "values",
                    format!("Duplicate value for {}", environment),
                ));
            }
            values.push(EncryptedValue {
                environment,
                ciphertext: self.crypto.encrypt(plaintext)?,
            });
        }

        let secret = Secret::new(project_id, key, description);
        let record = self.ctx.store.create_secret(&secret, &values).await?;

        self.ctx.refresh_project(project_id, &[actor]).await;
        self.record_audit(
            actor,
            project_id,
            AuditEvent::new(
                AuditAction::CreateSecret,
                "secret",
                format!("Created secret {}", record.secret.key),
            )
            .metadata(json!({
                "secret_id": record.secret.secret_id,
                "key": record.secret.key,
                "environments": environments(&values),
            })),
            rctx,
        )
        .await;

        counter!("vault_secret_operations_total", "operation" => "create").increment(1);
        self.reveal(record)
    }

    /// Every secret of the project, ordered by key, decrypted.
    #[instrument(skip(self), fields(user_id = %actor, project_id = %project_id))]
    pub async fn list_secrets(
        &self,
        actor: Uuid,
        project_id: Uuid,
    ) -> Result<Vec<SecretView>, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::SecretRead)?;
        self.ctx
            .authz
            .require_member(actor, Scope::Project(project_id))
            .await?;

        let store = self.ctx.store.clone();
        let records: Vec<SecretRecord> = self
            .ctx
            .cache
            .get_or_compute(
                &cache::project_secrets_key(project_id),
                Ttl::Short,
                move || async move { store.list_secrets(project_id).await },
            )
            .await?;

        counter!("vault_secret_operations_total", "operation" => "list").increment(1);
        records.into_iter().map(|r| self.reveal(r)).collect()
    }

    /// Upsert values per environment. Malformed entries are skipped; an empty
    /// description clears it.
    #[instrument(skip(self, request, rctx), fields(user_id = %actor, project_id = %project_id, secret_id = %secret_id))]
    pub async fn update_secret(
        &self,
        actor: Uuid,
        project_id: Uuid,
        secret_id: Uuid,
        request: UpdateSecretRequest,
        rctx: &RequestContext,
    ) -> Result<SecretView, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::SecretWrite)?;
        self.ctx
            .authz
            .require_role(actor, Scope::Project(project_id), Role::MANAGERS)
            .await?;
        let secret = self.load_in_project(project_id, secret_id).await?;

        let description = match request.description {
            Some(raw) => Some(normalize_description(Some(raw))?),
            None => None,
        };

        let mut seen = HashSet::new();
        let mut values = Vec::new();
        for input in &request.values {
            match parse_value(input) {
                Ok((environment, plaintext)) if seen.insert(environment) => {
                    values.push(EncryptedValue {
                        environment,
                        ciphertext: self.crypto.encrypt(plaintext)?,
                    });
                }
                Ok((environment, _)) => {
                    tracing::debug!(environment = %environment, "Skipping duplicate value entry");
                }
                Err(reason) => {
                    tracing::debug!(reason = %reason, "Skipping malformed value entry");
                }
            }
        }

        let changes = SecretChanges {
            description: description.clone(),
            values,
        };
        let record = self
            .ctx
            .store
            .update_secret(secret_id, &changes, actor)
            .await?;

        self.ctx.refresh_project(project_id, &[actor]).await;
        self.record_audit(
            actor,
            project_id,
            AuditEvent::new(
                AuditAction::UpdateSecret,
                "secret",
                format!("Updated secret {}", secret.key),
            )
            .metadata(json!({
                "secret_id": secret_id,
                "key": secret.key,
                "environments": environments(&changes.values),
                "description_changed": description.is_some(),
            })),
            rctx,
        )
        .await;

        counter!("vault_secret_operations_total", "operation" => "update").increment(1);
        self.reveal(record)
    }

    #[instrument(skip(self, rctx), fields(user_id = %actor, project_id = %project_id, secret_id = %secret_id))]
    pub async fn delete_secret(
        &self,
        actor: Uuid,
        project_id: Uuid,
        secret_id: Uuid,
        rctx: &RequestContext,
    ) -> Result<DeleteSecretResponse, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::SecretWrite)?;
        self.ctx
            .authz
            .require_role(actor, Scope::Project(project_id), Role::MANAGERS)
            .await?;
        let secret = self.load_in_project(project_id, secret_id).await?;

        let values_removed = self.ctx.store.delete_secret(secret_id).await?;

        self.ctx.refresh_project(project_id, &[actor]).await;
        self.record_audit(
            actor,
            project_id,
            AuditEvent::new(
                AuditAction::DeleteSecret,
                "secret",
                format!("Deleted secret {}", secret.key),
            )
            .metadata(json!({
                "secret_id": secret_id,
                "key": secret.key,
                "values_removed": values_removed,
            })),
            rctx,
        )
        .await;

        counter!("vault_secret_operations_total", "operation" => "delete").increment(1);
        Ok(DeleteSecretResponse {
            secret_id,
            values_removed,
        })
    }

    /// Current values with their superseded values, newest first, decrypted.
    #[instrument(skip(self), fields(user_id = %actor, project_id = %project_id, secret_id = %secret_id))]
    pub async fn secret_history(
        &self,
        actor: Uuid,
        project_id: Uuid,
        secret_id: Uuid,
    ) -> Result<SecretHistoryView, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::History)?;
        self.ctx
            .authz
            .require_member(actor, Scope::Project(project_id))
            .await?;
        let secret = self.load_in_project(project_id, secret_id).await?;

        let mut environments = Vec::new();
        for entry in self.ctx.store.secret_history(secret_id).await? {
            let current = self.open(&entry.value)?;
            let history = entry
                .history
                .iter()
                .map(|h| {
                    Ok(HistoryEntryView {
                        history_id: h.history_id,
                        value: self.open_raw(secret_id, entry.value.environment, &h.ciphertext)?,
                        changed_by: h.changed_by,
                        changed_utc: h.changed_utc,
                    })
                })
                .collect::<Result<Vec<_>, ServiceError>>()?;
            environments.push(ValueHistoryView {
                environment: entry.value.environment,
                current,
                updated_utc: entry.value.updated_utc,
                history,
            });
        }
        environments.sort_by_key(|e| e.environment.as_str());

        counter!("vault_secret_operations_total", "operation" => "history").increment(1);
        Ok(SecretHistoryView {
            secret_id,
            key: secret.key,
            environments,
        })
    }

    async fn load_in_project(&self, project_id: Uuid, secret_id: Uuid) -> Result<Secret, ServiceError> {
        let secret = self
            .ctx
            .store
            .find_secret(secret_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Secret"))?;
        if secret.project_id != project_id {
            tracing::warn!(
                secret_id = %secret_id,
                project_id = %project_id,
                owning_project_id = %secret.project_id,
                "Secret requested through a project it does not belong to"
            );
            return Err(ServiceError::ScopeMismatch {
                entity: "secret",
                id: secret_id,
                scope: format!("project {}", project_id),
            });
        }
        Ok(secret)
    }

    async fn record_audit(
        &self,
        actor: Uuid,
        project_id: Uuid,
        event: AuditEvent,
        rctx: &RequestContext,
    ) {
        let event = match self.ctx.audit_scope(Scope::Project(project_id)).await {
            Ok((org_id, _)) => event.org(org_id).project(project_id),
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "Could not resolve org for audit entry");
                event.project(project_id)
            }
        };
        self.ctx.audit.record(actor, event, rctx).await;
    }

    fn reveal(&self, record: SecretRecord) -> Result<SecretView, ServiceError> {
        let mut values = record
            .values
            .iter()
            .map(|v| {
                Ok(SecretValueView {
                    value_id: v.value_id,
                    environment: v.environment,
                    value: self.open(v)?,
                    created_utc: v.created_utc,
                    updated_utc: v.updated_utc,
                })
            })
            .collect::<Result<Vec<_>, ServiceError>>()?;
        values.sort_by_key(|v| v.environment.as_str());

        let secret = record.secret;
        Ok(SecretView {
            secret_id: secret.secret_id,
            project_id: secret.project_id,
            key: secret.key,
            description: secret.description,
            created_utc: secret.created_utc,
            updated_utc: secret.updated_utc,
            values,
        })
    }

    fn open(&self, value: &SecretValue) -> Result<String, ServiceError> {
        self.open_raw(value.secret_id, value.environment, &value.ciphertext)
    }

    fn open_raw(
        &self,
        secret_id: Uuid,
        environment: Environment,
        ciphertext: &str,
    ) -> Result<String, ServiceError> {
        self.crypto.decrypt(ciphertext).map_err(|e| {
            error!(
                secret_id = %secret_id,
                environment = %environment,
                error = %e,
                "Stored secret value failed decryption"
            );
            e
        })
    }
}
