//! Best-effort writer for the append-only audit trail.

use axum::http::{header::USER_AGENT, HeaderMap};
use chrono::Utc;
use metrics::counter;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use super::cache::{audit_prefix, CacheLayer};
use super::store::VaultStore;
use crate::models::{AuditAction, AuditLogEntry};

const UNKNOWN: &str = "unknown";
const MAX_USER_AGENT_CHARS: usize = 512;

/// Who is calling and from where, recorded on every audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub ip_address: String,
    pub user_agent: String,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn unknown() -> Self {
        Self {
            ip_address: UNKNOWN.to_string(),
            user_agent: UNKNOWN.to_string(),
            request_id: None,
        }
    }

    /// IP is the first `X-Forwarded-For` entry when it parses as an address,
    /// else the peer address.
    pub fn from_parts(
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        request_id: Option<String>,
    ) -> Self {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .and_then(|s| s.trim().parse::<IpAddr>().ok());

        let ip_address = forwarded
            .or_else(|| peer.map(|addr| addr.ip()))
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string());

        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| clamp(s, MAX_USER_AGENT_CHARS))
            .unwrap_or_else(|| UNKNOWN.to_string());

        Self {
            ip_address,
            user_agent,
            request_id,
        }
    }
}

fn clamp(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((end, _)) => value[..end].to_string(),
        None => value.to_string(),
    }
}

/// What happened, before it is stamped with actor and request context.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub resource: String,
    pub description: String,
    pub org_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub metadata: Value,
}

impl AuditEvent {
    pub fn new(action: AuditAction, resource: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            action,
            resource: resource.into(),
            description: description.into(),
            org_id: None,
            project_id: None,
            metadata: json!({}),
        }
    }

    pub fn org(mut self, org_id: Uuid) -> Self {
        self.org_id = Some(org_id);
        self
    }

    pub fn project(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Clone)]
pub struct AuditWriter {
    store: Arc<dyn VaultStore>,
    cache: CacheLayer,
}

impl AuditWriter {
    pub fn new(store: Arc<dyn VaultStore>, cache: CacheLayer) -> Self {
        Self { store, cache }
    }

    /// Build the stored entry for `event`. Used directly by callers that must
    /// persist the entry inside their own transaction.
    pub fn entry(&self, actor: Uuid, event: AuditEvent, ctx: &RequestContext) -> AuditLogEntry {
        let mut metadata = match event.metadata {
            Value::Object(map) => Value::Object(map),
            Value::Null => json!({}),
            other => json!({ "value": other }),
        };
        if let (Some(request_id), Value::Object(map)) = (&ctx.request_id, &mut metadata) {
            map.insert("request_id".to_string(), Value::String(request_id.clone()));
        }

        AuditLogEntry {
            audit_id: Uuid::new_v4(),
            user_id: actor,
            org_id: event.org_id,
            project_id: event.project_id,
            action: event.action,
            resource: event.resource,
            description: event.description,
            metadata,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            created_utc: Utc::now(),
        }
    }

    /// Append one entry. Failures are logged and counted; the calling
    /// operation has already committed and is not failed.
    pub async fn record(&self, actor: Uuid, event: AuditEvent, ctx: &RequestContext) {
        let entry = self.entry(actor, event, ctx);

        match self.store.insert_audit_entry(&entry).await {
            Ok(()) => {
                debug!(action = %entry.action, user_id = %actor, "Audit entry recorded");
                if let Some(org_id) = entry.org_id {
                    self.cache.invalidate_prefix(&audit_prefix(org_id)).await;
                }
            }
            Err(e) => {
                error!(
                    action = %entry.action,
                    user_id = %actor,
                    org_id = ?entry.org_id,
                    error = %e,
                    "Failed to write audit entry"
                );
                counter!("vault_audit_write_failures_total").increment(1);
            }
        }
    }
}
