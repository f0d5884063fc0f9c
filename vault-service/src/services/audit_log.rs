//! Audit trail listing and archive-then-delete purges.

use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::archive::AuditArchive;
use super::audit::{AuditEvent, RequestContext};
use super::cache::{audit_page_key, audit_prefix, Ttl};
use super::error::ServiceError;
use super::rate_limit::OperationClass;
use super::ServiceContext;
use crate::dtos::audit::{
    AuditLogQuery, PurgeAuditLogsRequest, PurgeAuditLogsResponse, DEFAULT_AUDIT_PAGE_SIZE,
    MAX_AUDIT_PAGE_SIZE,
};
use crate::models::{AuditAction, AuditFilter, AuditPage, Pagination, Role, Scope};

#[derive(Clone)]
pub struct AuditLogService {
    ctx: ServiceContext,
    archive: Arc<dyn AuditArchive>,
}

fn parse_action(raw: Option<&str>) -> Result<Option<AuditAction>, ServiceError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(code) => code
            .parse::<AuditAction>()
            .map(Some)
            .map_err(|e| ServiceError::invalid("action", e.to_string())),
        None => Ok(None),
    }
}

impl AuditLogService {
    pub fn new(ctx: ServiceContext, archive: Arc<dyn AuditArchive>) -> Self {
        Self { ctx, archive }
    }

    /// Newest-first page of an org's audit trail.
    #[instrument(skip(self, query), fields(user_id = %actor, org_id = %org_id))]
    pub async fn list_audit_logs(
        &self,
        actor: Uuid,
        org_id: Uuid,
        query: AuditLogQuery,
    ) -> Result<AuditPage, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Audit)?;
        self.ctx
            .authz
            .require_role(actor, Scope::Org(org_id), Role::MANAGERS)
            .await?;

        let page = query.page.unwrap_or(1);
        if page < 1 {
            return Err(ServiceError::invalid("page", "Page must be at least 1"));
        }
        let limit = query.limit.unwrap_or(DEFAULT_AUDIT_PAGE_SIZE);
        if !(1..=MAX_AUDIT_PAGE_SIZE).contains(&limit) {
            return Err(ServiceError::invalid(
                "limit",
                format!("Limit must be between 1 and {}", MAX_AUDIT_PAGE_SIZE),
            ));
        }
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(ServiceError::invalid("from", "'from' must not be after 'to'"));
            }
        }

        let filter = AuditFilter {
            project_id: query.project_id,
            user_id: query.user_id,
            action: parse_action(query.action.as_deref())?,
            from: query.from,
            to: query.to,
            before: None,
        };

        let key = audit_page_key(org_id, page, limit, &filter);
        let store = self.ctx.store.clone();
        self.ctx
            .cache
            .get_or_compute(&key, Ttl::Short, move || async move {
                let offset = i64::from(page - 1) * i64::from(limit);
                let (entries, total) = store
                    .query_audit_entries(org_id, &filter, i64::from(limit), offset)
                    .await?;
                let actions = store.audit_actions(org_id).await?;
                Ok(AuditPage {
                    entries,
                    pagination: Pagination::new(page, limit, total),
                    actions,
                })
            })
            .await
    }

    /// Archive the matching entries, then delete them together with a
    /// `PURGE.AUDIT_LOG` record. Archive or audit failure aborts the purge.
    #[instrument(skip(self, request, rctx), fields(user_id = %actor, org_id = %org_id))]
    pub async fn purge_audit_logs(
        &self,
        actor: Uuid,
        org_id: Uuid,
        request: PurgeAuditLogsRequest,
        rctx: &RequestContext,
    ) -> Result<PurgeAuditLogsResponse, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Audit)?;
        self.ctx
            .authz
            .require_role(actor, Scope::Org(org_id), Role::OWNER_ONLY)
            .await?;

        let filter = AuditFilter {
            project_id: request.project_id,
            user_id: request.user_id,
            action: parse_action(request.action.as_deref())?,
            before: request.older_than,
            ..AuditFilter::default()
        };
        if filter == AuditFilter::default() {
            return Err(ServiceError::invalid(
                "older_than",
                "At least one of older_than, user_id, project_id or action is required",
            ));
        }

        let matched = self.ctx.store.select_audit_entries(org_id, &filter).await?;
        if matched.is_empty() {
            return Ok(PurgeAuditLogsResponse {
                purged: 0,
                archive: None,
            });
        }

        let archive_id = self
            .archive
            .archive(org_id, &matched)
            .await
            .map_err(|e| ServiceError::Internal(e.context("Audit archive failed; purge aborted")))?;

        let record = self.ctx.audit.entry(
            actor,
            AuditEvent::new(
                AuditAction::PurgeAuditLog,
                "audit_log",
                format!("Purged {} audit log entries", matched.len()),
            )
            .org(org_id)
            .metadata(json!({
                "count": matched.len(),
                "filter": filter,
                "archive": archive_id,
            })),
            rctx,
        );

        let ids: Vec<Uuid> = matched.iter().map(|e| e.audit_id).collect();
        let purged = self
            .ctx
            .store
            .purge_audit_entries(org_id, &ids, &record)
            .await?;

        self.ctx.cache.invalidate_prefix(&audit_prefix(org_id)).await;
        info!(purged, archive = %archive_id, "Purged audit log entries");

        Ok(PurgeAuditLogsResponse {
            purged,
            archive: Some(archive_id),
        })
    }
}
