//! Read-through cache over the store.
//!
//! The backend is an optimization only: a miss, an unreachable backend or an
//! undecodable entry all fall through to the store, and failures are logged
//! and counted but never returned.

use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::error::ServiceError;
use super::redis::CacheBackend;
use crate::config::CacheConfig;
use crate::models::AuditFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Short,
    Long,
}

#[derive(Clone)]
pub struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    fn seconds(&self, ttl: Ttl) -> u64 {
        match ttl {
            Ttl::Short => self.config.ttl_short_seconds,
            Ttl::Long => self.config.ttl_long_seconds,
        }
    }

    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Ttl,
        compute: F,
    ) -> Result<T, ServiceError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        match self.backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    counter!("vault_cache_events_total", "event" => "hit").increment(1);
                    return Ok(value);
                }
                Err(e) => {
                    warn!(key, error = %e, "Discarding undecodable cache entry");
                    counter!("vault_cache_events_total", "event" => "error").increment(1);
                }
            },
            Ok(None) => {
                counter!("vault_cache_events_total", "event" => "miss").increment(1);
            }
            Err(e) => {
                warn!(key, error = %e, "Cache unavailable, reading through");
                counter!("vault_cache_events_total", "event" => "error").increment(1);
            }
        }

        let value = compute().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                if let Err(e) = self.backend.set(key, &raw, self.seconds(ttl)).await {
                    warn!(key, error = %e, "Failed to populate cache");
                    counter!("vault_cache_events_total", "event" => "error").increment(1);
                }
            }
            Err(e) => warn!(key, error = %e, "Failed to serialize cache entry"),
        }

        Ok(value)
    }

    pub async fn invalidate(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        if let Err(e) = self.backend.delete(keys).await {
            warn!(keys = ?keys, error = %e, "Failed to invalidate cache keys");
            counter!("vault_cache_events_total", "event" => "error").increment(1);
        }
    }

    pub async fn invalidate_prefix(&self, prefix: &str) {
        if let Err(e) = self.backend.delete_prefix(prefix).await {
            warn!(prefix, error = %e, "Failed to invalidate cache prefix");
            counter!("vault_cache_events_total", "event" => "error").increment(1);
        }
    }
}

// ==================== Keys ====================

/// The user's org switcher list.
pub fn user_orgs_key(user_id: Uuid) -> String {
    format!("user:data:{}", user_id)
}

pub fn user_projects_key(user_id: Uuid) -> String {
    format!("user:projects:{}", user_id)
}

/// Org details as seen by one member.
pub fn org_data_key(org_id: Uuid, user_id: Uuid) -> String {
    format!("{}{}", org_data_prefix(org_id), user_id)
}

pub fn org_data_prefix(org_id: Uuid) -> String {
    format!("org:data:{}:", org_id)
}

/// Encrypted secret list of a project. Never holds plaintext.
pub fn project_secrets_key(project_id: Uuid) -> String {
    format!("project:secrets:{}", project_id)
}

pub fn audit_prefix(org_id: Uuid) -> String {
    format!("org:audit:{}:", org_id)
}

pub fn audit_page_key(org_id: Uuid, page: u32, limit: u32, filter: &AuditFilter) -> String {
    let canonical = serde_json::to_vec(filter).unwrap_or_default();
    let digest = hex::encode(Sha256::digest(&canonical));
    format!("{}p{}:l{}:{}", audit_prefix(org_id), page, limit, digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditAction;
    use crate::services::redis::MockCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn layer() -> (CacheLayer, Arc<MockCache>) {
        let backend = Arc::new(MockCache::new());
        (
            CacheLayer::new(backend.clone(), CacheConfig::default()),
            backend,
        )
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let (cache, _) = layer();
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let counter = &calls;
            let value: Vec<u32> = cache
                .get_or_compute("k", Ttl::Short, move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![1, 2, 3])
                })
                .await
                .unwrap();
            assert_eq!(value, vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_after_invalidate_sees_new_state() {
        let (cache, _) = layer();
        let _: u32 = cache
            .get_or_compute("k", Ttl::Short, || async { Ok(1) })
            .await
            .unwrap();

        cache.invalidate(&["k".to_string()]).await;

        let value: u32 = cache
            .get_or_compute("k", Ttl::Short, || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn unavailable_backend_falls_through() {
        let (cache, backend) = layer();
        backend.set_unavailable(true);

        let value: String = cache
            .get_or_compute("k", Ttl::Long, || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fresh");

        cache.invalidate(&["k".to_string()]).await;
        cache.invalidate_prefix("org:").await;
    }

    #[tokio::test]
    async fn compute_errors_are_not_cached() {
        let (cache, backend) = layer();
        let result: Result<u32, _> = cache
            .get_or_compute("k", Ttl::Short, || async {
                Err(ServiceError::not_found("Thing"))
            })
            .await;
        assert!(result.is_err());
        assert!(!backend.contains("k"));
    }

    #[test]
    fn audit_keys_differ_by_filter_and_share_org_prefix() {
        let org = Uuid::new_v4();
        let all = audit_page_key(org, 1, 20, &AuditFilter::default());
        let filtered = audit_page_key(
            org,
            1,
            20,
            &AuditFilter {
                action: Some(AuditAction::UpdateSecret),
                ..Default::default()
            },
        );
        assert_ne!(all, filtered);
        assert!(all.starts_with(&audit_prefix(org)));
        assert!(filtered.starts_with(&audit_prefix(org)));
        assert_eq!(all, audit_page_key(org, 1, 20, &AuditFilter::default()));
    }
}
