//! Cold storage for audit entries removed by a purge.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::models::AuditLogEntry;

#[async_trait]
pub trait AuditArchive: Send + Sync {
    /// Durably persist `entries` and return an opaque id for the batch,
    /// unique within the org. Never a storage path.
    async fn archive(&self, org_id: Uuid, entries: &[AuditLogEntry]) -> anyhow::Result<String>;
}

/// One JSON-lines file per purge under `{root}/{org_id}/`.
pub struct FileAuditArchive {
    root: PathBuf,
}

impl FileAuditArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl AuditArchive for FileAuditArchive {
    async fn archive(&self, org_id: Uuid, entries: &[AuditLogEntry]) -> anyhow::Result<String> {
        let dir = self.root.join(org_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create archive directory {}", dir.display()))?;

        let mut body = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut body, entry).context("Failed to serialize audit entry")?;
            body.push(b'\n');
        }

        let name = format!(
            "audit-{}-{}.jsonl",
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            Uuid::new_v4()
        );
        let path = dir.join(&name);

        let mut file = fs::File::create(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        file.write_all(&body).await.context("Failed to write audit archive")?;
        file.sync_all().await.context("Failed to sync audit archive")?;

        info!(org_id = %org_id, path = %path.display(), "Archived audit entries");
        Ok(name)
    }
}

/// Keeps archived batches in memory; can be told to fail.
#[derive(Default)]
pub struct MemoryArchive {
    batches: Mutex<Vec<(Uuid, Vec<AuditLogEntry>)>>,
    fail: AtomicBool,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<(Uuid, Vec<AuditLogEntry>)> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditArchive for MemoryArchive {
    async fn archive(&self, org_id: Uuid, entries: &[AuditLogEntry]) -> anyhow::Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("archive storage unavailable");
        }
        let mut batches = self
            .batches
            .lock()
            .map_err(|_| anyhow::anyhow!("archive lock poisoned"))?;
        batches.push((org_id, entries.to_vec()));
        Ok(format!("batch-{}", batches.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditAction;
    use serde_json::json;

    fn entry(org_id: Uuid) -> AuditLogEntry {
        AuditLogEntry {
            audit_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            org_id: Some(org_id),
            project_id: None,
            action: AuditAction::CreateSecret,
            resource: "secret".to_string(),
            description: "Created secret API_KEY".to_string(),
            metadata: json!({}),
            ip_address: "unknown".to_string(),
            user_agent: "unknown".to_string(),
            created_utc: Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_archive_writes_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FileAuditArchive::new(dir.path());
        let org_id = Uuid::new_v4();
        let entries = vec![entry(org_id), entry(org_id)];

        let name = archive.archive(org_id, &entries).await.unwrap();
        assert!(name.starts_with("audit-") && name.ends_with(".jsonl"));
        assert!(!name.contains('/'));

        let path = dir.path().join(org_id.to_string()).join(&name);
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditLogEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, entries[0]);
    }

    #[tokio::test]
    async fn memory_archive_can_fail() {
        let archive = MemoryArchive::new();
        archive.set_failing(true);
        assert!(archive.archive(Uuid::new_v4(), &[]).await.is_err());
        assert!(archive.batches().is_empty());
    }
}
