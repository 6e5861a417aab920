//! Persistence Store (C4): a single JSON document recording which queues
//! were being consumed, so the engine can restore state across restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use consumer_common::{BusinessHours, PersistedConsumerConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::info;

const DOCUMENT_VERSION: &str = "1.0.0";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("backup file not found")]
    NoBackup,

    #[error("restore document malformed: {0}")]
    Malformed(String),
}

/// The durable subset of a consumer configuration, as recorded in the
/// persistence document: `{queue, webhook_url, min_interval_ms,
/// max_interval_ms, business_hours, saved_at}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedQueueEntry {
    pub queue: String,
    pub webhook_url: String,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub business_hours: BusinessHours,
    pub saved_at: DateTime<Utc>,
}

impl PersistedQueueEntry {
    pub fn new(queue: impl Into<String>, config: PersistedConsumerConfig) -> Self {
        Self {
            queue: queue.into(),
            webhook_url: config.webhook_url,
            min_interval_ms: config.min_interval_ms,
            max_interval_ms: config.max_interval_ms,
            business_hours: config.business_hours,
            saved_at: config.saved_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceDocument {
    pub version: String,
    pub last_updated: String,
    pub queues: HashMap<String, PersistedQueueEntry>,
}

impl Default for PersistenceDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION.to_string(),
            last_updated: String::new(),
            queues: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PersistenceStats {
    pub queue_count: usize,
    pub last_updated: String,
}

/// Owns the on-disk document. All mutations go through `save`, which rewrites
/// the whole document atomically via a sibling temp file and rename.
pub struct PersistenceStore {
    path: PathBuf,
}

impl PersistenceStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    async fn ensure_parent_dir(&self) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    async fn read_document(&self) -> Result<PersistenceDocument, PersistenceError> {
        match fs::read(&self.path).await {
            Ok(bytes) => {
                if bytes.is_empty() {
                    Ok(PersistenceDocument::default())
                } else {
                    Ok(serde_json::from_slice(&bytes)?)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistenceDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_document(&self, doc: &PersistenceDocument) -> Result<(), PersistenceError> {
        self.ensure_parent_dir().await?;
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, &bytes).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone();
        let file_name = tmp
            .file_name()
            .map(|n| format!("{}.tmp", n.to_string_lossy()))
            .unwrap_or_else(|| "consumer-engine-state.json.tmp".to_string());
        tmp.set_file_name(file_name);
        tmp
    }

    pub async fn save(&self, entry: PersistedQueueEntry) -> Result<(), PersistenceError> {
        let mut doc = self.read_document().await?;
        doc.queues.insert(entry.queue.clone(), entry);
        doc.last_updated = now_rfc3339();
        self.write_document(&doc).await
    }

    pub async fn remove(&self, queue: &str) -> Result<(), PersistenceError> {
        let mut doc = self.read_document().await?;
        if doc.queues.remove(queue).is_some() {
            doc.last_updated = now_rfc3339();
            self.write_document(&doc).await?;
        }
        Ok(())
    }

    pub async fn load(&self, queue: &str) -> Result<Option<PersistedQueueEntry>, PersistenceError> {
        let doc = self.read_document().await?;
        Ok(doc.queues.get(queue).cloned())
    }

    pub async fn load_all(&self) -> Result<Vec<PersistedQueueEntry>, PersistenceError> {
        let doc = self.read_document().await?;
        Ok(doc.queues.into_values().collect())
    }

    pub async fn has(&self, queue: &str) -> Result<bool, PersistenceError> {
        let doc = self.read_document().await?;
        Ok(doc.queues.contains_key(queue))
    }

    pub async fn clear(&self) -> Result<(), PersistenceError> {
        self.write_document(&PersistenceDocument::default()).await
    }

    pub async fn stats(&self) -> Result<PersistenceStats, PersistenceError> {
        let doc = self.read_document().await?;
        Ok(PersistenceStats {
            queue_count: doc.queues.len(),
            last_updated: doc.last_updated,
        })
    }

    /// Default sibling backup path, `<store>.backup.<epoch_secs>.json`.
    pub fn default_backup_path(&self) -> PathBuf {
        let epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut backup = self.path.clone();
        let file_name = backup
            .file_name()
            .map(|n| format!("{}.backup.{epoch}.json", n.to_string_lossy()))
            .unwrap_or_else(|| format!("consumer-engine-state.backup.{epoch}.json"));
        backup.set_file_name(file_name);
        backup
    }

    /// Writes the current document to `to`, or to [`Self::default_backup_path`]
    /// if no path is supplied. Returns the path actually written.
    pub async fn backup(&self, to: Option<PathBuf>) -> Result<PathBuf, PersistenceError> {
        let dest = to.unwrap_or_else(|| self.default_backup_path());
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let doc = self.read_document().await?;
        let bytes = serde_json::to_vec_pretty(&doc)?;
        fs::write(&dest, bytes).await?;
        Ok(dest)
    }

    /// Overwrites the live document with the contents of `from`, validating
    /// the top-level `queues` map shape first. Returns the restored queue
    /// names, sorted.
    pub async fn restore(&self, from: &Path) -> Result<Vec<String>, PersistenceError> {
        let bytes = match fs::read(from).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(PersistenceError::NoBackup),
            Err(e) => return Err(e.into()),
        };

        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        if !value.get("queues").map(|q| q.is_object()).unwrap_or(false) {
            return Err(PersistenceError::Malformed("\"queues\" must be an object".to_string()));
        }

        let doc: PersistenceDocument = serde_json::from_value(value)?;
        let mut names: Vec<String> = doc.queues.keys().cloned().collect();
        names.sort();
        self.write_document(&doc).await?;
        info!(path = %from.display(), "persistence store restored from backup");
        Ok(names)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entry(queue: &str) -> PersistedQueueEntry {
        PersistedQueueEntry {
            queue: queue.to_string(),
            webhook_url: "https://example.com/hook".to_string(),
            min_interval_ms: 1000,
            max_interval_ms: 2000,
            business_hours: BusinessHours::default(),
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("state.json"));

        store.save(sample_entry("orders")).await.unwrap();
        let loaded = store.load("orders").await.unwrap();

        assert_eq!(loaded.unwrap().queue, "orders");
    }

    #[tokio::test]
    async fn load_missing_file_returns_default() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("missing.json"));

        let loaded = store.load("orders").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("state.json"));

        store.save(sample_entry("orders")).await.unwrap();
        store.remove("orders").await.unwrap();

        assert!(!store.has("orders").await.unwrap());
    }

    #[tokio::test]
    async fn load_all_returns_every_entry() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("state.json"));

        store.save(sample_entry("orders")).await.unwrap();
        store.save(sample_entry("invoices")).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn backup_and_restore_round_trip() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("state.json"));

        store.save(sample_entry("orders")).await.unwrap();
        let backup_path = store.backup(None).await.unwrap();
        store.remove("orders").await.unwrap();
        assert!(!store.has("orders").await.unwrap());

        let restored = store.restore(&backup_path).await.unwrap();
        assert_eq!(restored, vec!["orders".to_string()]);
        assert!(store.has("orders").await.unwrap());
    }

    #[tokio::test]
    async fn restore_without_backup_fails() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("state.json"));

        let result = store.restore(&dir.path().join("missing-backup.json")).await;
        assert!(matches!(result, Err(PersistenceError::NoBackup)));
    }

    #[tokio::test]
    async fn clear_empties_the_document() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("state.json"));

        store.save(sample_entry("orders")).await.unwrap();
        store.clear().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queue_count, 0);
    }
}
