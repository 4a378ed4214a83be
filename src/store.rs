//! ==============================================================================
//! store.rs - durable message log
//! ==============================================================================
//!
//! purpose:
//!     every inbound message is appended here, accepted or not, so the raw
//!     stream can be inspected or replayed later.
//!
//! format:
//!     one json object per line: {timestamp, device_id, topic, message}
//!
//! relationships:
//!     - used by: runtime.rs (store), api.rs (query), main.rs (daily purge)
//!
//! ==============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub timestamp: DateTime<Utc>,
    /// device identity key, absent for unknown or unparseable payloads
    pub device_id: Option<String>,
    pub topic: String,
    pub message: String,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn store(&self, message: StoredMessage) -> Result<()>;

    /// messages for one device with `since <= timestamp <= until`, oldest first
    async fn query(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>>;

    /// every message with `since <= timestamp <= until`, oldest first
    async fn range(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<StoredMessage>>;

    /// returns how many messages were dropped
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

fn in_window(m: &StoredMessage, device_id: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> bool {
    m.device_id.as_deref() == Some(device_id) && in_range(m, since, until)
}

fn in_range(m: &StoredMessage, since: DateTime<Utc>, until: DateTime<Utc>) -> bool {
    m.timestamp >= since && m.timestamp <= until
}

// ==============================================================================
// json lines file
// ==============================================================================

pub struct JsonlStore {
    path: PathBuf,
    /// serializes appends against the purge rewrite
    file: Mutex<()>,
}

impl JsonlStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf(), file: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<StoredMessage>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        let mut messages = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping corrupt line {} in {}: {}", n + 1, self.path.display(), e),
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl MessageStore for JsonlStore {
    async fn store(&self, message: StoredMessage) -> Result<()> {
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let _guard = self.file.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>> {
        let _guard = self.file.lock().await;
        let mut found: Vec<StoredMessage> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|m| in_window(m, device_id, since, until))
            .collect();
        found.sort_by_key(|m| m.timestamp);
        Ok(found)
    }

    async fn range(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<StoredMessage>> {
        let _guard = self.file.lock().await;
        let mut found: Vec<StoredMessage> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|m| in_range(m, since, until))
            .collect();
        found.sort_by_key(|m| m.timestamp);
        Ok(found)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.file.lock().await;
        let all = self.read_all().await?;
        let before = all.len();
        let kept: Vec<StoredMessage> = all.into_iter().filter(|m| m.timestamp >= cutoff).collect();
        let purged = before - kept.len();
        if purged == 0 {
            return Ok(0);
        }

        let mut content = String::new();
        for message in &kept {
            content.push_str(&serde_json::to_string(message)?);
            content.push('\n');
        }

        // write beside the log, then swap
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!(purged, kept = kept.len(), "store purged");
        Ok(purged)
    }
}

// ==============================================================================
// in memory
// ==============================================================================

#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<StoredMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<StoredMessage> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn store(&self, message: StoredMessage) -> Result<()> {
        self.messages.lock().await.push(message);
        Ok(())
    }

    async fn query(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>> {
        let mut found: Vec<StoredMessage> = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| in_window(m, device_id, since, until))
            .cloned()
            .collect();
        found.sort_by_key(|m| m.timestamp);
        Ok(found)
    }

    async fn range(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<StoredMessage>> {
        let mut found: Vec<StoredMessage> = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| in_range(m, since, until))
            .cloned()
            .collect();
        found.sort_by_key(|m| m.timestamp);
        Ok(found)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut messages = self.messages.lock().await;
        let before = messages.len();
        messages.retain(|m| m.timestamp >= cutoff);
        Ok(before - messages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(device: Option<&str>, at: DateTime<Utc>) -> StoredMessage {
        StoredMessage {
            timestamp: at,
            device_id: device.map(str::to_string),
            topic: "src/dev1/Tower/A/5476".to_string(),
            message: r#"{"id":"5476"}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn jsonl_store_appends_and_queries() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("nested").join("messages.jsonl"));
        let now = Utc::now();

        store.store(message(Some("A:Tower:5476"), now - Duration::minutes(10))).await.unwrap();
        store.store(message(Some("A:Tower:5476"), now)).await.unwrap();
        store.store(message(Some("A:Tower:1"), now)).await.unwrap();
        store.store(message(None, now)).await.unwrap();

        let found = store
            .query("A:Tower:5476", now - Duration::minutes(5), now)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].timestamp, now);

        let all = store
            .query("A:Tower:5476", now - Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].timestamp < all[1].timestamp);

        // range ignores the device, unknown payloads included
        let window = store.range(now - Duration::minutes(5), now).await.unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[2].device_id, None);
    }

    #[tokio::test]
    async fn jsonl_store_purges_old_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("messages.jsonl"));
        let now = Utc::now();

        store.store(message(Some("k"), now - Duration::days(8))).await.unwrap();
        store.store(message(Some("k"), now - Duration::days(1))).await.unwrap();

        assert_eq!(store.purge_older_than(now - Duration::days(7)).await.unwrap(), 1);
        assert_eq!(store.purge_older_than(now - Duration::days(7)).await.unwrap(), 0);

        let left = store.query("k", now - Duration::days(30), now).await.unwrap();
        assert_eq!(left.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_is_empty_and_corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.jsonl");
        let store = JsonlStore::new(&path);
        let now = Utc::now();

        assert!(store.query("k", now - Duration::days(1), now).await.unwrap().is_empty());

        store.store(message(Some("k"), now)).await.unwrap();
        let mut raw = tokio::fs::read_to_string(&path).await.unwrap();
        raw.push_str("not json\n");
        tokio::fs::write(&path, raw).await.unwrap();

        assert_eq!(store.query("k", now - Duration::days(1), now).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_matches_file_semantics() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.store(message(Some("k"), now - Duration::days(8))).await.unwrap();
        store.store(message(Some("k"), now)).await.unwrap();

        assert_eq!(store.query("k", now - Duration::days(30), now).await.unwrap().len(), 2);
        assert_eq!(store.purge_older_than(now - Duration::days(7)).await.unwrap(), 1);
        assert_eq!(store.messages().await.len(), 1);
    }
}
