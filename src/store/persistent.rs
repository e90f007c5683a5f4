//! Persistent record backend.
//!
//! One JSON file per record under `<root>/records/`, named by
//! [`RecordKey::storage_name`]. The file name is the uniqueness constraint
//! on `(key, owner)`:
//!
//! - Writes go to a temp file first and are published with a hard link,
//!   which fails if a record already exists. Readers only ever see complete
//!   files.
//! - Expired records are deleted lazily by whoever reads them. Deletion
//!   moves the file aside first and restores it if it turns out to be a
//!   fresh record written in the meantime.

use super::record::{IdempotencyRecord, RecordKey};
use super::RecordBackend;
use crate::core::error::{IdemError, IdemResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use ulid::Ulid;

const RECORD_EXT: &str = "json";

/// Records stored as files in a directory.
pub struct FileRecords {
    dir: PathBuf,
}

impl FileRecords {
    /// Create the directory (if needed) and the backend.
    pub async fn open(dir: impl Into<PathBuf>) -> IdemResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Directory holding the record files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &RecordKey) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXT}", key.storage_name()))
    }

    fn scratch_path(&self, key: &RecordKey, purpose: &str) -> PathBuf {
        self.dir
            .join(format!(".{}.{}.{purpose}", key.storage_name(), Ulid::new()))
    }

    async fn read_path(path: &Path) -> IdemResult<Option<IdempotencyRecord>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn link_if_absent(&self, record: &IdempotencyRecord) -> IdemResult<bool> {
        let key = record.record_key();
        let temp = self.scratch_path(&key, "tmp");
        tokio::fs::write(&temp, serde_json::to_vec_pretty(record)?).await?;
        let linked = tokio::fs::hard_link(&temp, self.record_path(&key)).await;
        let _ = tokio::fs::remove_file(&temp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RecordBackend for FileRecords {
    fn kind(&self) -> &'static str {
        "persistent"
    }

    async fn load(&self, key: &RecordKey) -> IdemResult<Option<IdempotencyRecord>> {
        let record = Self::read_path(&self.record_path(key)).await?;
        match record {
            Some(record) if record.record_key() != *key => Err(IdemError::Serialization {
                message: format!("record file for {key} names {}", record.record_key()),
            }),
            other => Ok(other),
        }
    }

    async fn insert_unique(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> IdemResult<bool> {
        if self.link_if_absent(record).await? {
            return Ok(true);
        }
        // Occupied: only an expired or unreadable record may be replaced.
        let key = record.record_key();
        if let Ok(Some(existing)) = self.load(&key).await {
            if !existing.is_expired_at(now) {
                return Ok(false);
            }
        }
        self.remove_expired(&key, now).await?;
        self.link_if_absent(record).await
    }

    async fn remove(&self, key: &RecordKey) -> IdemResult<bool> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_expired(&self, key: &RecordKey, now: DateTime<Utc>) -> IdemResult<bool> {
        let path = self.record_path(key);
        let aside = self.scratch_path(key, "expired");
        match tokio::fs::rename(&path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let moved = match Self::read_path(&aside).await {
            Ok(moved) => moved,
            Err(IdemError::Serialization { message }) => {
                tracing::warn!(record = %key, error = %message, "discarding unreadable record");
                None
            }
            Err(e) => return Err(e),
        };

        match moved {
            Some(record) if !record.is_expired_at(now) => {
                // A fresh record replaced the expired one between our read
                // and the rename; put it back unless yet another writer won.
                if let Err(e) = tokio::fs::hard_link(&aside, &path).await {
                    if e.kind() != ErrorKind::AlreadyExists {
                        tracing::error!(record = %key, error = %e, "failed to restore live record");
                    }
                }
                let _ = tokio::fs::remove_file(&aside).await;
                Ok(false)
            }
            _ => {
                let _ = tokio::fs::remove_file(&aside).await;
                Ok(true)
            }
        }
    }

    async fn list(&self) -> IdemResult<Vec<IdempotencyRecord>> {
        let mut records = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT)
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_record {
                continue;
            }
            match Self::read_path(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record");
                }
            }
        }
        Ok(records)
    }
}
