//! Process-local record backend.
//!
//! Suitable only for single-instance deployments: records and locks live
//! in this process and vanish with it.

use super::record::{IdempotencyRecord, RecordKey};
use super::RecordBackend;
use crate::core::error::IdemResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Records held in a process-local map.
#[derive(Default)]
pub struct MemoryRecords {
    records: RwLock<HashMap<RecordKey, IdempotencyRecord>>,
}

impl MemoryRecords {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, expired ones included.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordBackend for MemoryRecords {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, key: &RecordKey) -> IdemResult<Option<IdempotencyRecord>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn insert_unique(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> IdemResult<bool> {
        let key = record.record_key();
        let mut records = self.records.write();
        if records.get(&key).is_some_and(|r| !r.is_expired_at(now)) {
            return Ok(false);
        }
        records.insert(key, record.clone());
        Ok(true)
    }

    async fn remove(&self, key: &RecordKey) -> IdemResult<bool> {
        Ok(self.records.write().remove(key).is_some())
    }

    async fn remove_expired(&self, key: &RecordKey, now: DateTime<Utc>) -> IdemResult<bool> {
        let mut records = self.records.write();
        if records.get(key).is_some_and(|r| r.is_expired_at(now)) {
            records.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn list(&self) -> IdemResult<Vec<IdempotencyRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }
}
