//! In-process lock table.
//!
//! A mutex-guarded map. Check and insert happen under one guard, so two
//! acquirers can never both succeed. Only valid within a single process.

use super::lease::{LockEntry, LockStats, LockToken};
use super::LockTable;
use crate::core::error::{IdemError, IdemResult};
use crate::core::time::SharedClock;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Lock table held in process memory.
pub struct InProcessLockTable {
    entries: Mutex<HashMap<String, LockEntry>>,
    clock: SharedClock,
}

impl InProcessLockTable {
    /// Create an empty table.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of entries, live or lapsed.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Get statistics.
    pub fn stats(&self) -> LockStats {
        let now = self.clock.now();
        let entries = self.entries.lock();
        let expired = entries.values().filter(|e| e.is_expired_at(now)).count();
        LockStats {
            live: entries.len() - expired,
            expired,
        }
    }
}

#[async_trait]
impl LockTable for InProcessLockTable {
    fn kind(&self) -> &'static str {
        "in-process"
    }

    async fn try_acquire(&self, name: &str, lease: Duration) -> IdemResult<Option<LockToken>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(name) {
            if !existing.is_expired_at(now) {
                return Ok(None);
            }
            tracing::debug!(
                lock = name,
                holder = %existing.holder_token,
                "taking over expired lease"
            );
        }

        let entry = LockEntry::new(name, lease, now);
        let token = entry.holder_token.clone();
        entries.insert(name.to_string(), entry);
        Ok(Some(token))
    }

    async fn renew(&self, name: &str, token: &LockToken, lease: Duration) -> IdemResult<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get_mut(name) {
            Some(entry) if entry.is_held_by(token, now) => {
                entry.renew(lease, now);
                Ok(())
            }
            _ => Err(IdemError::token_mismatch(name)),
        }
    }

    async fn release(&self, name: &str, token: &LockToken) -> IdemResult<bool> {
        let mut entries = self.entries.lock();
        match entries.get(name) {
            Some(entry) if entry.holder_token == *token => {
                entries.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_held(&self, name: &str, token: &LockToken) -> IdemResult<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .lock()
            .get(name)
            .is_some_and(|entry| entry.is_held_by(token, now)))
    }

    async fn peek(&self, name: &str) -> IdemResult<Option<LockEntry>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .lock()
            .get(name)
            .filter(|entry| !entry.is_expired_at(now))
            .cloned())
    }

    async fn purge_expired(&self) -> IdemResult<usize> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        Ok(before - entries.len())
    }
}
