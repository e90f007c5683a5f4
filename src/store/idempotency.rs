//! Store operations: get, begin, renew, complete, abort.
//!
//! # Invariants
//!
//! - `begin` never hands out a token while a live completed record exists.
//! - `complete` and `abort` require the current lock token; a stale holder
//!   gets `TokenMismatch` and changes nothing.
//! - A live completed record is never overwritten.
//! - Expired records read as absent and are removed by the reader.

use super::memory::MemoryRecords;
use super::persistent::FileRecords;
use super::record::{IdempotencyRecord, KeyStatus, RecordKey, ResponseSnapshot};
use super::RecordBackend;
use crate::core::config::Config;
use crate::core::error::{IdemError, IdemResult};
use crate::core::time::{deadline_after, SharedClock};
use crate::lock::{
    AcquirePolicy, Acquisition, FileLockTable, InProcessLockTable, LockManager, LockToken,
};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of [`IdempotencyStore::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// The caller holds the key and must finish with `complete` or `abort`.
    Acquired(LockToken),
    /// Another execution holds the key.
    Pending,
    /// The key already has a live completed record.
    Completed(Box<IdempotencyRecord>),
}

/// Result of a maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Expired records removed.
    pub records: usize,
    /// Lapsed locks removed.
    pub locks: usize,
}

/// The idempotency store.
pub struct IdempotencyStore {
    records: Arc<dyn RecordBackend>,
    locks: LockManager,
    clock: SharedClock,
}

impl IdempotencyStore {
    /// Assemble a store from a record backend and a lock manager.
    pub fn new(records: Arc<dyn RecordBackend>, locks: LockManager, clock: SharedClock) -> Self {
        Self {
            records,
            locks,
            clock,
        }
    }

    /// Process-local store.
    pub fn memory(policy: AcquirePolicy, clock: SharedClock) -> Self {
        let table = Arc::new(InProcessLockTable::new(clock.clone()));
        Self::new(
            Arc::new(MemoryRecords::new()),
            LockManager::new(table, policy),
            clock,
        )
    }

    /// Persistent store rooted at `root` (`records/` and `locks/` below it).
    pub async fn persistent(
        root: impl AsRef<Path>,
        policy: AcquirePolicy,
        clock: SharedClock,
    ) -> IdemResult<Self> {
        let root = root.as_ref();
        let records = FileRecords::open(root.join("records")).await?;
        let table = FileLockTable::open(root.join("locks"), clock.clone()).await?;
        Ok(Self::new(
            Arc::new(records),
            LockManager::new(Arc::new(table), policy),
            clock,
        ))
    }

    /// Build the store selected by configuration.
    pub async fn open(config: &Config, clock: SharedClock) -> anyhow::Result<Self> {
        let policy = AcquirePolicy::new(config.lock.acquire_attempts, config.lock.retry_interval());
        match config.store.backend.as_str() {
            "memory" => Ok(Self::memory(policy, clock)),
            "persistent" => {
                let dir = config
                    .store
                    .storage_dir
                    .as_deref()
                    .context("store.storage_dir required for the persistent backend")?;
                Self::persistent(dir, policy, clock)
                    .await
                    .with_context(|| format!("failed to open persistent store at {dir}"))
            }
            other => anyhow::bail!("unknown store backend: {other}"),
        }
    }

    /// Backend name.
    pub fn backend(&self) -> &'static str {
        self.records.kind()
    }

    /// The lock manager.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Look up a live completed record.
    ///
    /// Fails closed: backend errors are logged and reported as absent.
    pub async fn get(&self, key: &RecordKey) -> Option<IdempotencyRecord> {
        match self.lookup(key).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(record = %key, error = %e, "record lookup failed; treating as absent");
                None
            }
        }
    }

    async fn lookup(&self, key: &RecordKey) -> IdemResult<Option<IdempotencyRecord>> {
        let record = match self.records.load(key).await {
            Ok(record) => record,
            Err(IdemError::Serialization { message }) => {
                tracing::warn!(record = %key, error = %message, "removing unreadable record");
                self.records.remove(key).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let Some(record) = record else {
            return Ok(None);
        };
        let now = self.clock.now();
        if record.is_expired_at(now) {
            tracing::debug!(record = %key, expired_at = %record.expires_at, "lazily removing expired record");
            self.records.remove_expired(key, now).await?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Start an execution for `key`.
    pub async fn begin(&self, key: &RecordKey, lease: Duration) -> IdemResult<Begin> {
        if let Some(record) = self.lookup(key).await? {
            return Ok(Begin::Completed(Box::new(record)));
        }

        let name = key.storage_name();
        let token = match self.locks.acquire(&name, lease).await? {
            Acquisition::Acquired(token) => token,
            Acquisition::Busy => return Ok(Begin::Pending),
        };

        // A holder may have completed between the lookup and our acquisition.
        match self.lookup(key).await {
            Ok(None) => Ok(Begin::Acquired(token)),
            Ok(Some(record)) => {
                self.locks.release(&name, &token).await?;
                Ok(Begin::Completed(Box::new(record)))
            }
            Err(e) => {
                let _ = self.locks.release(&name, &token).await;
                Err(e)
            }
        }
    }

    /// Extend the lease held by `token`.
    pub async fn renew(&self, key: &RecordKey, token: &LockToken, lease: Duration) -> IdemResult<()> {
        self.locks
            .renew(&key.storage_name(), token, lease)
            .await
            .map_err(|e| match e {
                IdemError::TokenMismatch { .. } => IdemError::token_mismatch(key.to_string()),
                other => other,
            })
    }

    /// Record a successful execution and release the lock.
    pub async fn complete(
        &self,
        key: &RecordKey,
        token: &LockToken,
        snapshot: ResponseSnapshot,
        ttl: Duration,
    ) -> IdemResult<IdempotencyRecord> {
        let name = key.storage_name();
        if !self.locks.is_held(&name, token).await? {
            tracing::error!(record = %key, token = %token, "complete by a holder that lost its lease");
            return Err(IdemError::token_mismatch(key.to_string()));
        }

        let now = self.clock.now();
        let record = IdempotencyRecord::completed(key, snapshot, now, deadline_after(now, ttl));
        let inserted = self.records.insert_unique(&record, now).await;

        let released = self.locks.release(&name, token).await;
        if !inserted? {
            tracing::warn!(record = %key, "live record already present; keeping it");
            return Err(IdemError::AlreadyCompleted {
                key: key.to_string(),
            });
        }
        if !released? {
            tracing::warn!(record = %key, "lease lapsed while writing the record");
        }

        tracing::debug!(record = %key, expires_at = %record.expires_at, "execution completed");
        Ok(record)
    }

    /// Release the lock without writing a record.
    pub async fn abort(&self, key: &RecordKey, token: &LockToken) -> IdemResult<()> {
        if self.locks.release(&key.storage_name(), token).await? {
            tracing::debug!(record = %key, "execution aborted");
            Ok(())
        } else {
            tracing::error!(record = %key, token = %token, "abort by a holder that lost its lease");
            Err(IdemError::token_mismatch(key.to_string()))
        }
    }

    /// Delete a completed record. Returns false if none existed.
    pub async fn invalidate(&self, key: &RecordKey) -> IdemResult<bool> {
        let removed = self.records.remove(key).await?;
        if removed {
            tracing::info!(record = %key, "record invalidated");
        }
        Ok(removed)
    }

    /// Current state of a key.
    pub async fn status(&self, key: &RecordKey) -> IdemResult<KeyStatus> {
        if self.lookup(key).await?.is_some() {
            return Ok(KeyStatus::Completed);
        }
        if self.locks.peek(&key.storage_name()).await?.is_some() {
            return Ok(KeyStatus::Pending);
        }
        Ok(KeyStatus::Absent)
    }

    /// All live completed records.
    pub async fn records(&self) -> IdemResult<Vec<IdempotencyRecord>> {
        let now = self.clock.now();
        let mut records: Vec<_> = self
            .records
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.is_expired_at(now))
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Eagerly remove expired records and lapsed locks.
    pub async fn purge_expired(&self) -> IdemResult<PurgeStats> {
        let now = self.clock.now();
        let mut stats = PurgeStats::default();
        for record in self.records.list().await? {
            if record.is_expired_at(now)
                && self.records.remove_expired(&record.record_key(), now).await?
            {
                stats.records += 1;
            }
        }
        stats.locks = self.locks.purge_expired().await?;
        tracing::info!(records = stats.records, locks = stats.locks, "purged expired entries");
        Ok(stats)
    }
}
