//! Lock primitive.
//!
//! Atomic acquire-if-absent with a lease, token-checked renewal and
//! release. Every mutual-exclusion decision in the crate goes through a
//! [`LockTable`]:
//! - [`memory`] - in-process table (single instance)
//! - [`file`] - lock files in a shared directory (multiple processes)
//! - [`lease`] - lease entries, tokens and retry policy
//!
//! # Lease sizing
//!
//! A lease shorter than the protected operation's runtime lets a second
//! holder in while the first is still executing. Streams therefore renew
//! their lease on a heartbeat shorter than the lease itself.

pub mod file;
pub mod lease;
pub mod memory;

pub use file::FileLockTable;
pub use lease::{AcquirePolicy, Acquisition, LockEntry, LockStats, LockToken};
pub use memory::InProcessLockTable;

use crate::core::error::IdemResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Backend for the lock primitive.
#[async_trait]
pub trait LockTable: Send + Sync {
    /// Backend name for diagnostics.
    fn kind(&self) -> &'static str;

    /// Acquire `name` if no live lease exists. Returns `None` when busy.
    ///
    /// A lapsed lease is taken over. Must be atomic: two callers can never
    /// both receive a token for the same name at the same time.
    async fn try_acquire(&self, name: &str, lease: Duration) -> IdemResult<Option<LockToken>>;

    /// Extend a live lease held by `token`.
    ///
    /// Fails with `TokenMismatch` if the lease lapsed or belongs to another holder.
    async fn renew(&self, name: &str, token: &LockToken, lease: Duration) -> IdemResult<()>;

    /// Release the lock if `token` is the current holder.
    ///
    /// Returns false (not an error) when the lock is gone or held by someone else.
    async fn release(&self, name: &str, token: &LockToken) -> IdemResult<bool>;

    /// Check if `token` holds a live lease on `name`.
    async fn is_held(&self, name: &str, token: &LockToken) -> IdemResult<bool>;

    /// The live entry for `name`, if any.
    async fn peek(&self, name: &str) -> IdemResult<Option<LockEntry>>;

    /// Drop lapsed entries. Returns how many were removed.
    async fn purge_expired(&self) -> IdemResult<usize>;
}

/// Lock table plus contention policy.
#[derive(Clone)]
pub struct LockManager {
    table: Arc<dyn LockTable>,
    policy: AcquirePolicy,
}

impl LockManager {
    /// Create a manager over `table`.
    pub fn new(table: Arc<dyn LockTable>, policy: AcquirePolicy) -> Self {
        Self { table, policy }
    }

    /// The underlying table.
    pub fn table(&self) -> &Arc<dyn LockTable> {
        &self.table
    }

    /// The contention policy.
    pub fn policy(&self) -> AcquirePolicy {
        self.policy
    }

    /// Acquire with bounded retry.
    ///
    /// Retries `policy.attempts - 1` times at a fixed interval before
    /// reporting [`Acquisition::Busy`]. Backend errors are returned at once.
    pub async fn acquire(&self, name: &str, lease: Duration) -> IdemResult<Acquisition> {
        let mut attempt = 1;
        loop {
            if let Some(token) = self.table.try_acquire(name, lease).await? {
                return Ok(Acquisition::Acquired(token));
            }
            if attempt >= self.policy.attempts {
                tracing::debug!(lock = name, attempts = attempt, "lock busy");
                return Ok(Acquisition::Busy);
            }
            attempt += 1;
            tokio::time::sleep(self.policy.interval).await;
        }
    }

    /// Renew a held lease.
    pub async fn renew(&self, name: &str, token: &LockToken, lease: Duration) -> IdemResult<()> {
        self.table.renew(name, token, lease).await
    }

    /// Release a held lock; a no-op for non-holders.
    pub async fn release(&self, name: &str, token: &LockToken) -> IdemResult<bool> {
        let released = self.table.release(name, token).await?;
        if !released {
            tracing::debug!(lock = name, token = %token, "release skipped: not the holder");
        }
        Ok(released)
    }

    /// Check if `token` holds a live lease.
    pub async fn is_held(&self, name: &str, token: &LockToken) -> IdemResult<bool> {
        self.table.is_held(name, token).await
    }

    /// The live entry for `name`, if any.
    pub async fn peek(&self, name: &str) -> IdemResult<Option<LockEntry>> {
        self.table.peek(name).await
    }

    /// Drop lapsed entries.
    pub async fn purge_expired(&self) -> IdemResult<usize> {
        self.table.purge_expired().await
    }
}
