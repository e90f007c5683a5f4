//! Idempotency store.
//!
//! Maps `(owner, key)` to "in flight" (a live lock) or "completed" (a
//! record holding the response snapshot). One store type, two backends
//! picked by configuration:
//! - [`memory`] - process-local map with an in-process lock table
//! - [`persistent`] - record files with a file lock table
//!
//! The store operations live on [`IdempotencyStore`]; backends only
//! provide raw record storage ([`RecordBackend`]) and a lock table.

pub mod idempotency;
pub mod memory;
pub mod persistent;
pub mod record;

pub use idempotency::{Begin, IdempotencyStore, PurgeStats};
pub use memory::MemoryRecords;
pub use persistent::FileRecords;
pub use record::{
    IdempotencyRecord, KeyStatus, RecordKey, RecordStatus, ResponseHead, ResponseSnapshot,
    SnapshotBody,
};

use crate::core::error::IdemResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Raw record storage.
///
/// Implementations must make each write atomic at record granularity:
/// a concurrent `load` sees either the previous state or the whole new
/// record.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    /// Backend name for diagnostics.
    fn kind(&self) -> &'static str;

    /// Load a record, expired or not.
    async fn load(&self, key: &RecordKey) -> IdemResult<Option<IdempotencyRecord>>;

    /// Insert a record unless a live one exists for the same key.
    ///
    /// An expired record in the way is replaced. Returns false when a live
    /// record already occupies the key.
    async fn insert_unique(&self, record: &IdempotencyRecord, now: DateTime<Utc>)
        -> IdemResult<bool>;

    /// Remove a record unconditionally.
    async fn remove(&self, key: &RecordKey) -> IdemResult<bool>;

    /// Remove the record only if it is expired at `now`.
    async fn remove_expired(&self, key: &RecordKey, now: DateTime<Utc>) -> IdemResult<bool>;

    /// All stored records, expired ones included.
    async fn list(&self) -> IdemResult<Vec<IdempotencyRecord>>;
}
