//! Idempotency records and response snapshots.
//!
//! `(owner, key) → IdempotencyRecord{response, created_at, expires_at}`
//!
//! Only completed executions produce a record; an in-flight execution is
//! represented by its lock entry. A live record is immutable, and an
//! expired one is indistinguishable from a missing one.

use crate::stream::frame::{base64_bytes, Frame, SequencedFrame};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identity of a record: the client key scoped to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Owner identity (resolved by authentication).
    pub owner: String,
    /// Client-supplied idempotency key.
    pub key: String,
}

impl RecordKey {
    /// Create a record key.
    pub fn new(owner: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            key: key.into(),
        }
    }

    /// Filesystem- and lock-safe name: hex SHA-256 of the length-prefixed
    /// owner followed by the key.
    ///
    /// Always 64 bytes regardless of key and owner length. The record body
    /// carries the real owner and key.
    pub fn storage_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.owner.len() as u64).to_be_bytes());
        hasher.update(self.owner.as_bytes());
        hasher.update(self.key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.key)
    }
}

/// Status line and header subset of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    /// HTTP status code.
    pub status: u16,
    /// Headers as `(lowercase name, value)` pairs, in order.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Create a head with no headers.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    /// First value of a header (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Check for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Copy keeping only the named headers.
    pub fn retain_headers(&self, names: &[String]) -> Self {
        Self {
            status: self.status,
            headers: self
                .headers
                .iter()
                .filter(|(n, _)| names.iter().any(|keep| keep.eq_ignore_ascii_case(n)))
                .cloned()
                .collect(),
        }
    }
}

/// Cached body of a completed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SnapshotBody {
    /// Single buffered body.
    Single {
        #[serde(with = "base64_bytes")]
        body: Bytes,
    },
    /// Ordered frame log of an incremental result.
    Frames {
        /// Data frames in sequence order.
        frames: Vec<SequencedFrame>,
        /// The terminal frame.
        terminal: SequencedFrame,
    },
}

/// Everything needed to reproduce a response on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    /// Status and captured headers.
    pub head: ResponseHead,
    /// Body or frame log.
    pub body: SnapshotBody,
}

impl ResponseSnapshot {
    /// Snapshot of a single-value response.
    pub fn single(head: ResponseHead, body: Bytes) -> Self {
        Self {
            head,
            body: SnapshotBody::Single { body },
        }
    }

    /// Snapshot of a finished stream.
    pub fn frames(head: ResponseHead, frames: Vec<SequencedFrame>, terminal: SequencedFrame) -> Self {
        Self {
            head,
            body: SnapshotBody::Frames { frames, terminal },
        }
    }

    /// Check if this snapshot holds a stream.
    pub fn is_stream(&self) -> bool {
        matches!(self.body, SnapshotBody::Frames { .. })
    }

    /// Frames in replay order (data frames by sequence, then the terminal).
    pub fn replay_frames(&self) -> Vec<Frame> {
        match &self.body {
            SnapshotBody::Single { .. } => Vec::new(),
            SnapshotBody::Frames { frames, terminal } => {
                let mut ordered: Vec<&SequencedFrame> = frames.iter().collect();
                ordered.sort_by_key(|f| f.sequence);
                ordered
                    .into_iter()
                    .chain(std::iter::once(terminal))
                    .map(|f| f.frame.clone())
                    .collect()
            }
        }
    }
}

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// An execution holds the key.
    Pending,
    /// The execution finished and its response is cached.
    Completed,
}

/// A completed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Client key.
    pub key: String,
    /// Owner identity.
    pub owner: String,
    /// Always `Completed` for persisted records.
    pub status: RecordStatus,
    /// Cached response.
    pub response: ResponseSnapshot,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
    /// When the record stops being replayed.
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Create a completed record.
    pub fn completed(
        key: &RecordKey,
        response: ResponseSnapshot,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.key.clone(),
            owner: key.owner.clone(),
            status: RecordStatus::Completed,
            response,
            created_at,
            expires_at,
        }
    }

    /// The record's identity.
    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(self.owner.clone(), self.key.clone())
    }

    /// Check if the record has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Observable state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// No live record and no live lock.
    Absent,
    /// A live lock and no record.
    Pending,
    /// A live completed record.
    Completed,
}
