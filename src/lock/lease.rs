//! Lock leases.
//!
//! `LockName → LockEntry{holder_token, acquired_at, lease_expires_at, renewals}`
//!
//! A lease is live until `lease_expires_at`; after that any acquirer may
//! take the key over. Holders of long-running work extend the lease with
//! [`LockEntry::renew`] before it lapses.

use crate::core::time::{deadline_after, ms_until};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use ulid::Ulid;

/// Opaque proof of lock ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a fresh, globally unique token.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A lock held on one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Lock name (the encoded record key).
    pub name: String,

    /// Token of the current holder.
    pub holder_token: LockToken,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,

    /// When the lease lapses unless renewed.
    pub lease_expires_at: DateTime<Utc>,

    /// Number of successful renewals.
    #[serde(default)]
    pub renewals: u64,
}

impl LockEntry {
    /// Create an entry for a new holder.
    pub fn new(name: impl Into<String>, lease: Duration, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            holder_token: LockToken::generate(),
            acquired_at: now,
            lease_expires_at: deadline_after(now, lease),
            renewals: 0,
        }
    }

    /// Check if the lease has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.lease_expires_at
    }

    /// Check if `token` names the holder of a live lease at `now`.
    pub fn is_held_by(&self, token: &LockToken, now: DateTime<Utc>) -> bool {
        self.holder_token == *token && !self.is_expired_at(now)
    }

    /// Remaining lease in milliseconds.
    pub fn remaining_ms_at(&self, now: DateTime<Utc>) -> u64 {
        ms_until(now, self.lease_expires_at)
    }

    /// Extend the lease to `now + lease`.
    pub fn renew(&mut self, lease: Duration, now: DateTime<Utc>) {
        self.lease_expires_at = deadline_after(now, lease);
        self.renewals += 1;
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// The caller now holds the lock.
    Acquired(LockToken),
    /// A live lease is held by someone else.
    Busy,
}

impl Acquisition {
    /// The token, if acquired.
    pub fn token(self) -> Option<LockToken> {
        match self {
            Self::Acquired(token) => Some(token),
            Self::Busy => None,
        }
    }
}

/// Bounded retry policy for contended acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquirePolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Fixed wait between attempts.
    pub interval: Duration,
}

impl AcquirePolicy {
    /// Create a policy.
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// Lock table statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Entries with a live lease.
    pub live: usize,
    /// Entries whose lease lapsed but have not been reclaimed yet.
    pub expired: usize,
}
