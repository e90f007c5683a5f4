//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idemgate::core::config::Config;
use idemgate::core::error::{IdemError, IdemResult, OperationError};
use idemgate::core::time::{ManualClock, SharedClock};
use idemgate::lock::{AcquirePolicy, InProcessLockTable, LockManager};
use idemgate::store::{IdempotencyRecord, IdempotencyStore, RecordBackend, RecordKey};
use idemgate::stream::{Frame, FrameStream};
use idemgate::Coordinator;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Write a configuration file.
pub fn create_config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Configuration with short timings suited to tests.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.lock.lease_ms = 2_000;
    config.lock.heartbeat_interval_ms = 500;
    config.lock.acquire_attempts = 1;
    config.lock.retry_interval_ms = 10;
    config.stream.keep_alive_interval_ms = 0;
    config
}

/// A manual clock and a shareable handle to it.
pub fn manual_clock() -> (Arc<ManualClock>, SharedClock) {
    let clock = Arc::new(ManualClock::starting_now());
    let shared: SharedClock = clock.clone();
    (clock, shared)
}

/// In-memory store that reports a busy key at once.
pub fn memory_store(clock: SharedClock) -> Arc<IdempotencyStore> {
    Arc::new(IdempotencyStore::memory(AcquirePolicy::no_retry(), clock))
}

/// Coordinator over `store` using `config`.
pub fn coordinator(config: &Config, store: Arc<IdempotencyStore>) -> Coordinator {
    Coordinator::from_config(config, store)
}

/// Record key for the canonical scenario.
pub fn abc123() -> RecordKey {
    RecordKey::new("u1", "abc123")
}

/// Frames produced one by one with `gap` between them.
///
/// The producer task stops early if the consumer goes away.
pub fn paced_frames(items: Vec<Result<Frame, OperationError>>, gap: Duration) -> FrameStream {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        for item in items {
            tokio::time::sleep(gap).await;
            if tx.send(item).await.is_err() {
                return;
            }
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

/// `Hi`, `there`, then the terminal `done` frame.
pub fn greeting_frames() -> Vec<Result<Frame, OperationError>> {
    vec![
        Ok(Frame::data(Some("token"), "Hi")),
        Ok(Frame::data(Some("token"), "there")),
        Ok(Frame::terminal(Some("done"), "done")),
    ]
}

/// Counts how many times a protected operation ran.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Record backend whose every call fails as unavailable.
pub struct UnavailableRecords;

#[async_trait]
impl RecordBackend for UnavailableRecords {
    fn kind(&self) -> &'static str {
        "unavailable"
    }

    async fn load(&self, _key: &RecordKey) -> IdemResult<Option<IdempotencyRecord>> {
        Err(IdemError::unavailable("backend offline"))
    }

    async fn insert_unique(
        &self,
        _record: &IdempotencyRecord,
        _now: DateTime<Utc>,
    ) -> IdemResult<bool> {
        Err(IdemError::unavailable("backend offline"))
    }

    async fn remove(&self, _key: &RecordKey) -> IdemResult<bool> {
        Err(IdemError::unavailable("backend offline"))
    }

    async fn remove_expired(&self, _key: &RecordKey, _now: DateTime<Utc>) -> IdemResult<bool> {
        Err(IdemError::unavailable("backend offline"))
    }

    async fn list(&self) -> IdemResult<Vec<IdempotencyRecord>> {
        Err(IdemError::unavailable("backend offline"))
    }
}

/// Store whose record backend is offline.
pub fn unavailable_store(clock: SharedClock) -> Arc<IdempotencyStore> {
    let locks = LockManager::new(
        Arc::new(InProcessLockTable::new(clock.clone())),
        AcquirePolicy::no_retry(),
    );
    Arc::new(IdempotencyStore::new(
        Arc::new(UnavailableRecords),
        locks,
        clock,
    ))
}
