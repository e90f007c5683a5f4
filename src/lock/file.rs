//! File-backed lock table shared between processes.
//!
//! Each lock is a JSON file `<dir>/<name>.lock`. The protocol:
//!
//! 1. Acquisition writes the entry to a private temp file and hard-links it
//!    to the lock path. Linking fails if the path exists, so exactly one
//!    acquirer wins and readers never see a partially written entry.
//! 2. Expired takeover, renewal and release each run under a per-lock latch
//!    file (`<name>.latch`, created with `create_new`). The latch is held
//!    only for the read-verify-write of a single entry.
//! 3. A latch older than [`LATCH_STALE_AFTER`] belonged to a crashed
//!    process and is removed by the next contender.
//!
//! Names must be filesystem-safe; the store passes hex digests.

use super::lease::{LockEntry, LockToken};
use super::LockTable;
use crate::core::error::{IdemError, IdemResult};
use crate::core::time::SharedClock;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use ulid::Ulid;

/// Age after which a latch file is considered abandoned.
pub const LATCH_STALE_AFTER: Duration = Duration::from_secs(5);

/// Wait between latch attempts.
const LATCH_SPIN: Duration = Duration::from_millis(2);

/// Latch attempts before giving up.
const LATCH_MAX_SPINS: u32 = 500;

const LOCK_EXT: &str = "lock";
const LATCH_EXT: &str = "latch";

/// Lock table stored as files in one directory.
pub struct FileLockTable {
    dir: PathBuf,
    clock: SharedClock,
}

impl FileLockTable {
    /// Create a table rooted at `dir`. The directory must exist.
    pub fn new(dir: impl Into<PathBuf>, clock: SharedClock) -> Self {
        Self {
            dir: dir.into(),
            clock,
        }
    }

    /// Create the directory (if needed) and the table.
    pub async fn open(dir: impl Into<PathBuf>, clock: SharedClock) -> IdemResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self::new(dir, clock))
    }

    /// Directory holding the lock files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{LOCK_EXT}"))
    }

    fn latch_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{LATCH_EXT}"))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!(".{name}.{}.tmp", Ulid::new()))
    }

    async fn read_entry(&self, name: &str) -> IdemResult<Option<LockEntry>> {
        match tokio::fs::read(self.lock_path(name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_temp(&self, name: &str, entry: &LockEntry) -> IdemResult<PathBuf> {
        let temp = self.temp_path(name);
        tokio::fs::write(&temp, serde_json::to_vec(entry)?).await?;
        Ok(temp)
    }

    /// Publish `entry` only if no lock file exists.
    async fn link_if_absent(&self, name: &str, entry: &LockEntry) -> IdemResult<bool> {
        let temp = self.write_temp(name, entry).await?;
        let linked = tokio::fs::hard_link(&temp, self.lock_path(name)).await;
        let _ = tokio::fs::remove_file(&temp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the lock file with `entry`.
    async fn replace(&self, name: &str, entry: &LockEntry) -> IdemResult<()> {
        let temp = self.write_temp(name, entry).await?;
        if let Err(e) = tokio::fs::rename(&temp, self.lock_path(name)).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove_lock(&self, name: &str) -> IdemResult<()> {
        match tokio::fs::remove_file(self.lock_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn latch(&self, name: &str) -> IdemResult<Latch> {
        let path = self.latch_path(name);
        for _ in 0..LATCH_MAX_SPINS {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Latch { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if latch_is_stale(&path).await {
                        tracing::warn!(latch = %path.display(), "removing abandoned lock latch");
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    tokio::time::sleep(LATCH_SPIN).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(IdemError::unavailable(format!(
            "latch for lock {name} not obtained"
        )))
    }

    /// Remove the lock if it is still the lapsed entry we observed.
    async fn reap(&self, name: &str, observed: &LockToken) -> IdemResult<()> {
        let _latch = self.latch(name).await?;
        let now = self.clock.now();
        if let Some(current) = self.read_entry(name).await? {
            if current.holder_token == *observed && current.is_expired_at(now) {
                tracing::debug!(lock = name, holder = %observed, "reaping expired lease");
                self.remove_lock(name).await?;
            }
        }
        Ok(())
    }

    fn lock_names(entries: Vec<PathBuf>) -> Vec<String> {
        entries
            .into_iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(LOCK_EXT))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect()
    }
}

async fn latch_is_stale(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > LATCH_STALE_AFTER)
}

/// Held latch; removed on drop.
struct Latch {
    path: PathBuf,
}

impl Drop for Latch {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl LockTable for FileLockTable {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn try_acquire(&self, name: &str, lease: Duration) -> IdemResult<Option<LockToken>> {
        // Two passes: the second follows a reap of an expired holder.
        for _ in 0..2 {
            let entry = LockEntry::new(name, lease, self.clock.now());
            if self.link_if_absent(name, &entry).await? {
                return Ok(Some(entry.holder_token));
            }

            match self.read_entry(name).await? {
                None => continue,
                Some(existing) if existing.is_expired_at(self.clock.now()) => {
                    self.reap(name, &existing.holder_token).await?;
                }
                Some(_) => return Ok(None),
            }
        }
        Ok(None)
    }

    async fn renew(&self, name: &str, token: &LockToken, lease: Duration) -> IdemResult<()> {
        let _latch = self.latch(name).await?;
        let now = self.clock.now();
        match self.read_entry(name).await? {
            Some(mut entry) if entry.is_held_by(token, now) => {
                entry.renew(lease, now);
                self.replace(name, &entry).await
            }
            _ => Err(IdemError::token_mismatch(name)),
        }
    }

    async fn release(&self, name: &str, token: &LockToken) -> IdemResult<bool> {
        let _latch = self.latch(name).await?;
        match self.read_entry(name).await? {
            Some(entry) if entry.holder_token == *token => {
                self.remove_lock(name).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_held(&self, name: &str, token: &LockToken) -> IdemResult<bool> {
        let now = self.clock.now();
        Ok(self
            .read_entry(name)
            .await?
            .is_some_and(|entry| entry.is_held_by(token, now)))
    }

    async fn peek(&self, name: &str) -> IdemResult<Option<LockEntry>> {
        let now = self.clock.now();
        Ok(self
            .read_entry(name)
            .await?
            .filter(|entry| !entry.is_expired_at(now)))
    }

    async fn purge_expired(&self) -> IdemResult<usize> {
        let mut paths = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            paths.push(entry.path());
        }

        let mut purged = 0;
        for name in Self::lock_names(paths) {
            let Some(entry) = self.read_entry(&name).await? else {
                continue;
            };
            if entry.is_expired_at(self.clock.now()) {
                self.reap(&name, &entry.holder_token).await?;
                if self.read_entry(&name).await?.is_none() {
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }
}
