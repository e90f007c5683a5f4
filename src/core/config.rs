//! Configuration parsing and validation.
//!
//! idemgate configuration is loaded from TOML files with CLI overrides.
//! Every section is optional; omitted fields take the defaults below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for a single stream's lifetime.
pub const MAX_STREAM_DURATION_MS: u64 = 24 * 60 * 60 * 1_000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Idempotency store backend.
    #[serde(default)]
    pub store: StoreConfig,

    /// Lock lease and contention policy.
    #[serde(default)]
    pub lock: LockConfig,

    /// Protected routes and record policy.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Incremental stream handling.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Store backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend: "memory" or "persistent".
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Root directory for the persistent backend.
    #[serde(default)]
    pub storage_dir: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            storage_dir: None,
        }
    }
}

/// Lock lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease granted on acquisition, in milliseconds.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Acquisition attempts before reporting the key as busy.
    #[serde(default = "default_acquire_attempts")]
    pub acquire_attempts: u32,

    /// Fixed wait between acquisition attempts, in milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Lease renewal interval for streams, in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: default_lease_ms(),
            acquire_attempts: default_acquire_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl LockConfig {
    /// Lease as a duration.
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Retry interval as a duration.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Heartbeat interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Path prefixes subject to coordination.
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,

    /// HTTP methods subject to coordination.
    #[serde(default = "default_protected_methods")]
    pub protected_methods: Vec<String>,

    /// Header carrying the client idempotency key.
    #[serde(default = "default_key_header")]
    pub key_header: String,

    /// Maximum accepted key length in characters.
    #[serde(default = "default_max_key_len")]
    pub max_key_len: usize,

    /// Lifetime of completed records, in seconds.
    #[serde(default = "default_record_ttl_seconds")]
    pub record_ttl_seconds: u64,

    /// Response headers copied into the snapshot (lowercase names).
    #[serde(default = "default_captured_headers")]
    pub captured_headers: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            protected_paths: default_protected_paths(),
            protected_methods: default_protected_methods(),
            key_header: default_key_header(),
            max_key_len: default_max_key_len(),
            record_ttl_seconds: default_record_ttl_seconds(),
            captured_headers: default_captured_headers(),
        }
    }
}

impl CoordinatorConfig {
    /// Record TTL as a duration.
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_seconds)
    }
}

/// Stream reconciler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Maximum stream duration before it is cut off, in milliseconds.
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,

    /// Idle time after which a keep-alive frame is sent, in milliseconds.
    /// Zero disables keep-alives.
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,

    /// Capture size limit in bytes; larger streams are forwarded but not cached.
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: usize,

    /// Capacity of the live-forward channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_duration_ms: default_max_duration_ms(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            max_capture_bytes: default_max_capture_bytes(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_backend() -> String {
    "memory".to_string()
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_acquire_attempts() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    500
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_protected_paths() -> Vec<String> {
    vec![
        "/api/v1/chat/stream".to_string(),
        "/api/v1/tasks".to_string(),
        "/api/v1/plans".to_string(),
    ]
}

fn default_protected_methods() -> Vec<String> {
    vec!["POST".to_string(), "PUT".to_string(), "PATCH".to_string()]
}

fn default_key_header() -> String {
    "x-idempotency-key".to_string()
}

fn default_max_key_len() -> usize {
    64
}

fn default_record_ttl_seconds() -> u64 {
    3_600
}

fn default_captured_headers() -> Vec<String> {
    vec!["content-type".to_string()]
}

fn default_max_duration_ms() -> u64 {
    300_000
}

fn default_keep_alive_interval_ms() -> u64 {
    15_000
}

fn default_max_capture_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_channel_capacity() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref storage_dir) = overrides.storage_dir {
            self.store.backend = "persistent".to_string();
            self.store.storage_dir = Some(storage_dir.clone());
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_store()?;
        self.validate_lock()?;
        self.validate_coordinator()?;
        self.validate_stream()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_store(&self) -> Result<()> {
        match self.store.backend.as_str() {
            "memory" => Ok(()),
            "persistent" => {
                if self.store.storage_dir.as_deref().unwrap_or("").is_empty() {
                    anyhow::bail!("store.storage_dir required for the persistent backend");
                }
                Ok(())
            }
            other => anyhow::bail!(
                "store.backend must be 'memory' or 'persistent', got: {}",
                other
            ),
        }
    }

    fn validate_lock(&self) -> Result<()> {
        if self.lock.lease_ms == 0 {
            anyhow::bail!("lock.lease_ms must be > 0");
        }
        if self.lock.acquire_attempts == 0 {
            anyhow::bail!("lock.acquire_attempts must be > 0");
        }
        // A heartbeat that does not fire before the lease lapses lets a
        // second holder in mid-stream.
        if self.lock.heartbeat_interval_ms == 0
            || self.lock.heartbeat_interval_ms >= self.lock.lease_ms
        {
            anyhow::bail!(
                "lock.heartbeat_interval_ms ({}) must be > 0 and < lock.lease_ms ({})",
                self.lock.heartbeat_interval_ms,
                self.lock.lease_ms
            );
        }
        Ok(())
    }

    fn validate_coordinator(&self) -> Result<()> {
        if self.coordinator.max_key_len == 0 {
            anyhow::bail!("coordinator.max_key_len must be > 0");
        }
        if self.coordinator.record_ttl_seconds == 0 {
            anyhow::bail!("coordinator.record_ttl_seconds must be > 0");
        }
        if http::HeaderName::from_str(&self.coordinator.key_header).is_err() {
            anyhow::bail!(
                "coordinator.key_header is not a valid header name: {}",
                self.coordinator.key_header
            );
        }
        for method in &self.coordinator.protected_methods {
            http::Method::from_str(method)
                .with_context(|| format!("coordinator.protected_methods: invalid method {method}"))?;
        }
        for prefix in &self.coordinator.protected_paths {
            if !prefix.starts_with('/') {
                anyhow::bail!(
                    "coordinator.protected_paths entries must start with '/', got: {}",
                    prefix
                );
            }
        }
        Ok(())
    }

    fn validate_stream(&self) -> Result<()> {
        let max_duration_ms = self.stream.max_duration_ms;
        if max_duration_ms == 0 || max_duration_ms > MAX_STREAM_DURATION_MS {
            anyhow::bail!(
                "stream.max_duration_ms must be > 0 and <= {MAX_STREAM_DURATION_MS}, got: {}",
                self.stream.max_duration_ms
            );
        }
        if self.stream.keep_alive_interval_ms > self.stream.max_duration_ms {
            anyhow::bail!(
                "stream.keep_alive_interval_ms ({}) must be <= stream.max_duration_ms ({})",
                self.stream.keep_alive_interval_ms,
                self.stream.max_duration_ms
            );
        }
        if self.stream.channel_capacity == 0 {
            anyhow::bail!("stream.channel_capacity must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override storage directory (selects the persistent backend).
    pub storage_dir: Option<String>,
}
