//! idemgate - idempotent request coordination.
//!
//! idemgate guarantees at-most-one effective execution of a non-idempotent
//! mutating operation per client-supplied key and owner. It covers
//! operations that return a single buffered response as well as operations
//! that produce a long-lived incremental stream: the stream is delivered to
//! the live caller unbuffered while an identical copy is captured for replay.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Transport adapters (http)                   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Request Coordinator                        │
//! │   passthrough │ replay │ conflict │ execute │ unguarded          │
//! └─────────────────────────────────────────────────────────────────┘
//!                  │                                  │
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │       Stream Reconciler      │   │      Idempotency Store       │
//! │  tee │ capture │ heartbeat   │──►│  memory │ persistent (files) │
//! └──────────────────────────────┘   └──────────────────────────────┘
//!                                                     │
//!                                   ┌──────────────────────────────┐
//!                                   │        Lock Primitive        │
//!                                   │   in-process │ lock files    │
//!                                   └──────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error types and HTTP mapping
//! - [`core::time`] - Clocks and deadline helpers
//!
//! ## Coordination
//! - [`lock`] - Lock primitive: leases, tokens, bounded retry
//! - [`store`] - Idempotency store and its backends
//! - [`stream`] - Frames, capture, tee task and replay
//! - [`coordinator`] - Per-request decision layer
//!
//! ## Boundary
//! - [`adapters::http`] - `http` request/response conversion, SSE encoding
//!
//! ## Operations
//! - [`ops::metrics`] - Coordinator counters
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - At most one live lock and at most one live record per `(owner, key)`
//! - Only the current token holder can complete or abort an execution
//! - A completed record is immutable until it expires; expired reads as absent
//! - Frames reach the live caller and the capture in the same order
//! - Failed, cancelled or oversized executions are never cached

// Core infrastructure
pub mod core;

// Lock primitive
pub mod lock;

// Idempotency store
pub mod store;

// Incremental results
pub mod stream;

// Decision layer
pub mod coordinator;

// Transport adapters
pub mod adapters;

// Operations and observability
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, time};
pub use coordinator::{Coordinator, Disposition, Execution, Reply, ReplyBody, RequestMeta};
pub use lock::{LockManager, LockTable, LockToken};
pub use ops::metrics;
pub use store::{Begin, IdempotencyStore, KeyStatus, RecordKey};
pub use stream::{Frame, FrameKind, FrameStream, LiveStream};
