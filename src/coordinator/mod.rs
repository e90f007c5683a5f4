//! Request coordinator.
//!
//! Invoked once per incoming request. Decides between:
//!
//! | Path        | When                                    | Operation runs? |
//! |-------------|-----------------------------------------|-----------------|
//! | passthrough | route not protected, no key, no owner   | yes             |
//! | rejected    | key empty or too long                   | no              |
//! | replay      | completed record exists                 | no              |
//! | conflict    | another execution holds the key         | no              |
//! | execute     | lock acquired                           | yes, once       |
//! | unguarded   | store failure (fail-open)               | yes             |
//!
//! - [`routes`] - protected routes and key validation
//! - [`reply`] - request, execution and reply types

mod guard;
pub mod reply;
pub mod routes;

pub use reply::{
    BufferedResponse, Disposition, Execution, Reply, ReplyBody, RequestMeta, REPLAY_HEADER,
};
pub use routes::{validate_key, ProtectedRoutes};

use crate::core::config::Config;
use crate::core::error::{IdemError, OperationError};
use crate::core::time::instant_after;
use crate::ops::metrics::CoordinatorMetrics;
use crate::store::{
    Begin, IdempotencyRecord, IdempotencyStore, RecordKey, ResponseSnapshot, SnapshotBody,
};
use crate::stream::reconciler::{Reconciler, StreamSettings};
use crate::stream::replay::replay_stream;
use guard::ExecutionGuard;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Route-level outcome, decided before the store is consulted.
enum Admission {
    Direct,
    Reject(IdemError),
    Guard(RecordKey),
}

/// The decision layer in front of protected operations.
pub struct Coordinator {
    store: Arc<IdempotencyStore>,
    routes: ProtectedRoutes,
    reconciler: Reconciler,
    metrics: Arc<CoordinatorMetrics>,
    lease: Duration,
    heartbeat: Duration,
    record_ttl: Duration,
    max_key_len: usize,
    captured_headers: Vec<String>,
}

impl Coordinator {
    /// Create a coordinator from configuration.
    pub fn from_config(config: &Config, store: Arc<IdempotencyStore>) -> Self {
        Self::with_metrics(config, store, Arc::new(CoordinatorMetrics::new()))
    }

    /// Create a coordinator that reports into `metrics`.
    pub fn with_metrics(
        config: &Config,
        store: Arc<IdempotencyStore>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            store,
            routes: ProtectedRoutes::from_config(&config.coordinator),
            reconciler: Reconciler::new(StreamSettings::from_config(config), metrics.clone()),
            metrics,
            lease: config.lock.lease(),
            heartbeat: config.lock.heartbeat_interval(),
            record_ttl: config.coordinator.record_ttl(),
            max_key_len: config.coordinator.max_key_len,
            captured_headers: config.coordinator.captured_headers.clone(),
        }
    }

    /// Replace the stream parameters.
    pub fn with_stream_settings(mut self, settings: StreamSettings) -> Self {
        self.reconciler = Reconciler::new(settings, self.metrics.clone());
        self
    }

    /// The store.
    pub fn store(&self) -> &Arc<IdempotencyStore> {
        &self.store
    }

    /// Metrics.
    pub fn metrics(&self) -> &Arc<CoordinatorMetrics> {
        &self.metrics
    }

    /// Protected routes.
    pub fn routes(&self) -> &ProtectedRoutes {
        &self.routes
    }

    /// Coordinate one request.
    ///
    /// `operation` is invoked at most once, and never on the replay,
    /// conflict and rejected paths. Its error is returned unmodified.
    /// The lease is renewed on every heartbeat while it runs.
    /// Dropping the returned future mid-execution aborts the execution.
    pub async fn handle<F, Fut>(
        &self,
        request: &RequestMeta,
        operation: F,
    ) -> Result<Reply, OperationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Execution, OperationError>>,
    {
        let key = match self.admit(request) {
            Admission::Direct => {
                self.metrics.record_passthrough();
                return self.run_unguarded(Disposition::Passthrough, operation).await;
            }
            Admission::Reject(error) => {
                self.metrics.record_rejected();
                tracing::debug!(path = %request.path, error = %error, "rejecting invalid idempotency key");
                return Ok(Reply::rejected(&error));
            }
            Admission::Guard(key) => key,
        };

        let begin = match self.store.begin(&key, self.lease).await {
            Ok(begin) => begin,
            Err(e) if e.is_fail_open() => {
                tracing::error!(
                    record = %key,
                    error = %e,
                    "idempotency store unavailable; executing without deduplication"
                );
                self.metrics.record_unguarded();
                return self.run_unguarded(Disposition::Unguarded, operation).await;
            }
            Err(e) => {
                tracing::error!(record = %key, error = %e, "idempotency check failed");
                return Err(OperationError::new(e.http_status().as_u16(), e.to_string()));
            }
        };

        match begin {
            Begin::Completed(record) => {
                self.metrics.record_replay();
                tracing::debug!(record = %key, "replaying completed execution");
                Ok(replay(&record))
            }
            Begin::Pending => {
                self.metrics.record_conflict();
                tracing::debug!(record = %key, "key in flight; rejecting");
                Ok(Reply::conflict())
            }
            Begin::Acquired(token) => {
                self.metrics.record_execute();
                tracing::debug!(record = %key, "executing under lock");
                let guard =
                    ExecutionGuard::new(self.store.clone(), key, token, self.metrics.clone());
                self.execute(guard, operation).await
            }
        }
    }

    fn admit(&self, request: &RequestMeta) -> Admission {
        if !self.routes.is_protected(&request.method, &request.path) {
            return Admission::Direct;
        }
        let Some(key) = request.idempotency_key.as_deref() else {
            return Admission::Direct;
        };
        if let Err(error) = validate_key(key, self.max_key_len) {
            return Admission::Reject(error);
        }
        match request.owner.as_deref() {
            Some(owner) if !owner.is_empty() => Admission::Guard(RecordKey::new(owner, key)),
            _ => {
                tracing::warn!(path = %request.path, "idempotency key without an owner; passing through");
                Admission::Direct
            }
        }
    }

    async fn execute<F, Fut>(
        &self,
        guard: ExecutionGuard,
        operation: F,
    ) -> Result<Reply, OperationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Execution, OperationError>>,
    {
        match self.run_renewing(&guard, operation()).await {
            Ok(Execution::Single(response)) => {
                if response.head.is_success() {
                    let snapshot = ResponseSnapshot::single(
                        response.head.retain_headers(&self.captured_headers),
                        response.body.clone(),
                    );
                    guard.complete(snapshot, self.record_ttl).await;
                } else {
                    tracing::debug!(status = response.head.status, "not caching non-success response");
                    guard.abort().await;
                }
                Ok(Reply::new(
                    Disposition::Executed,
                    response.head,
                    ReplyBody::Full(response.body),
                ))
            }
            Ok(Execution::Stream { head, frames }) => {
                let binding = if head.is_success() {
                    guard.into_binding()
                } else {
                    guard.abort().await;
                    None
                };
                let live = self.reconciler.spawn(head.clone(), frames, binding);
                Ok(Reply::new(
                    Disposition::Executed,
                    head,
                    ReplyBody::Stream(live),
                ))
            }
            Err(error) => {
                tracing::debug!(status = error.status, error = %error, "protected operation failed");
                guard.abort().await;
                Err(error)
            }
        }
    }

    /// Await the operation while renewing the lease on every heartbeat.
    async fn run_renewing<Fut>(
        &self,
        guard: &ExecutionGuard,
        operation: Fut,
    ) -> Result<Execution, OperationError>
    where
        Fut: Future<Output = Result<Execution, OperationError>>,
    {
        let period = self.heartbeat.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(instant_after(Instant::now(), period), period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(operation);

        let mut renewing = true;
        loop {
            tokio::select! {
                biased;
                result = &mut operation => return result,
                _ = heartbeat.tick(), if renewing => renewing = guard.renew(self.lease).await,
            }
        }
    }

    async fn run_unguarded<F, Fut>(
        &self,
        disposition: Disposition,
        operation: F,
    ) -> Result<Reply, OperationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Execution, OperationError>>,
    {
        Ok(match operation().await? {
            Execution::Single(response) => {
                Reply::new(disposition, response.head, ReplyBody::Full(response.body))
            }
            Execution::Stream { head, frames } => {
                let live = self.reconciler.spawn(head.clone(), frames, None);
                Reply::new(disposition, head, ReplyBody::Stream(live))
            }
        })
    }
}

fn replay(record: &IdempotencyRecord) -> Reply {
    let snapshot = &record.response;
    let head = snapshot.head.clone().with_header(REPLAY_HEADER, "true");
    let body = match &snapshot.body {
        SnapshotBody::Single { body } => ReplyBody::Full(body.clone()),
        SnapshotBody::Frames { .. } => ReplyBody::Stream(replay_stream(snapshot)),
    };
    Reply::new(Disposition::Replayed, head, body)
}
