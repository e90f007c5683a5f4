//! Cleanup guard for a held execution lock.

use crate::core::error::IdemError;
use crate::lock::LockToken;
use crate::ops::metrics::CoordinatorMetrics;
use crate::store::{IdempotencyStore, RecordKey, ResponseSnapshot};
use crate::stream::reconciler::CaptureBinding;
use std::sync::Arc;
use std::time::Duration;

/// Owns the lock token between `begin` and `complete`/`abort`.
///
/// Every exit path consumes the guard explicitly. If the coordinator
/// future is dropped mid-execution the guard aborts from its destructor
/// instead; outside a Tokio runtime the lease expiry does the cleanup.
pub(crate) struct ExecutionGuard {
    held: Option<Held>,
    metrics: Arc<CoordinatorMetrics>,
}

struct Held {
    store: Arc<IdempotencyStore>,
    key: RecordKey,
    token: LockToken,
}

impl ExecutionGuard {
    pub(crate) fn new(
        store: Arc<IdempotencyStore>,
        key: RecordKey,
        token: LockToken,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            held: Some(Held { store, key, token }),
            metrics,
        }
    }

    /// Record the result and release the lock.
    pub(crate) async fn complete(mut self, snapshot: ResponseSnapshot, ttl: Duration) {
        let Some(held) = self.held.take() else {
            return;
        };
        match held.store.complete(&held.key, &held.token, snapshot, ttl).await {
            Ok(_) => self.metrics.record_completed(),
            Err(IdemError::TokenMismatch { .. }) => self.metrics.record_token_mismatch(),
            Err(IdemError::AlreadyCompleted { .. }) => {}
            Err(e) => {
                tracing::error!(record = %held.key, error = %e, "failed to record completed execution");
                let _ = held.store.abort(&held.key, &held.token).await;
            }
        }
    }

    /// Release the lock without recording anything.
    pub(crate) async fn abort(mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        match held.store.abort(&held.key, &held.token).await {
            Ok(()) => self.metrics.record_aborted(),
            Err(IdemError::TokenMismatch { .. }) => self.metrics.record_token_mismatch(),
            Err(e) => {
                tracing::error!(record = %held.key, error = %e, "failed to release execution lock");
            }
        }
    }

    /// Extend the lease. Returns `false` once the lock has been lost and
    /// renewing further is pointless.
    pub(crate) async fn renew(&self, lease: Duration) -> bool {
        let Some(held) = &self.held else {
            return false;
        };
        match held.store.renew(&held.key, &held.token, lease).await {
            Ok(()) => {
                self.metrics.record_renewal();
                tracing::trace!(record = %held.key, "execution lease renewed");
                true
            }
            Err(IdemError::TokenMismatch { .. }) => {
                tracing::warn!(record = %held.key, "execution lost its lease");
                self.metrics.record_token_mismatch();
                false
            }
            Err(e) => {
                tracing::warn!(record = %held.key, error = %e, "execution lease renewal failed");
                true
            }
        }
    }

    /// Hand the lock over to a stream tee.
    pub(crate) fn into_binding(mut self) -> Option<CaptureBinding> {
        self.held.take().map(|held| CaptureBinding {
            store: held.store,
            key: held.key,
            token: held.token,
        })
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        tracing::debug!(record = %held.key, "execution cancelled; releasing lock");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let metrics = self.metrics.clone();
        handle.spawn(async move {
            match held.store.abort(&held.key, &held.token).await {
                Ok(()) => metrics.record_aborted(),
                Err(e) => {
                    tracing::warn!(record = %held.key, error = %e, "abort after cancellation failed");
                }
            }
        });
    }
}
