//! Stream reconciler: the tee between a producer, the live caller and the
//! capture buffer.
//!
//! One task per stream. Each producer frame is forwarded to the caller
//! first and recorded second, in the same order on both sides. The task
//! owns the lock token for the whole stream and is the only party that
//! calls `complete` or `abort` for it.
//!
//! ```text
//!                  ┌──────────────► live caller (bounded channel)
//!   producer ──► tee task
//!                  └──────────────► StreamCapture ──► complete / abort
//! ```
//!
//! The task also renews the lease on a heartbeat, emits keep-alive frames
//! while the producer is idle, and cuts the stream off at its maximum
//! duration. A caller that drops its end cancels the stream.

use super::capture::StreamCapture;
use super::frame::{Frame, FrameKind, FrameStream, LiveStream};
use crate::core::config::Config;
use crate::core::error::{IdemError, OperationError};
use crate::core::time::instant_after;
use crate::lock::LockToken;
use crate::ops::metrics::CoordinatorMetrics;
use crate::store::{IdempotencyStore, RecordKey, ResponseHead};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Stream handling parameters.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Hard limit on stream duration.
    pub max_duration: Duration,
    /// Idle time before a keep-alive frame; `None` disables keep-alives.
    pub keep_alive: Option<Duration>,
    /// Capture size limit in bytes.
    pub max_capture_bytes: usize,
    /// Live-forward channel capacity.
    pub channel_capacity: usize,
    /// Lease renewal interval.
    pub heartbeat: Duration,
    /// Lease granted by each renewal.
    pub lease: Duration,
    /// Lifetime of the completed record.
    pub record_ttl: Duration,
    /// Response headers kept in the snapshot.
    pub captured_headers: Vec<String>,
}

impl StreamSettings {
    /// Settings from configuration.
    pub fn from_config(config: &Config) -> Self {
        let keep_alive = match config.stream.keep_alive_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Self {
            max_duration: Duration::from_millis(config.stream.max_duration_ms),
            keep_alive,
            max_capture_bytes: config.stream.max_capture_bytes,
            channel_capacity: config.stream.channel_capacity.max(1),
            heartbeat: config.lock.heartbeat_interval(),
            lease: config.lock.lease(),
            record_ttl: config.coordinator.record_ttl(),
            captured_headers: config.coordinator.captured_headers.clone(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Lock held on behalf of a stream: where and under which token the
/// result is recorded.
pub struct CaptureBinding {
    /// Store that receives `complete` or `abort`.
    pub store: Arc<IdempotencyStore>,
    /// Record identity.
    pub key: RecordKey,
    /// Token returned by `begin`.
    pub token: LockToken,
}

/// Spawns tee tasks.
#[derive(Clone)]
pub struct Reconciler {
    settings: StreamSettings,
    metrics: Arc<CoordinatorMetrics>,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(settings: StreamSettings, metrics: Arc<CoordinatorMetrics>) -> Self {
        Self { settings, metrics }
    }

    /// Stream parameters.
    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Start forwarding `frames` and return the live side.
    ///
    /// With a binding the stream is captured and recorded on success;
    /// without one it is only forwarded. Must be called within a Tokio
    /// runtime.
    pub fn spawn(
        &self,
        head: ResponseHead,
        frames: FrameStream,
        binding: Option<CaptureBinding>,
    ) -> LiveStream {
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity);
        let settings = self.settings.clone();

        let now = Instant::now();
        let period = settings.heartbeat.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(instant_after(now, period), period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let keep_alive_at =
            instant_after(now, settings.keep_alive.unwrap_or(settings.max_duration));

        let tee = Tee {
            head,
            frames,
            renewing: binding.is_some(),
            binding,
            capture: StreamCapture::new(settings.max_capture_bytes),
            tx,
            deadline: Box::pin(tokio::time::sleep_until(instant_after(
                now,
                settings.max_duration,
            ))),
            heartbeat,
            keep_alive: Box::pin(tokio::time::sleep_until(keep_alive_at)),
            settings,
            metrics: self.metrics.clone(),
        };

        self.metrics.stream_opened();
        tokio::spawn(tee.run());
        Box::pin(ReceiverStream::new(rx))
    }
}

/// How a stream ended.
#[derive(Debug)]
enum Ending {
    Completed,
    Failed(OperationError),
    Incomplete,
    TimedOut,
    Cancelled,
}

struct Tee {
    head: ResponseHead,
    frames: FrameStream,
    binding: Option<CaptureBinding>,
    capture: StreamCapture,
    renewing: bool,
    tx: mpsc::Sender<Frame>,
    deadline: Pin<Box<Sleep>>,
    heartbeat: Interval,
    keep_alive: Pin<Box<Sleep>>,
    settings: StreamSettings,
    metrics: Arc<CoordinatorMetrics>,
}

impl Tee {
    async fn run(mut self) {
        let ending = self.pump().await;
        self.finish(ending).await;
        self.metrics.stream_closed();
    }

    async fn pump(&mut self) -> Ending {
        loop {
            tokio::select! {
                biased;
                _ = self.tx.closed() => return Ending::Cancelled,
                _ = &mut self.deadline => return Ending::TimedOut,
                _ = self.heartbeat.tick(), if self.renewing => self.renew().await,
                _ = &mut self.keep_alive, if self.settings.keep_alive.is_some() => {
                    self.send_keep_alive();
                }
                item = self.frames.next() => {
                    let frame = match item {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => return Ending::Failed(e),
                        None => return Ending::Incomplete,
                    };
                    match frame.kind {
                        FrameKind::Data => self.record(&frame),
                        FrameKind::Terminal => self.capture.finalize(&frame),
                        FrameKind::KeepAlive => {}
                        FrameKind::Error => {
                            return Ending::Failed(OperationError::new(
                                502,
                                "producer emitted an error frame",
                            ));
                        }
                    }

                    let terminal = frame.is_terminal();
                    if let Err(ending) = self.forward(frame).await {
                        // The result is whole once the terminal frame is
                        // captured, whether or not the caller saw it.
                        if terminal && matches!(ending, Ending::Cancelled) {
                            return Ending::Completed;
                        }
                        return ending;
                    }
                    if terminal {
                        return Ending::Completed;
                    }
                    self.reset_keep_alive();
                }
            }
        }
    }

    fn record(&mut self, frame: &Frame) {
        if self.binding.is_none() || self.capture.is_poisoned() {
            return;
        }
        if !self.capture.append(frame) {
            self.metrics.record_capture_overflow();
        }
    }

    /// Deliver one frame to the caller, renewing the lease while waiting
    /// for channel capacity.
    async fn forward(&mut self, frame: Frame) -> Result<(), Ending> {
        loop {
            tokio::select! {
                biased;
                permit = self.tx.clone().reserve_owned() => {
                    return match permit {
                        Ok(permit) => {
                            permit.send(frame);
                            Ok(())
                        }
                        Err(_) => Err(Ending::Cancelled),
                    };
                }
                _ = &mut self.deadline => return Err(Ending::TimedOut),
                _ = self.heartbeat.tick(), if self.renewing => self.renew().await,
            }
        }
    }

    fn send_keep_alive(&mut self) {
        // A full channel already has output pending for the caller.
        let _ = self.tx.try_send(Frame::keep_alive());
        self.reset_keep_alive();
    }

    fn reset_keep_alive(&mut self) {
        if let Some(interval) = self.settings.keep_alive {
            self.keep_alive.as_mut().reset(instant_after(Instant::now(), interval));
        }
    }

    async fn renew(&mut self) {
        let Some(binding) = &self.binding else {
            self.renewing = false;
            return;
        };
        match binding
            .store
            .renew(&binding.key, &binding.token, self.settings.lease)
            .await
        {
            Ok(()) => {
                self.metrics.record_renewal();
                tracing::trace!(record = %binding.key, "stream lease renewed");
            }
            Err(IdemError::TokenMismatch { .. }) => {
                tracing::warn!(
                    record = %binding.key,
                    "stream lost its lease; result will not be cached"
                );
                self.metrics.record_token_mismatch();
                self.capture.poison();
                self.renewing = false;
            }
            Err(e) => {
                tracing::warn!(record = %binding.key, error = %e, "stream lease renewal failed");
            }
        }
    }

    async fn finish(&mut self, ending: Ending) {
        let error = match ending {
            Ending::Completed => {
                self.complete().await;
                return;
            }
            Ending::Cancelled => {
                tracing::debug!(captured = self.capture.len(), "caller disconnected mid-stream");
                self.abort("caller disconnect").await;
                return;
            }
            Ending::Failed(error) => {
                tracing::warn!(status = error.status, error = %error, "stream producer failed");
                error
            }
            Ending::Incomplete => {
                tracing::warn!("stream ended without a terminal frame");
                OperationError::incomplete_stream()
            }
            Ending::TimedOut => {
                tracing::warn!(
                    max_duration_ms = self.settings.max_duration.as_millis() as u64,
                    "stream exceeded its maximum duration"
                );
                OperationError::stream_timeout()
            }
        };

        self.abort("stream failure").await;
        let _ = self.tx.send(Frame::error(&error)).await;
    }

    async fn complete(&mut self) {
        let Some(binding) = self.binding.take() else {
            return;
        };
        let capture = std::mem::replace(&mut self.capture, StreamCapture::new(0));
        let frames = capture.len();
        let head = self.head.retain_headers(&self.settings.captured_headers);

        let Some(snapshot) = capture.into_snapshot(head) else {
            tracing::debug!(record = %binding.key, "capture unusable; aborting instead of caching");
            self.binding = Some(binding);
            self.abort("unusable capture").await;
            return;
        };

        let result = binding
            .store
            .complete(&binding.key, &binding.token, snapshot, self.settings.record_ttl)
            .await;
        match result {
            Ok(_) => {
                self.metrics.record_completed();
                tracing::debug!(record = %binding.key, frames, "stream completed and cached");
            }
            Err(IdemError::TokenMismatch { .. }) => self.metrics.record_token_mismatch(),
            Err(IdemError::AlreadyCompleted { .. }) => {}
            Err(e) => {
                tracing::error!(record = %binding.key, error = %e, "failed to record completed stream");
                let _ = binding.store.abort(&binding.key, &binding.token).await;
            }
        }
    }

    async fn abort(&mut self, reason: &'static str) {
        let Some(binding) = self.binding.take() else {
            return;
        };
        match binding.store.abort(&binding.key, &binding.token).await {
            Ok(()) => self.metrics.record_aborted(),
            Err(IdemError::TokenMismatch { .. }) => self.metrics.record_token_mismatch(),
            Err(e) => {
                tracing::error!(record = %binding.key, reason, error = %e, "failed to release stream lock");
            }
        }
    }
}
