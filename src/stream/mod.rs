//! Incremental results.
//!
//! - [`frame`] - frame model and stream types
//! - [`capture`] - capture buffer for an in-flight stream
//! - [`reconciler`] - tee task: live forwarding, capture, lease heartbeat
//! - [`replay`] - replay of a captured stream

pub mod capture;
pub mod frame;
pub mod reconciler;
pub mod replay;

pub use capture::StreamCapture;
pub use frame::{frames_from_iter, Frame, FrameKind, FrameStream, LiveStream, SequencedFrame};
pub use reconciler::{CaptureBinding, Reconciler, StreamSettings};
pub use replay::replay_stream;
