//! Stream frames.
//!
//! Frame payloads are opaque bytes: the reconciler forwards and records
//! them verbatim and never interprets their content.

use crate::core::error::OperationError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Role of a frame within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Incremental output.
    Data,
    /// Normal completion; exactly one per successful stream.
    Terminal,
    /// Emitted by the reconciler when the stream fails.
    Error,
    /// Idle filler for the live caller; never captured.
    KeepAlive,
}

/// A single stream frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame role.
    pub kind: FrameKind,

    /// Optional event name (e.g. SSE `event:` field).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    /// Opaque payload.
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
}

impl Frame {
    /// Create a data frame.
    pub fn data(event: Option<&str>, data: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Data,
            event: event.map(str::to_string),
            data: data.into(),
        }
    }

    /// Create a terminal frame.
    pub fn terminal(event: Option<&str>, data: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Terminal,
            event: event.map(str::to_string),
            data: data.into(),
        }
    }

    /// Create the error frame that ends a failed stream.
    pub fn error(error: &OperationError) -> Self {
        let body = serde_json::json!({
            "message": error.message,
            "status": error.status,
        });
        Self {
            kind: FrameKind::Error,
            event: Some("error".to_string()),
            data: Bytes::from(body.to_string()),
        }
    }

    /// Create a keep-alive frame.
    pub fn keep_alive() -> Self {
        Self {
            kind: FrameKind::KeepAlive,
            event: None,
            data: Bytes::new(),
        }
    }

    /// Check if this is the terminal frame.
    pub fn is_terminal(&self) -> bool {
        self.kind == FrameKind::Terminal
    }

    /// Approximate in-memory size, used for capture limits.
    pub fn size_hint(&self) -> usize {
        self.data.len() + self.event.as_ref().map_or(0, String::len)
    }
}

/// A captured frame with its position in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedFrame {
    /// Monotonically increasing position, starting at 0.
    pub sequence: u64,
    /// The frame as produced.
    pub frame: Frame,
}

/// Producer side: frames from the protected operation.
///
/// Items are `Data` frames followed by exactly one `Terminal` frame.
/// `Err` signals failure.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, OperationError>> + Send>>;

/// Consumer side: frames delivered to the caller.
pub type LiveStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

/// Build a [`FrameStream`] from an in-memory list of items.
pub fn frames_from_iter<I>(items: I) -> FrameStream
where
    I: IntoIterator<Item = Result<Frame, OperationError>>,
    I::IntoIter: Send + 'static,
{
    Box::pin(tokio_stream::iter(items))
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
