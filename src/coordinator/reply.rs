//! Request, execution and reply types at the coordinator boundary.

use crate::core::error::IdemError;
use crate::store::record::ResponseHead;
use crate::stream::frame::{Frame, FrameStream, LiveStream};
use bytes::Bytes;
use http::Method;
use std::fmt;
use tokio_stream::StreamExt;

/// Header added to every replayed response.
pub const REPLAY_HEADER: &str = "x-idempotency-replayed";

/// What the coordinator needs to know about an incoming request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// HTTP method.
    pub method: Method,
    /// Request path.
    pub path: String,
    /// Client-supplied idempotency key.
    pub idempotency_key: Option<String>,
    /// Owner identity resolved by authentication.
    pub owner: Option<String>,
}

impl RequestMeta {
    /// Create request metadata with no key and no owner.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            idempotency_key: None,
            owner: None,
        }
    }

    /// Set the idempotency key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set the owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// A single buffered response from a protected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedResponse {
    /// Status and headers.
    pub head: ResponseHead,
    /// Body bytes.
    pub body: Bytes,
}

/// Result of running a protected operation.
pub enum Execution {
    /// One buffered response.
    Single(BufferedResponse),
    /// An incremental result: the head is known up front, the frames follow.
    Stream {
        head: ResponseHead,
        frames: FrameStream,
    },
}

impl Execution {
    /// Buffered response.
    pub fn single(head: ResponseHead, body: impl Into<Bytes>) -> Self {
        Self::Single(BufferedResponse {
            head,
            body: body.into(),
        })
    }

    /// Incremental response.
    pub fn stream(head: ResponseHead, frames: FrameStream) -> Self {
        Self::Stream { head, frames }
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(response) => f.debug_tuple("Single").field(response).finish(),
            Self::Stream { head, .. } => f.debug_struct("Stream").field("head", head).finish(),
        }
    }
}

/// Which path the coordinator took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not subject to coordination; the operation ran directly.
    Passthrough,
    /// The operation ran under the lock.
    Executed,
    /// Answered from a completed record.
    Replayed,
    /// Another execution holds the key.
    Conflict,
    /// The key was invalid; nothing ran.
    Rejected,
    /// The store failed; the operation ran without the guarantee.
    Unguarded,
}

impl Disposition {
    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Executed => "executed",
            Self::Replayed => "replayed",
            Self::Conflict => "conflict",
            Self::Rejected => "rejected",
            Self::Unguarded => "unguarded",
        }
    }
}

/// Reply body.
pub enum ReplyBody {
    /// Buffered body.
    Full(Bytes),
    /// Frames delivered as they arrive.
    Stream(LiveStream),
}

impl fmt::Debug for ReplyBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(body) => f.debug_tuple("Full").field(body).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// What the coordinator hands back to the transport.
#[derive(Debug)]
pub struct Reply {
    /// Path taken.
    pub disposition: Disposition,
    /// Status and headers.
    pub head: ResponseHead,
    /// Body.
    pub body: ReplyBody,
}

impl Reply {
    /// Create a reply.
    pub fn new(disposition: Disposition, head: ResponseHead, body: ReplyBody) -> Self {
        Self {
            disposition,
            head,
            body,
        }
    }

    /// 409 reply for a key held by another execution.
    pub fn conflict() -> Self {
        let body = serde_json::json!({
            "error": "Request is being processed",
            "code": IdemError::LockBusy { key: String::new() }.code(),
        });
        Self::json(Disposition::Conflict, 409, &body)
    }

    /// 400 reply for an invalid key.
    pub fn rejected(error: &IdemError) -> Self {
        let body = serde_json::json!({
            "error": error.to_string(),
            "code": error.code(),
        });
        Self::json(
            Disposition::Rejected,
            error.http_status().as_u16(),
            &body,
        )
    }

    fn json(disposition: Disposition, status: u16, body: &serde_json::Value) -> Self {
        Self::new(
            disposition,
            ResponseHead::new(status).with_header("content-type", "application/json"),
            ReplyBody::Full(Bytes::from(body.to_string())),
        )
    }

    /// HTTP status.
    pub fn status(&self) -> u16 {
        self.head.status
    }

    /// Check if this reply came from a completed record.
    pub fn is_replay(&self) -> bool {
        self.disposition == Disposition::Replayed
    }

    /// Check if the body is a stream.
    pub fn is_stream(&self) -> bool {
        matches!(self.body, ReplyBody::Stream(_))
    }

    /// Buffered body, if any.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            ReplyBody::Full(body) => Some(body),
            ReplyBody::Stream(_) => None,
        }
    }

    /// Drain a streamed body. A buffered body yields no frames.
    pub async fn collect_frames(self) -> Vec<Frame> {
        match self.body {
            ReplyBody::Full(_) => Vec::new(),
            ReplyBody::Stream(stream) => stream.collect().await,
        }
    }
}
