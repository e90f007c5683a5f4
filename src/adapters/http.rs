//! HTTP boundary.
//!
//! Key extraction from request headers, conversion of coordinator replies
//! into `http::Response`, and SSE encoding of stream frames.

use crate::coordinator::{Reply, ReplyBody, RequestMeta};
use crate::stream::frame::{Frame, FrameKind};
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use http::StatusCode;
use std::fmt;
use std::pin::Pin;
use tokio_stream::{Stream, StreamExt};

/// Owner identity attached to a request by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

/// Coordinator metadata for an HTTP request.
///
/// The key is read from `key_header`; the owner from an [`Owner`]
/// request extension.
pub fn request_meta<B>(request: &http::Request<B>, key_header: &str) -> RequestMeta {
    let key = request
        .headers()
        .get(key_header)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let owner = request.extensions().get::<Owner>().map(|o| o.0.clone());
    RequestMeta {
        method: request.method().clone(),
        path: request.uri().path().to_string(),
        idempotency_key: key,
        owner,
    }
}

/// Response body produced from a reply.
pub enum HttpBody {
    /// Buffered body.
    Full(Bytes),
    /// SSE-encoded frames.
    Events(Pin<Box<dyn Stream<Item = Bytes> + Send>>),
}

impl HttpBody {
    /// Buffer the whole body.
    pub async fn collect(self) -> Bytes {
        match self {
            Self::Full(body) => body,
            Self::Events(mut events) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = events.next().await {
                    buf.extend_from_slice(&chunk);
                }
                buf.freeze()
            }
        }
    }
}

impl fmt::Debug for HttpBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(body) => f.debug_tuple("Full").field(body).finish(),
            Self::Events(_) => f.write_str("Events(..)"),
        }
    }
}

/// Convert a reply into an HTTP response.
///
/// Streamed bodies are SSE-encoded. Headers that are not valid HTTP are
/// dropped with a warning.
pub fn into_http_response(reply: Reply) -> http::Response<HttpBody> {
    let status = StatusCode::from_u16(reply.head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let streaming = reply.is_stream();

    let body = match reply.body {
        ReplyBody::Full(body) => HttpBody::Full(body),
        ReplyBody::Stream(frames) => HttpBody::Events(Box::pin(frames.map(|f| encode_sse(&f)))),
    };

    let mut response = http::Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in &reply.head.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "dropping invalid response header"),
        }
    }
    if streaming {
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        }
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
    response
}

/// Encode a frame as a server-sent event.
///
/// Keep-alives become SSE comments. Multi-line payloads are split across
/// `data:` lines.
pub fn encode_sse(frame: &Frame) -> Bytes {
    if frame.kind == FrameKind::KeepAlive {
        return Bytes::from_static(b": keep-alive\n\n");
    }
    let mut buf = BytesMut::with_capacity(frame.data.len() + 32);
    if let Some(event) = &frame.event {
        buf.put_slice(b"event: ");
        buf.put_slice(event.as_bytes());
        buf.put_u8(b'\n');
    }
    let payload = String::from_utf8_lossy(&frame.data);
    for line in payload.split('\n') {
        buf.put_slice(b"data: ");
        buf.put_slice(line.trim_end_matches('\r').as_bytes());
        buf.put_u8(b'\n');
    }
    buf.put_u8(b'\n');
    buf.freeze()
}
