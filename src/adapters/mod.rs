//! Transport adapters.
//!
//! Adapters translate a transport's request and response types to and from
//! the coordinator boundary ([`RequestMeta`](crate::coordinator::RequestMeta),
//! [`Reply`](crate::coordinator::Reply)). Currently implemented:
//! - [`http`] - `http` crate types with SSE encoding for streams

pub mod http;

pub use self::http::{encode_sse, into_http_response, request_meta, HttpBody, Owner};
