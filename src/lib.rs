//! httpio - asynchronous outbound HTTP exchange core
//!
//! This crate drives the lifecycle of a single outbound HTTP POST exchange
//! on top of an external asynchronous transport provider. The provider
//! performs the actual network I/O (TCP, TLS, DNS, protocol framing) and
//! pushes discrete lifecycle events into the core; the core sequences
//! connection setup, chunked request-body transmission, response-header
//! decoding, streaming decompression of compressed bodies, and
//! cancellation.
//!
//! # Architecture
//!
//! - [`transport`] defines the provider contract: the commands the core
//!   issues and the [`TransportEvent`]s the provider delivers (possibly
//!   from worker threads outside the caller's control).
//! - [`request`] holds the caller-owned [`Request`]: target, payload,
//!   polled status, HTTP status code, and the append-only response sink.
//! - [`inflate`] is the streaming gzip adapter used when a response
//!   declares a compressed body.
//! - [`session`] ties it together: the [`Session`] serializes all event
//!   handling behind one lock, routes every provider event through a
//!   single dispatcher, and raises a level-triggered [`WakeSignal`] so an
//!   external event loop can multiplex on core activity.
//!
//! Callers submit with [`Session::post`], observe completion by polling
//! [`Request::status`], and may call [`Session::cancel`] at any time;
//! cancellation is idempotent and safe against events already queued by
//! the provider.

pub mod inflate;
pub mod request;
pub mod session;
pub mod transport;

mod exchange;

pub use request::{BodyKind, Request, ResponseSink, Status};
pub use session::{Session, TrafficObserver, Waiter, WakeSignal};
pub use transport::{
    ConnHandle, ExchangeToken, FaultKind, RequestHandle, SessionHandle, Timeouts, Transport,
    TransportError, TransportEvent,
};

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core errors
///
/// These never cross the public submission surface directly: a failed
/// exchange is reported through the request's terminal status, and every
/// mid-exchange error is routed into cancellation internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid target URL: {0}")]
    InvalidUrl(String),

    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("corrupt compressed stream: {0}")]
    Inflate(String),

    #[error("compressed stream ended after {produced} of {declared} declared bytes")]
    TruncatedStream { produced: usize, declared: usize },

    #[error("compressed stream exceeds the declared length of {declared} bytes")]
    OversizedStream { declared: usize },
}

/// Request bodies are handed to the transport in instalments of at most
/// this many bytes, so upload progress stays observable and a failed
/// write only loses a bounded chunk.
pub const POST_CHUNK_SIZE: usize = 1024 * 1024;

/// Poison-tolerant mutex lock: a panicking dispatcher thread must not
/// wedge the whole session.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
