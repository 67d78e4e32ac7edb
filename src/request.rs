//! Caller-owned request state
//!
//! A [`Request`] is created by the caller, submitted through
//! [`crate::Session::post`], and then observed by polling [`Request::status`]
//! until it reaches a terminal value. The core mutates the status, the
//! HTTP status code, the declared content length, and the response sink;
//! it never takes ownership of the request itself.
//!
//! Because the transport delivers events on worker threads, the polled
//! fields are atomics and the response sink sits behind its own lock.

use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;

use crate::transport::ExchangeToken;

/// Sentinel for "no declared content length".
const LENGTH_UNKNOWN: u64 = u64::MAX;

/// Exchange status as observed by the caller
///
/// Transitions are monotonic: `Inflight` moves to exactly one of
/// `Success` or `Failure`, and a terminal value only changes through a
/// fresh submission.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Not submitted, or reset by a fresh submission.
    Ready = 0,
    /// Submitted; the transport is working on it.
    Inflight = 1,
    /// Completed with HTTP status 200.
    Success = 2,
    /// Failed, was cancelled, or completed with a non-200 status.
    Failure = 3,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            0 => Status::Ready,
            1 => Status::Inflight,
            2 => Status::Success,
            _ => Status::Failure,
        }
    }

    /// Check whether the exchange has finished, either way.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failure)
    }
}

/// Kind of payload carried by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// Structured call: sent as `application/json`, compressed responses
    /// accepted.
    Json,
    /// Pre-serialized binary payload: sent as `application/octet-stream`,
    /// response decompression disabled.
    Raw,
}

/// Append-only response buffer with reserve/commit semantics
///
/// The dispatcher reserves space before issuing a read and commits the
/// transferred length when the read completes, so a short read never
/// leaves stale bytes visible. When a response is being decompressed the
/// sink is pre-sized to the declared original length once and the
/// inflate adapter writes into the leased tail directly.
#[derive(Debug)]
pub struct ResponseSink {
    buf: Vec<u8>,
    len: usize,
    raw: bool,
}

impl ResponseSink {
    fn growable() -> Self {
        ResponseSink {
            buf: Vec::new(),
            len: 0,
            raw: false,
        }
    }

    fn preallocated(capacity: usize) -> Self {
        ResponseSink {
            buf: Vec::with_capacity(capacity),
            len: 0,
            raw: true,
        }
    }

    /// Make room for `extra` more bytes and expose the writable region.
    pub fn reserve(&mut self, extra: usize) -> &mut [u8] {
        let needed = self.len + extra;
        if self.buf.len() < needed {
            self.buf.resize(needed, 0);
        }
        &mut self.buf[self.len..needed]
    }

    /// Append `n` bytes previously written into a reserved region.
    pub fn commit(&mut self, n: usize) {
        self.len = (self.len + n).min(self.buf.len());
    }

    /// Size the buffer to hold exactly `total` more bytes and leave the
    /// whole region leased for direct writes.
    pub(crate) fn presize(&mut self, total: usize) {
        self.buf.resize(self.len + total, 0);
    }

    /// The currently leased tail: everything reserved but not committed.
    pub(crate) fn lease(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.buf[len..]
    }

    /// The committed response bytes.
    pub fn committed(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Committed length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the caller supplied a pre-sized raw destination.
    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub(crate) fn reset(&mut self) {
        self.len = 0;
    }

    pub(crate) fn take(&mut self) -> Vec<u8> {
        self.buf.truncate(self.len);
        self.len = 0;
        std::mem::take(&mut self.buf)
    }
}

/// One logical outbound HTTP POST exchange
///
/// Owned by the caller for its whole life; a fresh submission reuses the
/// same object. Cheap to share across threads behind an `Arc`.
pub struct Request {
    url: String,
    kind: BodyKind,
    payload: Bytes,
    status: AtomicU8,
    http_status: AtomicU16,
    content_length: AtomicU64,
    sink: Mutex<ResponseSink>,
    exchange: Mutex<Option<ExchangeToken>>,
}

impl Request {
    /// A structured (JSON) call. The payload is the serialized document.
    pub fn json(url: impl Into<String>, payload: impl Into<Bytes>) -> Request {
        Request::with_sink(url.into(), BodyKind::Json, payload.into(), ResponseSink::growable())
    }

    /// A raw binary upload expecting about `response_size` bytes back.
    /// The response is stored verbatim; compression headers are ignored.
    pub fn raw(
        url: impl Into<String>,
        payload: impl Into<Bytes>,
        response_size: usize,
    ) -> Request {
        Request::with_sink(
            url.into(),
            BodyKind::Raw,
            payload.into(),
            ResponseSink::preallocated(response_size),
        )
    }

    fn with_sink(url: String, kind: BodyKind, payload: Bytes, sink: ResponseSink) -> Request {
        Request {
            url,
            kind,
            payload,
            status: AtomicU8::new(Status::Ready as u8),
            http_status: AtomicU16::new(0),
            content_length: AtomicU64::new(LENGTH_UNKNOWN),
            sink: Mutex::new(sink),
            exchange: Mutex::new(None),
        }
    }

    /// Target URL as given by the caller.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Payload kind, which selects the request headers.
    pub fn kind(&self) -> BodyKind {
        self.kind
    }

    /// The request body.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Current exchange status.
    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// HTTP status code of the response, or 0 before headers arrive and
    /// after cancellation.
    pub fn http_status(&self) -> u16 {
        self.http_status.load(Ordering::SeqCst)
    }

    /// Declared (pre-compression) response length, once known.
    pub fn content_length(&self) -> Option<u64> {
        match self.content_length.load(Ordering::SeqCst) {
            LENGTH_UNKNOWN => None,
            length => Some(length),
        }
    }

    /// Committed response length so far.
    pub fn body_len(&self) -> usize {
        crate::lock(&self.sink).len()
    }

    /// Remove and return the response body accumulated so far.
    pub fn take_body(&self) -> Vec<u8> {
        crate::lock(&self.sink).take()
    }

    /// Reset for a fresh submission. Refused while an exchange is active.
    pub(crate) fn try_reset(&self) -> bool {
        loop {
            let current = self.status.load(Ordering::SeqCst);
            if current == Status::Inflight as u8 {
                return false;
            }
            if self
                .status
                .compare_exchange(current, Status::Ready as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        self.http_status.store(0, Ordering::SeqCst);
        self.content_length.store(LENGTH_UNKNOWN, Ordering::SeqCst);
        crate::lock(&self.sink).reset();
        true
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Transition `Inflight` to a terminal status. Returns false if the
    /// exchange already finished; terminal values never regress.
    pub(crate) fn finish(&self, terminal: Status) -> bool {
        self.status
            .compare_exchange(
                Status::Inflight as u8,
                terminal as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Cancellation path: fail the exchange and drop the HTTP status, but
    /// only if it is still in flight.
    pub(crate) fn abort(&self) {
        if self.finish(Status::Failure) {
            self.http_status.store(0, Ordering::SeqCst);
        }
    }

    pub(crate) fn set_http_status(&self, code: u16) {
        self.http_status.store(code, Ordering::SeqCst);
    }

    pub(crate) fn set_content_length(&self, length: u64) {
        self.content_length.store(length, Ordering::SeqCst);
    }

    pub(crate) fn sink(&self) -> MutexGuard<'_, ResponseSink> {
        crate::lock(&self.sink)
    }

    pub(crate) fn attach(&self, token: ExchangeToken) {
        *crate::lock(&self.exchange) = Some(token);
    }

    pub(crate) fn detach(&self) {
        *crate::lock(&self.exchange) = None;
    }

    pub(crate) fn token(&self) -> Option<ExchangeToken> {
        *crate::lock(&self.exchange)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url)
            .field("kind", &self.kind)
            .field("payload_len", &self.payload.len())
            .field("status", &self.status())
            .field("http_status", &self.http_status())
            .finish()
    }
}
