//! Transport provider contract
//!
//! The core does not perform network I/O itself. It issues commands to an
//! external asynchronous provider through the [`Transport`] trait and is
//! driven by the lifecycle events the provider pushes back through
//! [`crate::Session::dispatch`]. The provider may deliver events from
//! worker threads outside the caller's control; the session serializes
//! them.
//!
//! Two rules bind implementations:
//!
//! - Commands must not block on network I/O. They submit work and return;
//!   completion arrives as an event.
//! - Events must not be delivered synchronously from inside a command
//!   call. The session lock is held across command submission and
//!   dispatch would deadlock.

use std::time::Duration;

/// Result type for provider operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Opaque provider failure
///
/// The core does not interpret provider errors beyond routing the
/// affected exchange into cancellation, so a message is all it carries.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Provider-scoped session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// Provider-scoped connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u64);

/// Provider-scoped request handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// Token identifying one exchange to the dispatcher
///
/// Minted by the session at submission and registered with the provider,
/// which passes it back verbatim with every event for that request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeToken(pub u64);

/// Lifecycle events pushed by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// Response bytes are buffered and ready to read; size 0 means the
    /// transfer is complete.
    DataAvailable(usize),
    /// A read command finished, transferring this many bytes.
    ReadComplete(usize),
    /// Response headers can now be queried.
    HeadersAvailable,
    /// The request failed inside the provider.
    RequestError(FaultKind),
    /// The secure channel could not be established or broke down.
    SecureFailure,
    /// The initial send command (headers + first body chunk) completed.
    SendComplete,
    /// A write command for a follow-up body chunk completed.
    WriteComplete,
    /// The provider is tearing down the request handle; no further events
    /// will follow for this token.
    HandleClosing,
}

/// Classification of a request-error event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// One of the operation timeouts configured at submission expired.
    Timeout,
    /// Any other provider fault, carrying the provider's error code.
    Other(u32),
}

/// Event-mask flags for [`Transport::register`]
pub const EVENT_DATA_AVAILABLE: u32 = 1 << 0;
pub const EVENT_READ_COMPLETE: u32 = 1 << 1;
pub const EVENT_HEADERS_AVAILABLE: u32 = 1 << 2;
pub const EVENT_REQUEST_ERROR: u32 = 1 << 3;
pub const EVENT_SECURE_FAILURE: u32 = 1 << 4;
pub const EVENT_SEND_COMPLETE: u32 = 1 << 5;
pub const EVENT_WRITE_COMPLETE: u32 = 1 << 6;
pub const EVENT_HANDLE_CLOSING: u32 = 1 << 7;

/// The full lifecycle set; every exchange registers for all of it.
pub const EVENT_LIFECYCLE: u32 = EVENT_DATA_AVAILABLE
    | EVENT_READ_COMPLETE
    | EVENT_HEADERS_AVAILABLE
    | EVENT_REQUEST_ERROR
    | EVENT_SECURE_FAILURE
    | EVENT_SEND_COMPLETE
    | EVENT_WRITE_COMPLETE
    | EVENT_HANDLE_CLOSING;

/// Request-side header names and values
pub const CONTENT_TYPE: &str = "Content-Type";
pub const ACCEPT_ENCODING: &str = "Accept-Encoding";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";
pub const ENCODING_GZIP: &str = "gzip";

/// Response-side header carrying the pre-compression body length.
/// Always present when the peer compresses the response.
pub const ORIGINAL_CONTENT_LENGTH: &str = "Original-Content-Length";

/// Standard response-side content-encoding header.
pub const CONTENT_ENCODING: &str = "Content-Encoding";

/// Per-request operation timeouts
///
/// Fixed operational policy, not caller-tunable: name resolution is
/// unbounded, connect and send get 20 seconds, receive gets 30 minutes.
/// `None` means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub resolve: Option<Duration>,
    pub connect: Option<Duration>,
    pub send: Option<Duration>,
    pub receive: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            resolve: None,
            connect: Some(Duration::from_secs(20)),
            send: Some(Duration::from_secs(20)),
            receive: Some(Duration::from_secs(1800)),
        }
    }
}

/// Asynchronous transport provider
///
/// One implementation serves all exchanges on a session. Handle values
/// are opaque to the core; it only stores them and passes them back.
pub trait Transport: Send + Sync {
    /// One-time session setup with the negotiated user agent.
    fn open_session(&self, user_agent: &str) -> TransportResult<SessionHandle>;

    /// Establish a logical connection to `host:port`.
    fn connect(&self, session: SessionHandle, host: &str, port: u16) -> TransportResult<ConnHandle>;

    /// Open a POST request against `path`, with TLS framing if `secure`.
    fn open_request(&self, conn: ConnHandle, path: &str, secure: bool)
        -> TransportResult<RequestHandle>;

    /// Configure the per-operation timeouts for this request.
    fn set_timeouts(&self, request: RequestHandle, timeouts: Timeouts) -> TransportResult<()>;

    /// Associate `token` with this request handle and subscribe to the
    /// events in `events` (a bitwise OR of the `EVENT_*` flags).
    fn register(&self, request: RequestHandle, token: ExchangeToken, events: u32)
        -> TransportResult<()>;

    /// Begin the exchange: transmit `headers` and the first body chunk,
    /// declaring `total_len` so the provider can frame the full body
    /// while receiving it incrementally.
    fn send(
        &self,
        request: RequestHandle,
        headers: &[(&str, &str)],
        initial: &[u8],
        total_len: usize,
    ) -> TransportResult<()>;

    /// Transmit a follow-up body chunk; completes with a write-complete
    /// event.
    fn write(&self, request: RequestHandle, chunk: &[u8]) -> TransportResult<()>;

    /// Ask how much response data is buffered; answered by a
    /// data-available event.
    fn query_available(&self, request: RequestHandle) -> TransportResult<()>;

    /// Copy already-buffered response bytes into `buf`, returning the
    /// number copied. The provider still delivers the matching
    /// read-complete event with the transferred length.
    fn read(&self, request: RequestHandle, buf: &mut [u8]) -> TransportResult<usize>;

    /// Switch from sending to receiving; headers arrive as a
    /// headers-available event.
    fn receive_response(&self, request: RequestHandle) -> TransportResult<()>;

    /// Numeric HTTP status of the response. Valid once headers are
    /// available.
    fn status_code(&self, request: RequestHandle) -> TransportResult<u16>;

    /// Look up a response header by name. Valid once headers are
    /// available.
    fn header(&self, request: RequestHandle, name: &str) -> TransportResult<Option<String>>;

    /// Tear down a request handle. The provider delivers a final
    /// handle-closing event for its token afterwards.
    fn close_request(&self, request: RequestHandle);

    /// Tear down a connection handle.
    fn close_connection(&self, conn: ConnHandle);

    /// Tear down the session handle.
    fn close_session(&self, session: SessionHandle);
}
