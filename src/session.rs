//! Session-level orchestration
//!
//! A [`Session`] owns the transport session handle, the table of live
//! exchanges, the session-wide lock that serializes all event handling,
//! and the level-triggered wake signal an external event loop can block
//! on. The transport may deliver events from arbitrary worker threads;
//! every path through [`Session::dispatch`] takes the lock before
//! touching exchange state and releases it before returning.
//!
//! The caller's side of the contract is small: [`Session::post`] to
//! submit, [`Request::status`](crate::Request::status) to poll, and
//! [`Session::cancel`] at any time. Cancellation severs the exchange's
//! link to the request, so events the transport already queued become
//! no-ops instead of racing the teardown.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use url::Url;

use crate::exchange::Exchange;
use crate::inflate::GzipInflater;
use crate::request::{BodyKind, Request, Status};
use crate::transport::{
    ExchangeToken, FaultKind, RequestHandle, SessionHandle, Timeouts, Transport, TransportEvent,
    ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM,
    ENCODING_GZIP, EVENT_LIFECYCLE, ORIGINAL_CONTENT_LENGTH,
};
use crate::{lock, Error, Result};

/// Level-triggered wake indicator
///
/// Raised by the session whenever dispatcher activity produced state
/// worth observing; stays raised until taken. An external event loop
/// registers it through a [`Waiter`] and multiplexes it alongside its
/// other wake sources.
pub struct WakeSignal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> WakeSignal {
        WakeSignal {
            raised: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Set the indicator and wake any blocked waiters.
    pub fn raise(&self) {
        *lock(&self.raised) = true;
        self.cond.notify_all();
    }

    /// Read the indicator without clearing it.
    pub fn is_raised(&self) -> bool {
        *lock(&self.raised)
    }

    /// Read and clear the indicator in one step.
    pub fn take(&self) -> bool {
        std::mem::replace(&mut *lock(&self.raised), false)
    }

    /// Block until the indicator is raised or `timeout` elapses. Returns
    /// the indicator state; does not clear it.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut raised = lock(&self.raised);
        while !*raised {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(raised, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            raised = guard;
        }
        *raised
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// External event-loop integration
pub trait Waiter: Send + Sync {
    /// Called once at registration with the session's wake signal, so
    /// the loop can multiplex it alongside its other wake sources.
    fn add_wake_source(&self, signal: Arc<WakeSignal>, interest: u32);

    /// Connectivity status report: `true` once response headers prove
    /// the peer reachable, `false` on a non-timeout transport fault.
    /// Invoked with the session lock held; implementations must not call
    /// back into the session.
    fn notify_connectivity(&self, reachable: bool);
}

/// Byte-level tracing hook, injected at construction
pub trait TrafficObserver: Send + Sync {
    /// The payload about to be transmitted for `request`.
    fn outgoing(&self, request: &Request, payload: &[u8]);

    /// The complete response body received for `request`.
    fn incoming(&self, request: &Request, body: &[u8]);
}

/// Parsed submission target
struct Target {
    host: String,
    port: u16,
    path: String,
    secure: bool,
}

fn parse_target(url: &str) -> Result<Target> {
    let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
    let secure = match parsed.scheme() {
        "https" => true,
        "http" => false,
        other => return Err(Error::InvalidUrl(format!("unsupported scheme: {other}"))),
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::InvalidUrl("missing host".to_string()))?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .unwrap_or(if secure { 443 } else { 80 });
    let mut path = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }
    Ok(Target {
        host,
        port,
        path,
        secure,
    })
}

#[derive(Default)]
struct State {
    exchanges: HashMap<ExchangeToken, Exchange>,
    next_token: u64,
    waiter: Option<Arc<dyn Waiter>>,
    /// Whether the last connectivity report (if any) was "reachable".
    connectivity_seen: bool,
}

/// One HTTP subsystem instance over a transport provider
///
/// Shared by all requests for the lifetime of the process's HTTP layer;
/// wrap it in an `Arc` so transport worker threads can reach
/// [`Session::dispatch`].
pub struct Session<T: Transport> {
    transport: T,
    handle: SessionHandle,
    signal: Arc<WakeSignal>,
    observer: Option<Box<dyn TrafficObserver>>,
    state: Mutex<State>,
}

impl<T: Transport> Session<T> {
    /// Open the transport session with the negotiated user agent.
    pub fn new(transport: T, user_agent: &str) -> Result<Session<T>> {
        Session::build(transport, user_agent, None)
    }

    /// Same as [`Session::new`] with a traffic observer installed.
    pub fn with_observer(
        transport: T,
        user_agent: &str,
        observer: Box<dyn TrafficObserver>,
    ) -> Result<Session<T>> {
        Session::build(transport, user_agent, Some(observer))
    }

    fn build(
        transport: T,
        user_agent: &str,
        observer: Option<Box<dyn TrafficObserver>>,
    ) -> Result<Session<T>> {
        let handle = transport.open_session(user_agent)?;
        Ok(Session {
            transport,
            handle,
            signal: Arc::new(WakeSignal::new()),
            observer,
            state: Mutex::new(State::default()),
        })
    }

    /// The underlying transport provider.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The session's wake signal.
    pub fn wake_signal(&self) -> &Arc<WakeSignal> {
        &self.signal
    }

    /// Register an external waiter: it receives the wake signal up front
    /// and connectivity reports as the session learns about the peer.
    pub fn register_waiter(&self, waiter: Arc<dyn Waiter>, interest: u32) {
        waiter.add_wake_source(self.signal.clone(), interest);
        lock(&self.state).waiter = Some(waiter);
    }

    /// Number of exchange contexts still alive, cancelled ones awaiting
    /// handle teardown included.
    pub fn active_exchanges(&self) -> usize {
        lock(&self.state).exchanges.len()
    }

    /// Bytes of the request body handed to the transport so far, if the
    /// request has a live exchange.
    pub fn upload_progress(&self, request: &Request) -> Option<usize> {
        let state = lock(&self.state);
        let token = request.token()?;
        state.exchanges.get(&token).map(|e| e.queued())
    }

    /// Submit `request`. The outcome is reported through the request's
    /// status: `Inflight` on successful initiation, `Failure` on a
    /// malformed target or a transport setup error. A request that is
    /// already in flight is left untouched.
    pub fn post(&self, request: &Arc<Request>) {
        self.post_with(request, None);
    }

    /// Same as [`Session::post`] but transmits `payload` instead of the
    /// request's own body. Used for raw, pre-serialized sends.
    pub fn post_with(&self, request: &Arc<Request>, payload: Option<Bytes>) {
        if !request.try_reset() {
            return;
        }
        if self.submit(request, payload).is_err() {
            request.set_status(Status::Failure);
        }
    }

    fn submit(&self, request: &Arc<Request>, payload: Option<Bytes>) -> Result<()> {
        let target = parse_target(request.url())?;
        let payload = payload.unwrap_or_else(|| request.payload().clone());

        if let Some(observer) = &self.observer {
            observer.outgoing(request, &payload);
        }

        let conn = self.transport.connect(self.handle, &target.host, target.port)?;
        let handle = match self.transport.open_request(conn, &target.path, target.secure) {
            Ok(handle) => handle,
            Err(e) => {
                self.transport.close_connection(conn);
                return Err(e.into());
            }
        };
        if let Err(e) = self.transport.set_timeouts(handle, Timeouts::default()) {
            self.transport.close_request(handle);
            self.transport.close_connection(conn);
            return Err(e.into());
        }

        let headers: &[(&str, &str)] = match request.kind() {
            BodyKind::Json => &[
                (CONTENT_TYPE, CONTENT_TYPE_JSON),
                (ACCEPT_ENCODING, ENCODING_GZIP),
            ],
            BodyKind::Raw => &[(CONTENT_TYPE, CONTENT_TYPE_OCTET_STREAM)],
        };

        // From here on the exchange is visible to the dispatcher, so the
        // remaining setup happens under the session lock; register and
        // send are non-blocking submissions.
        let mut state = lock(&self.state);
        let token = ExchangeToken(state.next_token);
        state.next_token += 1;

        let mut exchange = Exchange::new(request.clone(), conn, handle, payload);
        let first = exchange.first_chunk();
        let total = exchange.total();
        state.exchanges.insert(token, exchange);
        request.attach(token);
        request.set_status(Status::Inflight);

        let started = self
            .transport
            .register(handle, token, EVENT_LIFECYCLE)
            .and_then(|_| self.transport.send(handle, headers, &first, total));

        if let Err(e) = started {
            state.exchanges.remove(&token);
            request.detach();
            self.transport.close_request(handle);
            self.transport.close_connection(conn);
            return Err(e.into());
        }
        Ok(())
    }

    /// Abort `request`'s exchange. Idempotent: repeated calls, and calls
    /// after natural completion, change nothing further. Also serves as
    /// the post-completion release that closes the transport handles.
    pub fn cancel(&self, request: &Request) {
        let mut state = lock(&self.state);
        let Some(token) = request.token() else {
            return;
        };
        self.cancel_locked(&mut state, token);
    }

    /// Single entry point for transport lifecycle events; safe to call
    /// from any thread.
    pub fn dispatch(&self, token: ExchangeToken, event: TransportEvent) {
        let mut state = lock(&self.state);

        if event == TransportEvent::HandleClosing {
            // the only path that releases a context: the provider is done
            // with the handle and cancellation already severed the link
            if state.exchanges.get(&token).is_some_and(|e| e.request.is_none()) {
                state.exchanges.remove(&token);
            }
            return;
        }

        let Some(exchange) = state.exchanges.get(&token) else {
            return;
        };
        let Some(request) = exchange.request.clone() else {
            // cancelled after the event was queued; absorb silently
            return;
        };

        match event {
            TransportEvent::DataAvailable(0) => {
                self.finish_transfer(&mut state, token, &request);
                self.signal.raise();
            }
            TransportEvent::DataAvailable(size) => {
                if self.consume_body(&mut state, token, &request, size).is_err() {
                    self.cancel_locked(&mut state, token);
                }
                self.signal.raise();
            }
            TransportEvent::ReadComplete(len) => {
                self.on_read_complete(&mut state, token, &request, len);
            }
            TransportEvent::HeadersAvailable => {
                self.on_headers(&mut state, token, &request);
            }
            TransportEvent::RequestError(fault) => {
                // a bare timeout on an otherwise healthy connection is
                // not a connectivity loss
                if fault != FaultKind::Timeout {
                    if let Some(waiter) = state.waiter.clone() {
                        waiter.notify_connectivity(false);
                        state.connectivity_seen = false;
                    }
                }
                self.cancel_locked(&mut state, token);
                self.signal.raise();
            }
            TransportEvent::SecureFailure => {
                self.cancel_locked(&mut state, token);
                self.signal.raise();
            }
            TransportEvent::SendComplete | TransportEvent::WriteComplete => {
                self.continue_upload(&mut state, token);
            }
            TransportEvent::HandleClosing => {}
        }
    }

    /// data-available with size 0: the response is fully transferred.
    fn finish_transfer(&self, state: &mut State, token: ExchangeToken, request: &Arc<Request>) {
        let truncated = state
            .exchanges
            .get(&token)
            .and_then(|e| e.inflater.as_ref())
            .is_some_and(|z| !z.is_finished());
        if truncated {
            // the connection completed before the compressed stream ended
            self.cancel_locked(state, token);
            return;
        }

        if let Some(observer) = &self.observer {
            observer.incoming(request, request.sink().committed());
        }
        let terminal = if request.http_status() == 200 {
            Status::Success
        } else {
            Status::Failure
        };
        request.finish(terminal);
    }

    /// data-available with size > 0: pull the announced bytes in.
    fn consume_body(
        &self,
        state: &mut State,
        token: ExchangeToken,
        request: &Arc<Request>,
        size: usize,
    ) -> Result<()> {
        let Some(exchange) = state.exchanges.get_mut(&token) else {
            return Ok(());
        };
        let handle = exchange.handle;

        if let Some(inflater) = exchange.inflater.as_mut() {
            let mut scratch = vec![0u8; size];
            let got = self.transport.read(handle, &mut scratch)?;
            let mut sink = request.sink();
            let (written, _) = inflater.feed(&scratch[..got], sink.lease())?;
            sink.commit(written);
        } else {
            let mut sink = request.sink();
            let region = sink.reserve(size);
            self.transport.read(handle, region)?;
            // committed when the matching read-complete arrives
        }
        Ok(())
    }

    fn on_read_complete(
        &self,
        state: &mut State,
        token: ExchangeToken,
        request: &Arc<Request>,
        len: usize,
    ) {
        if len == 0 {
            return;
        }
        let Some(exchange) = state.exchanges.get(&token) else {
            return;
        };
        let handle = exchange.handle;
        if exchange.inflater.is_none() {
            request.sink().commit(len);
        }
        if self.transport.query_available(handle).is_err() {
            self.cancel_locked(state, token);
            self.signal.raise();
        }
    }

    fn on_headers(&self, state: &mut State, token: ExchangeToken, request: &Arc<Request>) {
        let Some(exchange) = state.exchanges.get(&token) else {
            return;
        };
        let handle = exchange.handle;

        let code = match self.transport.status_code(handle) {
            Ok(code) => code,
            Err(_) => {
                self.cancel_locked(state, token);
                self.signal.raise();
                return;
            }
        };
        request.set_http_status(code);

        // raw destinations take the body verbatim whatever the headers say
        if request.kind() == BodyKind::Json {
            if let Some(declared) = self.original_length(handle) {
                request.set_content_length(declared as u64);
                if self.gzip_encoded(handle) {
                    if let Some(exchange) = state.exchanges.get_mut(&token) {
                        exchange.inflater = Some(GzipInflater::new(declared));
                    }
                    request.sink().presize(declared);
                }
            }
        }

        if self.transport.query_available(handle).is_err() {
            self.cancel_locked(state, token);
            self.signal.raise();
            return;
        }

        // headers on the wire are the earliest proof the peer is reachable
        if !state.connectivity_seen {
            if let Some(waiter) = state.waiter.clone() {
                waiter.notify_connectivity(true);
                state.connectivity_seen = true;
            }
        }
    }

    /// The original (pre-compression) length header, if present and sane.
    fn original_length(&self, handle: RequestHandle) -> Option<usize> {
        self.transport
            .header(handle, ORIGINAL_CONTENT_LENGTH)
            .ok()
            .flatten()
            .and_then(|value| value.trim().parse::<usize>().ok())
    }

    fn gzip_encoded(&self, handle: RequestHandle) -> bool {
        self.transport
            .header(handle, CONTENT_ENCODING)
            .ok()
            .flatten()
            .is_some_and(|value| value.trim().eq_ignore_ascii_case(ENCODING_GZIP))
    }

    /// send-complete / write-complete: push the next instalment, or start
    /// receiving once the whole body has been queued.
    fn continue_upload(&self, state: &mut State, token: ExchangeToken) {
        let Some(exchange) = state.exchanges.get_mut(&token) else {
            return;
        };
        let handle = exchange.handle;

        if let Some(chunk) = exchange.next_chunk() {
            if self.transport.write(handle, &chunk).is_err() {
                self.cancel_locked(state, token);
            }
            // progress tick: pollers can observe the advancing cursor
            self.signal.raise();
        } else if self.transport.receive_response(handle).is_err() {
            self.cancel_locked(state, token);
            self.signal.raise();
        }
    }

    /// Sever the exchange's request link, fail the request if still in
    /// flight, and tear down the transport handles. The context itself is
    /// released when the provider's handle-closing event arrives.
    fn cancel_locked(&self, state: &mut State, token: ExchangeToken) {
        let Some(exchange) = state.exchanges.get_mut(&token) else {
            return;
        };
        let Some(request) = exchange.request.take() else {
            return;
        };
        let conn = exchange.conn;
        let handle = exchange.handle;

        request.detach();
        request.abort();

        self.transport.close_request(handle);
        self.transport.close_connection(conn);
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.transport.close_session(self.handle);
    }
}
