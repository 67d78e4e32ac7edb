//! Scripted transport provider for driving the dispatcher in tests
//!
//! The mock records every command the core issues and serves a scripted
//! response (status, headers, body bytes). Tests then play the provider's
//! worker role by feeding events through `Session::dispatch` and assert
//! on the recorded command stream and the request's observable state.

// not every test binary exercises every helper
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Mutex;

use httpio::transport::{
    ConnHandle, ExchangeToken, RequestHandle, SessionHandle, Timeouts, Transport, TransportError,
    TransportResult,
};

/// One recorded provider command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    OpenSession(String),
    Connect { host: String, port: u16 },
    OpenRequest { path: String, secure: bool },
    SetTimeouts,
    Register { token: ExchangeToken, events: u32 },
    Send { headers: Vec<(String, String)>, initial: usize, total: usize },
    Write { len: usize },
    QueryAvailable,
    Read { len: usize },
    ReceiveResponse,
    StatusCode,
    Header(String),
    CloseRequest,
    CloseConnection,
    CloseSession,
}

#[derive(Default)]
struct Inner {
    calls: Vec<Call>,
    sent: Vec<u8>,
    body: Vec<u8>,
    body_pos: usize,
    status: u16,
    headers: Vec<(String, String)>,
    fail: HashSet<&'static str>,
    token: Option<ExchangeToken>,
    next_handle: u64,
}

pub struct MockTransport {
    inner: Mutex<Inner>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport::with_response(200, &[], Vec::new())
    }

    /// Script the response the provider will serve.
    pub fn with_response(status: u16, headers: &[(&str, &str)], body: Vec<u8>) -> MockTransport {
        MockTransport {
            inner: Mutex::new(Inner {
                status,
                headers: headers
                    .iter()
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .collect(),
                body,
                ..Inner::default()
            }),
        }
    }

    /// Make the named command fail once: one of "connect", "open_request",
    /// "set_timeouts", "register", "send", "write", "query_available",
    /// "read", "receive_response", "status_code".
    pub fn fail_next(&self, op: &'static str) {
        self.inner.lock().unwrap().fail.insert(op);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Count the recorded commands matching a predicate.
    pub fn count_calls(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.inner.lock().unwrap().calls.iter().filter(|c| matches(c)).count()
    }

    /// The request body bytes the core handed over (initial send + writes).
    pub fn sent(&self) -> Vec<u8> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// The exchange token the core registered.
    pub fn token(&self) -> ExchangeToken {
        self.inner.lock().unwrap().token.expect("no exchange registered")
    }

    fn check(&self, op: &'static str) -> TransportResult<()> {
        if self.inner.lock().unwrap().fail.remove(op) {
            return Err(TransportError(format!("injected {op} failure")));
        }
        Ok(())
    }

    fn record(&self, call: Call) {
        self.inner.lock().unwrap().calls.push(call);
    }

    fn next_handle(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_handle += 1;
        inner.next_handle
    }
}

impl Transport for MockTransport {
    fn open_session(&self, user_agent: &str) -> TransportResult<SessionHandle> {
        self.record(Call::OpenSession(user_agent.to_string()));
        Ok(SessionHandle(self.next_handle()))
    }

    fn connect(&self, _session: SessionHandle, host: &str, port: u16) -> TransportResult<ConnHandle> {
        self.check("connect")?;
        self.record(Call::Connect {
            host: host.to_string(),
            port,
        });
        Ok(ConnHandle(self.next_handle()))
    }

    fn open_request(
        &self,
        _conn: ConnHandle,
        path: &str,
        secure: bool,
    ) -> TransportResult<RequestHandle> {
        self.check("open_request")?;
        self.record(Call::OpenRequest {
            path: path.to_string(),
            secure,
        });
        Ok(RequestHandle(self.next_handle()))
    }

    fn set_timeouts(&self, _request: RequestHandle, _timeouts: Timeouts) -> TransportResult<()> {
        self.check("set_timeouts")?;
        self.record(Call::SetTimeouts);
        Ok(())
    }

    fn register(
        &self,
        _request: RequestHandle,
        token: ExchangeToken,
        events: u32,
    ) -> TransportResult<()> {
        self.check("register")?;
        self.record(Call::Register { token, events });
        self.inner.lock().unwrap().token = Some(token);
        Ok(())
    }

    fn send(
        &self,
        _request: RequestHandle,
        headers: &[(&str, &str)],
        initial: &[u8],
        total_len: usize,
    ) -> TransportResult<()> {
        self.check("send")?;
        self.record(Call::Send {
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            initial: initial.len(),
            total: total_len,
        });
        self.inner.lock().unwrap().sent.extend_from_slice(initial);
        Ok(())
    }

    fn write(&self, _request: RequestHandle, chunk: &[u8]) -> TransportResult<()> {
        self.check("write")?;
        self.record(Call::Write { len: chunk.len() });
        self.inner.lock().unwrap().sent.extend_from_slice(chunk);
        Ok(())
    }

    fn query_available(&self, _request: RequestHandle) -> TransportResult<()> {
        self.check("query_available")?;
        self.record(Call::QueryAvailable);
        Ok(())
    }

    fn read(&self, _request: RequestHandle, buf: &mut [u8]) -> TransportResult<usize> {
        self.check("read")?;
        let mut inner = self.inner.lock().unwrap();
        let remaining = inner.body.len() - inner.body_pos;
        let n = buf.len().min(remaining);
        let start = inner.body_pos;
        buf[..n].copy_from_slice(&inner.body[start..start + n]);
        inner.body_pos += n;
        inner.calls.push(Call::Read { len: n });
        Ok(n)
    }

    fn receive_response(&self, _request: RequestHandle) -> TransportResult<()> {
        self.check("receive_response")?;
        self.record(Call::ReceiveResponse);
        Ok(())
    }

    fn status_code(&self, _request: RequestHandle) -> TransportResult<u16> {
        self.check("status_code")?;
        self.record(Call::StatusCode);
        Ok(self.inner.lock().unwrap().status)
    }

    fn header(&self, _request: RequestHandle, name: &str) -> TransportResult<Option<String>> {
        self.record(Call::Header(name.to_string()));
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone()))
    }

    fn close_request(&self, _request: RequestHandle) {
        self.record(Call::CloseRequest);
    }

    fn close_connection(&self, _conn: ConnHandle) {
        self.record(Call::CloseConnection);
    }

    fn close_session(&self, _session: SessionHandle) {
        self.record(Call::CloseSession);
    }
}
