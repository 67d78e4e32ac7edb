//! Per-exchange context
//!
//! One `Exchange` exists for every submitted request, owned by the
//! session from submission until teardown. It bridges the caller's
//! [`Request`] to the transport handles and carries the upload cursor and
//! any decompression state.
//!
//! The back-reference to the request is severable: cancellation takes it,
//! and every dispatcher path treats a missing back-reference as a stale
//! event for a cancelled exchange, to be ignored.

use std::sync::Arc;

use bytes::Bytes;

use crate::inflate::GzipInflater;
use crate::request::Request;
use crate::transport::{ConnHandle, RequestHandle};
use crate::POST_CHUNK_SIZE;

pub(crate) struct Exchange {
    /// Link back to the caller's request; `None` once cancelled.
    pub(crate) request: Option<Arc<Request>>,
    pub(crate) conn: ConnHandle,
    pub(crate) handle: RequestHandle,
    /// Present while the response body is being decompressed.
    pub(crate) inflater: Option<GzipInflater>,
    payload: Bytes,
    queued: usize,
}

impl Exchange {
    pub(crate) fn new(
        request: Arc<Request>,
        conn: ConnHandle,
        handle: RequestHandle,
        payload: Bytes,
    ) -> Exchange {
        Exchange {
            request: Some(request),
            conn,
            handle,
            inflater: None,
            payload,
            queued: 0,
        }
    }

    /// Full body length.
    pub(crate) fn total(&self) -> usize {
        self.payload.len()
    }

    /// Bytes handed to the transport so far.
    pub(crate) fn queued(&self) -> usize {
        self.queued
    }

    /// The instalment passed along with the initial send command.
    pub(crate) fn first_chunk(&mut self) -> Bytes {
        let size = self.payload.len().min(POST_CHUNK_SIZE);
        self.queued = size;
        self.payload.slice(..size)
    }

    /// The next instalment to write, advancing the cursor, or `None`
    /// once the whole body has been queued.
    pub(crate) fn next_chunk(&mut self) -> Option<Bytes> {
        if self.queued >= self.payload.len() {
            return None;
        }
        let start = self.queued;
        let size = (self.payload.len() - start).min(POST_CHUNK_SIZE);
        self.queued = start + size;
        Some(self.payload.slice(start..start + size))
    }
}
