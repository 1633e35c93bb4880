//! Easy2 Handler for one task's transfer.
//! Collects response headers and forwards body chunks to the task through its
//! `ChunkGate`, keeping delivered offsets strictly increasing across restarts.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use crate::error::lock;

use super::headers::{parse_content_length, parse_http_status};

/// Streaming callback: receives each body chunk and its absolute byte offset.
pub type ChunkSink = Box<dyn FnMut(&[u8], u64) + Send>;

struct GateState {
    closed: bool,
    sink: Option<ChunkSink>,
    /// Thread currently running the sink. The sink is taken out of the state
    /// while it runs.
    delivering: Option<ThreadId>,
}

/// Shared between a task's running transfer and the scheduler API.
///
/// The sink runs without the lock held, so it may remove its own task. A
/// `close` from any other thread waits for an in-flight delivery, so once it
/// returns the sink is never called again.
pub(crate) struct ChunkGate {
    state: Mutex<GateState>,
    idle: Condvar,
    received: AtomicU64,
}

impl ChunkGate {
    pub(crate) fn new(sink: Option<ChunkSink>, offset: u64) -> Self {
        Self {
            state: Mutex::new(GateState {
                closed: false,
                sink,
                delivering: None,
            }),
            idle: Condvar::new(),
            received: AtomicU64::new(offset),
        }
    }

    /// Forward a chunk to the sink. Returns false when the gate is closed,
    /// including a close issued by the sink itself.
    pub(crate) fn deliver(&self, data: &[u8]) -> bool {
        let mut state = lock(&self.state);
        if state.closed {
            return false;
        }
        let offset = self.received.load(Ordering::Acquire);
        let mut sink = state.sink.take();
        state.delivering = Some(thread::current().id());
        drop(state);

        if let Some(sink) = sink.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| sink(data, offset))).is_err() {
                tracing::error!(offset, "chunk callback panicked; continuing transfer");
            }
        }
        self.received
            .store(offset + data.len() as u64, Ordering::Release);

        let mut state = lock(&self.state);
        state.delivering = None;
        let open = !state.closed;
        if open {
            state.sink = sink.take();
        }
        drop(state);
        self.idle.notify_all();
        // A sink closed during delivery is dropped here, outside the lock.
        drop(sink);
        open
    }

    /// Stop all further deliveries and drop the sink. Blocks while another
    /// thread is inside the sink.
    pub(crate) fn close(&self) {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        state.closed = true;
        state.sink = None;
        while state.delivering.is_some_and(|t| t != me) {
            state = self.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Total bytes of the resource received so far, including the initial offset.
    pub(crate) fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }
}

/// Per-attempt transfer state. Reset between attempts and between tasks.
#[derive(Default)]
pub(crate) struct TransferHandler {
    gate: Option<Arc<ChunkGate>>,
    pub(crate) response_headers: Vec<String>,
    /// Offset requested with `Range` for this attempt.
    resume_offset: u64,
    /// Bytes still to drop when a server ignored the range and restarted at zero.
    skip_remaining: u64,
    body_checked: bool,
    /// Raw body bytes received in this attempt (including skipped ones).
    pub(crate) body_bytes: u64,
}

impl TransferHandler {
    /// Prepare for a new attempt that resumes at `offset`.
    pub(crate) fn begin(&mut self, gate: Arc<ChunkGate>, offset: u64) {
        self.gate = Some(gate);
        self.response_headers.clear();
        self.resume_offset = offset;
        self.skip_remaining = 0;
        self.body_checked = false;
        self.body_bytes = 0;
    }

    pub(crate) fn reset(&mut self) {
        *self = TransferHandler::default();
    }

    pub(crate) fn status(&self) -> Option<u32> {
        parse_http_status(&self.response_headers)
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        parse_content_length(&self.response_headers)
    }
}

impl curl::easy::Handler for TransferHandler {
    fn header(&mut self, data: &[u8]) -> bool {
        if let Ok(s) = str::from_utf8(data) {
            let line = s.trim_end();
            if line.starts_with("HTTP/") {
                self.response_headers.clear();
            }
            if !line.is_empty() {
                self.response_headers.push(line.to_string());
            }
        }
        true
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, curl::easy::WriteError> {
        let Some(gate) = self.gate.as_ref() else {
            return Ok(0);
        };
        if !self.body_checked {
            self.body_checked = true;
            if self.resume_offset > 0 && self.status() == Some(200) {
                tracing::debug!(
                    offset = self.resume_offset,
                    "server ignored range request; skipping already received prefix"
                );
                self.skip_remaining = self.resume_offset;
            }
        }
        let mut chunk = data;
        if self.skip_remaining > 0 {
            let skip = self.skip_remaining.min(chunk.len() as u64) as usize;
            self.skip_remaining -= skip as u64;
            chunk = &chunk[skip..];
        }
        if !chunk.is_empty() && !gate.deliver(chunk) {
            // Task was removed: abort the transfer.
            return Ok(0);
        }
        self.body_bytes += data.len() as u64;
        Ok(data.len())
    }
}
