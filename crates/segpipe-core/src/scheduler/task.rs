//! Download task model: ids, states, the caller-facing task builder and the
//! snapshots handed back when the scheduler releases a task.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::downloader::{ChunkGate, ChunkSink};
use crate::error::PipelineError;

/// Opaque task identity, unique within one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id generator owned by a scheduler instance.
///
/// Clones share the same counter, so a caller that needs ids from several
/// schedulers to be globally unique can hand each one a clone.
#[derive(Debug, Clone, Default)]
pub struct TaskIdSequence {
    next: Arc<AtomicU64>,
}

impl TaskIdSequence {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(first)),
        }
    }

    pub fn next_id(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Ready,
    Running,
    Stopped,
    Finish,
    Timeout,
}

/// A download request built by the caller and handed to `DownloadScheduler::add_task`.
pub struct DownloadTask {
    pub(crate) url: String,
    pub(crate) offset: u64,
    pub(crate) on_chunk: Option<ChunkSink>,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            offset: 0,
            on_chunk: None,
        }
    }

    /// Start the transfer at `offset` (bytes already held by the caller).
    pub fn resume_from(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Streaming callback invoked with each received chunk and its absolute offset.
    pub fn on_chunk<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[u8], u64) + Send + 'static,
    {
        self.on_chunk = Some(Box::new(f));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn validate(&self) -> Result<(), PipelineError> {
        if self.url.trim().is_empty() {
            return Err(PipelineError::InvalidArgument("task has empty URL".into()));
        }
        url::Url::parse(&self.url)
            .map_err(|e| PipelineError::InvalidArgument(format!("task URL {:?}: {}", self.url, e)))?;
        Ok(())
    }
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("url", &self.url)
            .field("offset", &self.offset)
            .field("on_chunk", &self.on_chunk.is_some())
            .finish()
    }
}

/// Owned view of a task at the moment the scheduler released it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub url: String,
    pub state: TaskState,
    /// Total bytes of the resource received, including the initial resume offset.
    pub received: u64,
    /// Number of times the transfer was started.
    pub attempts: u32,
}

/// Delivered exactly once per finished task through the completion callback.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: TaskSnapshot,
    /// `None` on FINISH; the last transfer failure once the retry budget is spent.
    pub error: Option<PipelineError>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.task.state == TaskState::Finish
    }
}

/// Task waiting in the ready queue.
pub(crate) struct QueuedTask {
    pub(crate) id: TaskId,
    pub(crate) url: String,
    pub(crate) gate: Arc<ChunkGate>,
}

impl QueuedTask {
    pub(crate) fn snapshot(&self, state: TaskState) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            url: self.url.clone(),
            state,
            received: self.gate.received(),
            attempts: 0,
        }
    }
}

/// Scheduler-side record of a task that holds a transfer handle.
pub(crate) struct RunningTask {
    pub(crate) url: String,
    pub(crate) gate: Arc<ChunkGate>,
    pub(crate) state: TaskState,
    pub(crate) attempts: u32,
}

impl RunningTask {
    pub(crate) fn snapshot(&self, id: TaskId, state: TaskState) -> TaskSnapshot {
        TaskSnapshot {
            id,
            url: self.url.clone(),
            state,
            received: self.gate.received(),
            attempts: self.attempts,
        }
    }
}
