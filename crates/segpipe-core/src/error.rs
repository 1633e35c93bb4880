//! Error taxonomy shared by the scheduler, the reader manager and the pipeline.
//!
//! Per-task and per-segment failures are resolved locally (retry, eviction)
//! and only surface once through the relevant completion channel; these
//! variants are what callers observe at component boundaries.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Errors returned by public scheduler and reader operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// Empty URL, unknown task/track id, or a call on a closed component.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Pool, transfer engine or worker thread could not be allocated.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Non-success HTTP status or byte-count mismatch. Timeouts and network
    /// errors fall into this bucket as well.
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    /// A segment waited past the staleness timeout for its init segments.
    #[error("segment dependencies unsatisfied: {0}")]
    DependencyUnsatisfied(String),
    /// Packet queue is empty but the track has not reached end-of-stream.
    #[error("no packet ready")]
    NotReady,
    /// Packet queue is empty and the track has ended.
    #[error("end of stream")]
    EndOfStream,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Worker loops must stay alive after a panicking user callback, so poisoning
/// is treated as recoverable everywhere in this crate.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
