//! Download scheduler.
//!
//! Callers enqueue `DownloadTask`s; a single worker thread drives all
//! transfers through one curl multi handle, keeping at most
//! `max_parallel_transfers` running, restarting failed transfers from their
//! last received offset until the retry budget is spent, and delivering each
//! finished task exactly once to the completion callback.

mod params;
mod run;
mod task;

pub use params::{TransferParams, DEFAULT_MAX_PARALLEL_TRANSFERS};
pub use task::{DownloadTask, TaskId, TaskIdSequence, TaskOutcome, TaskSnapshot, TaskState};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::downloader::ChunkGate;
use crate::error::{lock, PipelineError, PipelineResult};

use task::{QueuedTask, RunningTask};

/// State shared between the API and the worker. Each lock guards one
/// collection and is never held across a transfer step.
pub(crate) struct Shared {
    working: AtomicBool,
    ready: Mutex<VecDeque<QueuedTask>>,
    ready_cv: Condvar,
    running: Mutex<HashMap<TaskId, RunningTask>>,
    /// Removed running tasks whose handles the worker must take off the engine.
    detached: Mutex<Vec<TaskId>>,
    outstanding: AtomicUsize,
    idle_handles: AtomicUsize,
}

impl Shared {
    fn new() -> Self {
        Self {
            working: AtomicBool::new(true),
            ready: Mutex::new(VecDeque::new()),
            ready_cv: Condvar::new(),
            running: Mutex::new(HashMap::new()),
            detached: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            idle_handles: AtomicUsize::new(0),
        }
    }

    fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    /// Block until a task is queued, the scheduler closes, or `timeout` passes.
    fn wait_for_work(&self, timeout: Duration) {
        let ready = lock(&self.ready);
        if ready.is_empty() && self.is_working() {
            let _ = self.ready_cv.wait_timeout(ready, timeout);
        }
    }
}

/// Point-in-time counters for monitoring and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ready: usize,
    /// Tasks holding a transfer handle (including those between retries).
    pub running: usize,
    /// Tasks added and not yet finalized, removed or abandoned.
    pub outstanding: usize,
    pub idle_handles: usize,
    pub pool_capacity: usize,
    pub max_parallel: usize,
}

pub struct DownloadScheduler {
    shared: Arc<Shared>,
    ids: TaskIdSequence,
    max_parallel: usize,
    pool_capacity: usize,
    worker: Option<JoinHandle<()>>,
}

impl DownloadScheduler {
    /// Allocate the transfer engine and connection pool and start the worker.
    /// `on_task_done` runs on the worker thread once per finished task.
    pub fn init<F>(params: TransferParams, ids: TaskIdSequence, on_task_done: F) -> PipelineResult<Self>
    where
        F: FnMut(TaskOutcome) + Send + 'static,
    {
        let max_parallel = params.effective_max_parallel();
        let pool_capacity = params.pool_capacity();
        let shared = Arc::new(Shared::new());
        let worker_shared = Arc::clone(&shared);
        let (init_tx, init_rx) = crossbeam_channel::bounded::<PipelineResult<()>>(1);
        let on_done: run::TaskDoneCallback = Box::new(on_task_done);

        let handle = thread::Builder::new()
            .name("segpipe-download".into())
            .spawn(move || match run::Engine::new(params, worker_shared, on_done) {
                Ok(engine) => {
                    let _ = init_tx.send(Ok(()));
                    engine.run();
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                }
            })
            .map_err(|e| PipelineError::ResourceExhausted(format!("spawn download worker: {}", e)))?;

        let started = init_rx.recv().unwrap_or_else(|_| {
            Err(PipelineError::ResourceExhausted(
                "download worker exited during init".into(),
            ))
        });
        if let Err(e) = started {
            shared.working.store(false, Ordering::Release);
            let _ = handle.join();
            tracing::error!("download scheduler init failed: {}", e);
            return Err(e);
        }

        tracing::info!(max_parallel, pool_capacity, "download scheduler started");
        Ok(Self {
            shared,
            ids,
            max_parallel,
            pool_capacity,
            worker: Some(handle),
        })
    }

    /// Like `init`, but completions are delivered on a channel. The receiver
    /// disconnects once the scheduler is closed.
    pub fn init_with_channel(
        params: TransferParams,
        ids: TaskIdSequence,
    ) -> PipelineResult<(Self, Receiver<TaskOutcome>)> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let scheduler = Self::init(params, ids, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        Ok((scheduler, rx))
    }

    /// Queue a task in READY state. Callable from any thread while the worker runs.
    pub fn add_task(&self, task: DownloadTask) -> PipelineResult<TaskId> {
        task.validate()?;
        if !self.shared.is_working() {
            return Err(PipelineError::InvalidArgument("scheduler is closed".into()));
        }
        let id = self.ids.next_id();
        let DownloadTask {
            url,
            offset,
            on_chunk,
        } = task;
        tracing::trace!(task = %id, %url, offset, "task queued");
        let queued = QueuedTask {
            id,
            url,
            gate: Arc::new(ChunkGate::new(on_chunk, offset)),
        };
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        lock(&self.shared.ready).push_back(queued);
        self.shared.ready_cv.notify_one();
        Ok(id)
    }

    /// Remove a queued or running task and hand it back as STOPPED.
    ///
    /// After this returns, neither the chunk callback nor the completion
    /// callback is invoked for the task. A running transfer is taken off the
    /// engine by the worker and its handle returned to the pool.
    pub fn remove_task(&self, id: TaskId) -> PipelineResult<TaskSnapshot> {
        let mut ready = lock(&self.shared.ready);
        if let Some(pos) = ready.iter().position(|t| t.id == id) {
            if let Some(task) = ready.remove(pos) {
                drop(ready);
                task.gate.close();
                self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                tracing::debug!(task = %id, "removed queued task");
                return Ok(task.snapshot(TaskState::Stopped));
            }
        }
        // Hold the ready lock while looking in the running map so a task being
        // admitted is always found in one of the two.
        let mut running = lock(&self.shared.running);
        drop(ready);
        let Some(task) = running.remove(&id) else {
            return Err(PipelineError::InvalidArgument(format!(
                "task {} is not queued or running",
                id
            )));
        };
        drop(running);
        task.gate.close();
        lock(&self.shared.detached).push(id);
        self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(task = %id, received = task.gate.received(), "removed running task");
        Ok(task.snapshot(id, TaskState::Stopped))
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            ready: lock(&self.shared.ready).len(),
            running: lock(&self.shared.running).len(),
            outstanding: self.shared.outstanding.load(Ordering::Acquire),
            idle_handles: self.shared.idle_handles.load(Ordering::Acquire),
            pool_capacity: self.pool_capacity,
            max_parallel: self.max_parallel,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Stop the worker, join it and release the engine. Tasks still queued or
    /// running are returned as STOPPED without a completion callback.
    /// Idempotent: later calls return an empty list.
    pub fn close(&mut self) -> Vec<TaskSnapshot> {
        let Some(handle) = self.worker.take() else {
            return Vec::new();
        };
        tracing::info!("closing download scheduler");
        self.shared.working.store(false, Ordering::Release);
        self.shared.ready_cv.notify_all();
        if handle.join().is_err() {
            tracing::error!("download worker panicked");
        }

        let mut abandoned = Vec::new();
        for task in lock(&self.shared.ready).drain(..) {
            task.gate.close();
            abandoned.push(task.snapshot(TaskState::Stopped));
        }
        for (id, task) in lock(&self.shared.running).drain() {
            task.gate.close();
            abandoned.push(task.snapshot(id, TaskState::Stopped));
        }
        lock(&self.shared.detached).clear();
        self.shared.outstanding.store(0, Ordering::Release);
        if !abandoned.is_empty() {
            tracing::info!(count = abandoned.len(), "abandoned unfinished tasks on close");
        }
        abandoned.sort_by_key(|t| t.id);
        abandoned
    }
}

impl Drop for DownloadScheduler {
    fn drop(&mut self) {
        self.close();
    }
}
