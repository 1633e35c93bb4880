//! Download worker: one curl multi event loop driving every transfer.
//!
//! Each pass detaches removed transfers, admits ready tasks up to the
//! parallelism limit, performs, waits when the engine is saturated, and then
//! processes completed handles (finalize, or restart from the received offset).

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use curl::easy::Easy2;
use curl::multi::{Easy2Handle, Multi};

use crate::downloader::{
    configure, resume_at, transfer_result, ConnectionPool, TransferHandle, TransferHandler,
};
use crate::error::{lock, PipelineError, PipelineResult};
use crate::retry::{classify, RetryBudget, RetryDecision, TransferError};

use super::task::{RunningTask, TaskId, TaskOutcome, TaskState};
use super::{Shared, TransferParams};

pub(super) type TaskDoneCallback = Box<dyn FnMut(TaskOutcome) + Send>;

/// Engine wait when every parallel slot is busy.
const SATURATED_WAIT: Duration = Duration::from_millis(100);
/// Engine wait with free slots, so newly queued tasks are admitted promptly.
const ADMIT_POLL: Duration = Duration::from_millis(10);
/// Condvar wait when nothing is running.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// What to do with a task after a failed attempt.
enum AfterFailure {
    /// Task was removed while its transfer was finishing.
    Removed,
    Restart(Arc<crate::downloader::ChunkGate>, u32),
    Finalize,
}

pub(super) struct Engine {
    multi: Multi,
    pool: ConnectionPool<TransferHandle>,
    active: HashMap<TaskId, Easy2Handle<TransferHandler>>,
    params: TransferParams,
    budget: RetryBudget,
    max_parallel: usize,
    shared: Arc<Shared>,
    on_done: TaskDoneCallback,
}

impl Engine {
    pub(super) fn new(
        params: TransferParams,
        shared: Arc<Shared>,
        on_done: TaskDoneCallback,
    ) -> PipelineResult<Self> {
        let max_parallel = params.effective_max_parallel();
        let mut multi = Multi::new();
        multi
            .set_max_connects(params.pool_capacity())
            .map_err(|e| PipelineError::ResourceExhausted(format!("curl multi: {}", e)))?;
        let pool = ConnectionPool::new(params.pool_capacity(), || {
            Ok::<_, PipelineError>(Easy2::new(TransferHandler::default()))
        })?;
        shared.idle_handles.store(pool.idle(), Ordering::Release);
        Ok(Self {
            multi,
            pool,
            active: HashMap::with_capacity(max_parallel),
            budget: RetryBudget::new(params.retry_times),
            params,
            max_parallel,
            shared,
            on_done,
        })
    }

    pub(super) fn run(mut self) {
        tracing::debug!(max_parallel = self.max_parallel, "download worker running");
        while self.shared.is_working() {
            self.detach_removed();
            self.admit_ready();
            if let Err(e) = self.multi.perform() {
                tracing::warn!("curl multi perform: {}", e);
            }
            self.wait_for_activity();
            self.drain_completions();
        }
        self.shutdown();
    }

    fn wait_for_activity(&self) {
        let active = self.active.len();
        if active == 0 {
            self.shared.wait_for_work(IDLE_WAIT);
            return;
        }
        let timeout = if active >= self.max_parallel {
            SATURATED_WAIT
        } else {
            ADMIT_POLL
        };
        if let Err(e) = self.multi.wait(&mut [], timeout) {
            tracing::warn!("curl multi wait: {}", e);
        }
    }

    /// Take transfers of removed tasks off the engine and return their handles.
    fn detach_removed(&mut self) {
        let ids = std::mem::take(&mut *lock(&self.shared.detached));
        for id in ids {
            if let Some(handle) = self.active.remove(&id) {
                match self.multi.remove2(handle) {
                    Ok(easy) => self.release(easy),
                    Err(e) => tracing::warn!(task = %id, "curl multi remove: {}", e),
                }
                tracing::debug!(task = %id, "detached removed transfer");
            }
        }
    }

    /// Move ready tasks onto the engine while slots and pooled handles allow.
    fn admit_ready(&mut self) {
        while self.active.len() < self.max_parallel {
            let Some(mut easy) = self.acquire() else {
                tracing::trace!("connection pool exhausted; deferring admission");
                break;
            };
            let task = {
                let mut ready = lock(&self.shared.ready);
                let Some(task) = ready.pop_front() else {
                    drop(ready);
                    self.release(easy);
                    break;
                };
                lock(&self.shared.running).insert(
                    task.id,
                    RunningTask {
                        url: task.url.clone(),
                        gate: Arc::clone(&task.gate),
                        state: TaskState::Running,
                        attempts: 1,
                    },
                );
                task
            };
            let offset = task.gate.received();
            if let Err(e) = configure(&mut easy, &self.params, &task.url, task.gate, offset) {
                self.release(easy);
                self.finalize(task.id, TaskState::Timeout, Some(TransferError::Curl(e)));
                continue;
            }
            match self.start(task.id, easy) {
                Ok(()) => tracing::debug!(task = %task.id, url = %task.url, offset, "transfer started"),
                Err(e) => self.finalize(task.id, TaskState::Timeout, Some(e)),
            }
        }
    }

    fn start(&mut self, id: TaskId, easy: TransferHandle) -> Result<(), TransferError> {
        let handle = self
            .multi
            .add2(easy)
            .map_err(|e| TransferError::Engine(format!("curl multi add: {}", e)))?;
        self.active.insert(id, handle);
        Ok(())
    }

    fn drain_completions(&mut self) {
        let mut done: Vec<(TaskId, Result<(), curl::Error>)> = Vec::new();
        let active = &self.active;
        self.multi.messages(|msg| {
            for (id, handle) in active.iter() {
                if let Some(result) = msg.result_for2(handle) {
                    done.push((*id, result));
                    break;
                }
            }
        });
        for (id, curl_result) in done {
            let Some(handle) = self.active.remove(&id) else {
                continue;
            };
            let easy = match self.multi.remove2(handle) {
                Ok(easy) => easy,
                Err(e) => {
                    tracing::warn!(task = %id, "curl multi remove: {}", e);
                    self.finalize(
                        id,
                        TaskState::Timeout,
                        Some(TransferError::Engine(format!("curl multi remove: {}", e))),
                    );
                    continue;
                }
            };
            self.complete(id, easy, curl_result);
        }
    }

    fn complete(&mut self, id: TaskId, mut easy: TransferHandle, curl_result: Result<(), curl::Error>) {
        let code = easy.response_code().unwrap_or(0);
        let err = match transfer_result(curl_result, code, easy.get_ref()) {
            Ok(()) => {
                self.release(easy);
                self.finalize(id, TaskState::Finish, None);
                return;
            }
            Err(e) => e,
        };

        let next = {
            let mut running = lock(&self.shared.running);
            match running.get_mut(&id) {
                None => AfterFailure::Removed,
                Some(task) => match self.budget.decide(task.attempts) {
                    RetryDecision::Restart => {
                        task.attempts += 1;
                        task.state = TaskState::Running;
                        AfterFailure::Restart(Arc::clone(&task.gate), task.attempts)
                    }
                    RetryDecision::Finalize => {
                        task.state = TaskState::Timeout;
                        AfterFailure::Finalize
                    }
                },
            }
        };

        match next {
            AfterFailure::Removed => self.release(easy),
            AfterFailure::Finalize => {
                self.release(easy);
                self.finalize(id, TaskState::Timeout, Some(err));
            }
            AfterFailure::Restart(gate, attempt) => {
                let offset = gate.received();
                tracing::info!(
                    task = %id,
                    attempt,
                    offset,
                    kind = ?classify(&err),
                    "transfer failed ({}); restarting from received offset",
                    err
                );
                if let Err(e) = resume_at(&mut easy, gate, offset) {
                    self.release(easy);
                    self.finalize(id, TaskState::Timeout, Some(TransferError::Curl(e)));
                    return;
                }
                if let Err(e) = self.start(id, easy) {
                    self.finalize(id, TaskState::Timeout, Some(e));
                }
            }
        }
    }

    /// Remove the task from the running map and deliver its outcome.
    /// The transfer handle must already be back in the pool.
    fn finalize(&mut self, id: TaskId, state: TaskState, error: Option<TransferError>) {
        let Some(task) = lock(&self.shared.running).remove(&id) else {
            tracing::trace!(task = %id, "task removed before finalize");
            return;
        };
        task.gate.close();
        self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
        let outcome = TaskOutcome {
            task: task.snapshot(id, state),
            error: error.as_ref().map(PipelineError::from),
        };
        match &error {
            None => tracing::debug!(
                task = %id,
                received = outcome.task.received,
                attempts = outcome.task.attempts,
                "transfer finished"
            ),
            Some(e) => tracing::warn!(
                task = %id,
                url = %outcome.task.url,
                attempts = outcome.task.attempts,
                kind = ?classify(e),
                "transfer failed, retry budget spent: {}",
                e
            ),
        }
        let on_done = &mut self.on_done;
        if catch_unwind(AssertUnwindSafe(|| on_done(outcome))).is_err() {
            tracing::error!(task = %id, "completion callback panicked");
        }
    }

    fn acquire(&self) -> Option<TransferHandle> {
        let easy = self.pool.acquire();
        self.shared.idle_handles.store(self.pool.idle(), Ordering::Release);
        easy
    }

    fn release(&self, easy: TransferHandle) {
        self.pool.release(easy);
        self.shared.idle_handles.store(self.pool.idle(), Ordering::Release);
    }

    fn shutdown(mut self) {
        let active: Vec<_> = self.active.drain().collect();
        let count = active.len();
        for (id, handle) in active {
            match self.multi.remove2(handle) {
                Ok(easy) => self.release(easy),
                Err(e) => tracing::warn!(task = %id, "curl multi remove: {}", e),
            }
        }
        tracing::debug!(detached = count, "download worker stopped");
    }
}
