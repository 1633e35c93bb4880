//! Fixed-size pool of reusable transfer handles.
//!
//! All handles are created up front; `acquire` never allocates and never
//! blocks. An empty pool is reported as `None` so the caller defers work.

use std::sync::Mutex;

use crate::error::lock;

/// A handle that can be scrubbed of per-task state and handed to another task.
pub trait Reusable {
    fn reset_for_reuse(&mut self);
}

/// Bounded set of idle handles. Ownership moves out on `acquire` and back on
/// `release`, so a handle can never be held by two tasks at once.
pub struct ConnectionPool<H> {
    capacity: usize,
    idle: Mutex<Vec<H>>,
}

impl<H: Reusable> ConnectionPool<H> {
    /// Create `capacity` handles with `make`. Any construction failure is returned.
    pub fn new<F, E>(capacity: usize, mut make: F) -> Result<Self, E>
    where
        F: FnMut() -> Result<H, E>,
    {
        let mut idle = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push(make()?);
        }
        Ok(Self {
            capacity,
            idle: Mutex::new(idle),
        })
    }

    /// Take an idle handle, or `None` when every handle is in use.
    pub fn acquire(&self) -> Option<H> {
        lock(&self.idle).pop()
    }

    /// Return a handle. It is reset before it becomes available again.
    pub fn release(&self, mut handle: H) {
        handle.reset_for_reuse();
        let mut idle = lock(&self.idle);
        if idle.len() < self.capacity {
            idle.push(handle);
        } else {
            tracing::warn!(
                capacity = self.capacity,
                "connection pool already full; dropping released handle"
            );
        }
    }

    pub fn idle(&self) -> usize {
        lock(&self.idle).len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
