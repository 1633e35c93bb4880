//! Curl transfer plumbing used by the download scheduler.
//!
//! A fixed pool of reusable `Easy2` handles, the per-transfer `Handler` that
//! streams body chunks to the owning task, option setup for a (re)started
//! transfer, and evaluation of a finished transfer.

mod handler;
mod headers;
mod pool;
mod result;
mod transfer;

pub use handler::ChunkSink;
pub use pool::{ConnectionPool, Reusable};

pub(crate) use handler::{ChunkGate, TransferHandler};
pub(crate) use result::transfer_result;
pub(crate) use transfer::{configure, resume_at};

/// Pooled transfer handle: a curl easy handle bound to our streaming handler.
pub(crate) type TransferHandle = curl::easy::Easy2<TransferHandler>;

impl Reusable for TransferHandle {
    fn reset_for_reuse(&mut self) {
        self.get_mut().reset();
        self.reset();
    }
}
