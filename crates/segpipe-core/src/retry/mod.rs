//! Transfer failure handling.
//!
//! Every non-clean completion (bad status, short body, curl error) lands in a
//! single retryable bucket; the retry budget decides between restarting the
//! transfer from its last received offset and finalizing the task.

mod classify;
mod error;
mod policy;

pub use classify::{classify, classify_curl_error, FailureKind};
pub use error::TransferError;
pub use policy::{RetryBudget, RetryDecision};
