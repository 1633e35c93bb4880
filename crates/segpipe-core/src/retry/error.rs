//! Transfer failure type used for logging and retry decisions.

use std::fmt;

use crate::error::PipelineError;

/// Why a single transfer attempt did not complete cleanly.
#[derive(Debug)]
pub enum TransferError {
    /// Curl reported an error (timeout, connection reset, partial file, ...).
    Curl(curl::Error),
    /// HTTP response had a non-2xx status.
    Http(u32),
    /// Transfer completed but the byte count does not match the declared
    /// content length (e.g. server closed early).
    PartialTransfer { expected: u64, received: u64 },
    /// The transfer could not be (re)started on the engine.
    Engine(String),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Curl(e) => write!(f, "{}", e),
            TransferError::Http(code) => write!(f, "HTTP {}", code),
            TransferError::PartialTransfer { expected, received } => {
                write!(f, "partial transfer: expected {} bytes, got {}", expected, received)
            }
            TransferError::Engine(msg) => write!(f, "engine: {}", msg),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Curl(e) => Some(e),
            TransferError::Http(_)
            | TransferError::PartialTransfer { .. }
            | TransferError::Engine(_) => None,
        }
    }
}

impl From<&TransferError> for PipelineError {
    fn from(e: &TransferError) -> Self {
        PipelineError::TransferFailed(e.to_string())
    }
}
