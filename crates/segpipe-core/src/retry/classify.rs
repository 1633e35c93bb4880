//! Classify transfer failures for logging.
//!
//! The kind is diagnostic only: retry decisions treat every kind the same.

use super::error::TransferError;

/// Diagnostic category of a failed transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connect, low-speed or whole-transfer timeout.
    Timeout,
    /// Network-level failure (connection reset, DNS, receive error, early close).
    Connection,
    /// Server answered with a non-success status.
    Http(u16),
    /// Body shorter or longer than the declared content length.
    Partial,
    Other,
}

/// Classify a curl error.
pub fn classify_curl_error(e: &curl::Error) -> FailureKind {
    if e.is_operation_timedout() {
        return FailureKind::Timeout;
    }
    if e.is_partial_file() {
        return FailureKind::Partial;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
    {
        return FailureKind::Connection;
    }
    FailureKind::Other
}

pub fn classify(e: &TransferError) -> FailureKind {
    match e {
        TransferError::Curl(ce) => classify_curl_error(ce),
        TransferError::Http(code) => FailureKind::Http((*code).min(u16::MAX as u32) as u16),
        TransferError::PartialTransfer { .. } => FailureKind::Partial,
        TransferError::Engine(_) => FailureKind::Other,
    }
}
