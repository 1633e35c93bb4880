//! Evaluate a finished transfer: success iff curl completed, the status is
//! 2xx, and the body length equals the declared `Content-Length`.

use crate::retry::TransferError;

use super::handler::TransferHandler;

pub(crate) fn transfer_result(
    curl_result: Result<(), curl::Error>,
    code: u32,
    handler: &TransferHandler,
) -> Result<(), TransferError> {
    curl_result.map_err(TransferError::Curl)?;
    if !(200..300).contains(&code) {
        return Err(TransferError::Http(code));
    }
    // Without a Content-Length (chunked encoding) curl's clean completion is the only signal.
    if let Some(expected) = handler.content_length() {
        let received = handler.body_bytes;
        if received != expected {
            return Err(TransferError::PartialTransfer { expected, received });
        }
    }
    Ok(())
}
