//! Apply transfer options to a pooled handle before it joins the multi handle.

use std::sync::Arc;

use curl::easy::{Easy2, List};

use crate::scheduler::TransferParams;

use super::handler::{ChunkGate, TransferHandler};

/// Configure a freshly acquired handle for `url`, resuming at `offset` with an
/// open-ended upper bound.
pub(crate) fn configure(
    easy: &mut Easy2<TransferHandler>,
    params: &TransferParams,
    url: &str,
    gate: Arc<ChunkGate>,
    offset: u64,
) -> Result<(), curl::Error> {
    easy.url(url)?;
    easy.follow_location(params.follow_redirects)?;
    easy.max_redirections(params.max_redirections)?;
    easy.connect_timeout(params.connect_timeout)?;
    // Stall detection: abort when throughput stays under the limit for the window.
    easy.low_speed_limit(params.low_speed_limit)?;
    easy.low_speed_time(params.low_speed_time)?;
    if let Some(timeout) = params.timeout {
        easy.timeout(timeout)?;
    }
    if let Some(proxy) = params.proxy.as_deref() {
        easy.proxy(proxy)?;
    }
    if let Some(ua) = params.user_agent.as_deref() {
        easy.useragent(ua)?;
    }
    if !params.headers.is_empty() {
        let mut list = List::new();
        for (k, v) in &params.headers {
            list.append(&format!("{}: {}", k.trim(), v.trim()))?;
        }
        easy.http_headers(list)?;
    }
    resume_at(easy, gate, offset)
}

/// Point an already configured handle at `offset` for the next attempt.
pub(crate) fn resume_at(
    easy: &mut Easy2<TransferHandler>,
    gate: Arc<ChunkGate>,
    offset: u64,
) -> Result<(), curl::Error> {
    if offset > 0 {
        // curl expects "start-end"; an empty end requests everything after start.
        easy.range(&format!("{}-", offset))?;
    }
    easy.get_mut().begin(gate, offset);
    Ok(())
}
