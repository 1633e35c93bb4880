pub mod config;
pub mod error;
pub mod logging;

// Download side: pooled curl transfers driven by one multi loop
pub mod downloader;
pub mod retry;
pub mod scheduler;

// Reader side: init dependencies, demux and per-track packet queues
pub mod demux;
pub mod reader;

pub mod pipeline;

pub use error::{PipelineError, PipelineResult};
