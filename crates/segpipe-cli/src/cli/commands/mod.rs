//! CLI command handlers, one file per command.

mod config;
mod demux;
mod fetch;
mod run;

pub use config::run_config;
pub use demux::run_demux;
pub use fetch::run_fetch;
pub use run::run_pipeline;

#[cfg(test)]
pub(crate) use fetch::file_name_for;
#[cfg(test)]
pub(crate) use run::SegmentList;
