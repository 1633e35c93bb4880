//! CLI for the segpipe segment acquisition core.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use segpipe_core::config::{self, SegpipeConfig};
use std::path::PathBuf;

use commands::{run_config, run_demux, run_fetch, run_pipeline};

/// Top-level CLI for segpipe.
#[derive(Debug, Parser)]
#[command(name = "segpipe")]
#[command(about = "segpipe: segment downloads and per-track demux for tiled streaming", long_about = None)]
pub struct Cli {
    /// Load configuration from this file instead of the XDG config path.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Download URLs through the scheduler and print one JSON outcome per task.
    Fetch {
        /// Direct HTTP/HTTPS segment URLs.
        #[arg(required = true)]
        urls: Vec<String>,
        /// Directory the downloaded files are written to.
        #[arg(long, short = 'o', default_value = ".")]
        output_dir: PathBuf,
        /// Override `transfer.max_parallel_transfers`.
        #[arg(long, value_name = "N")]
        max_parallel: Option<usize>,
    },

    /// Demux a local init segment and its media segments and print the packets.
    Demux {
        /// Initialization segment (fMP4 with `moov`).
        init: PathBuf,
        /// Media segments in playback order.
        #[arg(required = true)]
        segments: Vec<PathBuf>,
        /// Track id reported on the packets.
        #[arg(long, default_value = "1")]
        track_id: u32,
    },

    /// Run the full download and demux pipeline over a segment list.
    Run {
        /// TOML segment list with tracks, init URLs and media URLs.
        segments: PathBuf,
    },

    /// Print the effective configuration.
    Config {
        /// Print the config file path instead of its contents.
        #[arg(long)]
        path: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<SegpipeConfig> {
    match path {
        Some(p) => config::load_from_path(p),
        None => config::load_or_init(),
    }
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = load_config(cli.config.as_ref())?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Fetch {
                urls,
                output_dir,
                max_parallel,
            } => run_fetch(&cfg, urls, &output_dir, max_parallel).await?,
            CliCommand::Demux {
                init,
                segments,
                track_id,
            } => run_demux(&cfg, &init, segments, track_id).await?,
            CliCommand::Run { segments } => run_pipeline(&cfg, &segments).await?,
            CliCommand::Config { path } => run_config(&cfg, cli.config.as_deref(), path)?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
