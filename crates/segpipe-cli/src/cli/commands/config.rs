//! `segpipe config` – print the effective configuration.

use anyhow::Result;
use segpipe_core::config::{self, SegpipeConfig};
use std::path::Path;

pub fn run_config(cfg: &SegpipeConfig, explicit: Option<&Path>, path_only: bool) -> Result<()> {
    if path_only {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => config::config_path()?,
        };
        println!("{}", path.display());
        return Ok(());
    }
    print!("{}", toml::to_string_pretty(cfg)?);
    Ok(())
}
