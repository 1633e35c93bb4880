use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::reader::{ReaderParams, StreamType};
use crate::scheduler::TransferParams;

/// Transfer engine parameters (`[transfer]` section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum number of concurrently running transfers. 0 selects the built-in default.
    pub max_parallel_transfers: usize,
    /// How many times a failed transfer is restarted before the task is finalized.
    pub retry_times: u32,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Optional whole-transfer timeout in seconds (None = no limit).
    pub timeout_secs: Option<u64>,
    /// Abort when throughput stays below this many bytes/s for `low_speed_time_secs`.
    pub low_speed_limit: u32,
    pub low_speed_time_secs: u64,
    pub follow_redirects: bool,
    pub max_redirections: u32,
    /// Optional proxy URL passed through to libcurl.
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    /// Extra request headers sent with every segment request.
    pub headers: BTreeMap<String, String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_parallel_transfers: 4,
            retry_times: 3,
            connect_timeout_secs: 10,
            timeout_secs: None,
            low_speed_limit: 1024,
            low_speed_time_secs: 30,
            follow_redirects: true,
            max_redirections: 10,
            proxy: None,
            user_agent: None,
            headers: BTreeMap::new(),
        }
    }
}

impl From<&TransferConfig> for TransferParams {
    fn from(cfg: &TransferConfig) -> Self {
        Self {
            max_parallel_transfers: cfg.max_parallel_transfers,
            retry_times: cfg.retry_times,
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            timeout: cfg.timeout_secs.map(Duration::from_secs),
            low_speed_limit: cfg.low_speed_limit,
            low_speed_time: Duration::from_secs(cfg.low_speed_time_secs),
            follow_redirects: cfg.follow_redirects,
            max_redirections: cfg.max_redirections,
            proxy: cfg.proxy.clone(),
            user_agent: cfg.user_agent.clone(),
            headers: cfg
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Reader manager parameters (`[reader]` section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// How long a segment may wait for its init segments before it is evicted.
    pub segment_timeout_ms: u64,
    /// Per-track packet queue bound; the reader stops demuxing a track while its queue is full.
    pub max_packet_queue_len: usize,
    pub stream_type: StreamType,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            segment_timeout_ms: 3000,
            max_packet_queue_len: 512,
            stream_type: StreamType::Dynamic,
        }
    }
}

impl From<&ReaderConfig> for ReaderParams {
    fn from(cfg: &ReaderConfig) -> Self {
        Self {
            segment_timeout: Duration::from_millis(cfg.segment_timeout_ms),
            max_packet_queue_len: cfg.max_packet_queue_len.max(1),
            stream_type: cfg.stream_type,
        }
    }
}

/// Global configuration loaded from `~/.config/segpipe/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegpipeConfig {
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("segpipe")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<SegpipeConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = SegpipeConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    load_from_path(&path)
}

/// Load configuration from an explicit file.
pub fn load_from_path(path: &Path) -> Result<SegpipeConfig> {
    let data = fs::read_to_string(path)?;
    let cfg: SegpipeConfig = toml::from_str(&data)?;
    Ok(cfg)
}
