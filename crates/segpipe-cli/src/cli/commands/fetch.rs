//! `segpipe fetch <url>...` – download segments to a directory.

use anyhow::{Context, Result};
use segpipe_core::config::SegpipeConfig;
use segpipe_core::scheduler::{DownloadScheduler, DownloadTask, TaskId, TaskIdSequence, TaskSnapshot, TransferParams};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One JSON line per finished task.
#[derive(Debug, Serialize)]
struct FetchLine<'a> {
    #[serde(flatten)]
    task: &'a TaskSnapshot,
    path: String,
    error: Option<String>,
}

/// File name for a URL: its last path segment, or `segment-<n>` when empty.
pub(crate) fn file_name_for(url: &str, index: usize) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("segment-{}", index))
}

fn file_task(url: &str, path: &Path) -> Result<DownloadTask> {
    let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let path_str = path.display().to_string();
    Ok(DownloadTask::new(url).on_chunk(move |data, offset| {
        let written = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data));
        if let Err(e) = written {
            tracing::warn!(path = %path_str, offset, "write failed: {}", e);
        }
    }))
}

pub async fn run_fetch(
    cfg: &SegpipeConfig,
    urls: Vec<String>,
    output_dir: &Path,
    max_parallel: Option<usize>,
) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("create output dir {}", output_dir.display()))?;
    let mut params = TransferParams::from(&cfg.transfer);
    if let Some(n) = max_parallel {
        params.max_parallel_transfers = n;
    }

    let (mut scheduler, rx) = DownloadScheduler::init_with_channel(params, TaskIdSequence::default())?;
    let mut paths: HashMap<TaskId, PathBuf> = HashMap::new();
    for (i, url) in urls.iter().enumerate() {
        let path = output_dir.join(file_name_for(url, i));
        let id = scheduler.add_task(file_task(url, &path)?)?;
        paths.insert(id, path);
    }

    let expected = paths.len();
    let outcomes = tokio::task::spawn_blocking(move || rx.iter().take(expected).collect::<Vec<_>>())
        .await
        .context("fetch task join")?;
    scheduler.close();

    let mut failed = 0usize;
    for outcome in &outcomes {
        if !outcome.is_success() {
            failed += 1;
        }
        let line = FetchLine {
            task: &outcome.task,
            path: paths
                .get(&outcome.task.id)
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            error: outcome.error.as_ref().map(|e| e.to_string()),
        };
        println!("{}", serde_json::to_string(&line)?);
    }
    if failed > 0 {
        anyhow::bail!("{} of {} downloads failed", failed, expected);
    }
    Ok(())
}
