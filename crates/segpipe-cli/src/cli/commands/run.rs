//! `segpipe run <segments.toml>` – download and demux a static segment list.
//!
//! ```toml
//! stream_type = "static"
//!
//! [[tracks]]
//! track_id = 1
//! init_segment_id = 101
//! init_url = "https://cdn.example/tile1/init.mp4"
//! segments = ["https://cdn.example/tile1/1.m4s", "https://cdn.example/tile1/2.m4s"]
//! ```

use anyhow::{Context, Result};
use segpipe_core::config::SegpipeConfig;
use segpipe_core::demux::Fmp4Demuxer;
use segpipe_core::pipeline::{SegmentKind, SegmentPipeline, SegmentRequest};
use segpipe_core::reader::{MediaSourceDescriptor, StreamType, TrackInfo};
use segpipe_core::PipelineError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SegmentList {
    #[serde(default)]
    pub stream_type: Option<StreamType>,
    pub tracks: Vec<TrackEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TrackEntry {
    pub track_id: u32,
    pub init_segment_id: u32,
    #[serde(default)]
    pub depends_on: Vec<u32>,
    pub init_url: String,
    #[serde(default)]
    pub segments: Vec<String>,
}

impl SegmentList {
    pub(crate) fn parse(data: &str) -> Result<Self> {
        let list: SegmentList = toml::from_str(data)?;
        if list.tracks.is_empty() {
            anyhow::bail!("segment list has no tracks");
        }
        Ok(list)
    }

    pub(crate) fn source(&self) -> MediaSourceDescriptor {
        let tracks = self
            .tracks
            .iter()
            .map(|t| {
                let info = TrackInfo::new(t.track_id, t.init_segment_id)
                    .expecting(t.segments.len() as u64);
                if t.depends_on.is_empty() {
                    info
                } else {
                    info.depending_on(&t.depends_on)
                }
            })
            .collect();
        MediaSourceDescriptor {
            tracks,
            expected_segments: None,
        }
    }

    /// Init requests first, then media requests ordered by segment number
    /// across tracks.
    pub(crate) fn requests(&self) -> Vec<SegmentRequest> {
        let mut out: Vec<SegmentRequest> = self
            .tracks
            .iter()
            .map(|t| SegmentRequest::init(t.init_url.clone(), t.init_segment_id))
            .collect();
        let rounds = self.tracks.iter().map(|t| t.segments.len()).max().unwrap_or(0);
        for n in 0..rounds {
            for t in &self.tracks {
                if let Some(url) = t.segments.get(n) {
                    out.push(SegmentRequest {
                        url: url.clone(),
                        kind: SegmentKind::Media {
                            track_id: t.track_id,
                            segment_number: n as u64 + 1,
                            is_extractor: !t.depends_on.is_empty(),
                        },
                    });
                }
            }
        }
        out
    }
}

/// Pull packets from every track until all report end of stream or `stop` is set.
fn consume(pipeline: &SegmentPipeline, track_ids: &[u32], stop: &AtomicBool) -> BTreeMap<u32, usize> {
    let mut counts: BTreeMap<u32, usize> = track_ids.iter().map(|&t| (t, 0)).collect();
    let mut ended: Vec<u32> = Vec::new();
    while ended.len() < track_ids.len() && !stop.load(Ordering::Relaxed) {
        let mut idle = true;
        for &track in track_ids {
            if ended.contains(&track) {
                continue;
            }
            match pipeline.reader().get_next_packet(track) {
                Ok(packet) => {
                    idle = false;
                    *counts.entry(track).or_default() += 1;
                    super::demux::print_packet(&packet);
                }
                Err(PipelineError::EndOfStream) => ended.push(track),
                Err(PipelineError::NotReady) => {}
                Err(e) => {
                    tracing::warn!(track, "packet read failed: {}", e);
                    ended.push(track);
                }
            }
        }
        if idle {
            std::thread::sleep(POLL);
        }
    }
    counts
}

pub async fn run_pipeline(cfg: &SegpipeConfig, list_path: &Path) -> Result<()> {
    let data = std::fs::read_to_string(list_path)
        .with_context(|| format!("read segment list {}", list_path.display()))?;
    let list = SegmentList::parse(&data)?;

    let mut cfg = cfg.clone();
    cfg.reader.stream_type = list.stream_type.unwrap_or(StreamType::Static);
    if cfg.reader.stream_type == StreamType::Dynamic {
        tracing::info!("dynamic stream: run ends on Ctrl-C");
    }
    let mut pipeline = SegmentPipeline::start(&cfg, &list.source(), Box::new(Fmp4Demuxer::new()))?;
    for req in list.requests() {
        pipeline.request(req)?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let ctrl_c_stop = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted; closing pipeline");
            ctrl_c_stop.store(true, Ordering::Relaxed);
        }
    });

    let track_ids: Vec<u32> = list.tracks.iter().map(|t| t.track_id).collect();
    let (counts, stats) = tokio::task::spawn_blocking(move || {
        super::demux::print_packet_header();
        let counts = consume(&pipeline, &track_ids, &stop);
        let stats = pipeline.stats();
        pipeline.close();
        (counts, stats)
    })
    .await
    .context("pipeline task join")?;

    for (track, n) in &counts {
        println!("track {}: {} packet(s)", track, n);
    }
    println!(
        "{} segment(s) requested, {} opened, {} failed, {} evicted",
        stats.requested, stats.opened, stats.failed, stats.reader.evicted
    );
    Ok(())
}
