//! `segpipe demux <init> <segment>...` – feed local files through the reader.

use anyhow::{Context, Result};
use segpipe_core::config::SegpipeConfig;
use segpipe_core::demux::Fmp4Demuxer;
use segpipe_core::reader::{
    MediaPacket, MediaSourceDescriptor, ReaderParams, SegmentReaderManager, StreamType, TrackInfo,
};
use segpipe_core::PipelineError;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(5);

pub(crate) fn print_packet_header() {
    println!(
        "{:>5}  {:>6}  {:>12}  {:>8}  {:>8}  {:>3}",
        "TRACK", "SEG", "PTS", "DUR", "SIZE", "KEY"
    );
}

pub(crate) fn print_packet(p: &MediaPacket) {
    println!(
        "{:>5}  {:>6}  {:>12}  {:>8}  {:>8}  {:>3}",
        p.track_id,
        p.segment_number,
        p.pts,
        p.duration,
        p.size(),
        if p.is_keyframe { "*" } else { "" }
    );
}

/// Drain one static track until end of stream, giving up after `deadline`.
fn drain_track(reader: &SegmentReaderManager, track_id: u32, deadline: Duration) -> Result<usize> {
    let start = Instant::now();
    let mut count = 0usize;
    loop {
        match reader.get_next_packet(track_id) {
            Ok(packet) => {
                if count == 0 {
                    print_packet_header();
                }
                print_packet(&packet);
                count += 1;
            }
            Err(PipelineError::EndOfStream) => return Ok(count),
            Err(PipelineError::NotReady) => {
                if start.elapsed() > deadline {
                    anyhow::bail!("track {} produced no end of stream within {:?}", track_id, deadline);
                }
                std::thread::sleep(POLL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

pub async fn run_demux(cfg: &SegpipeConfig, init: &Path, segments: Vec<PathBuf>, track_id: u32) -> Result<()> {
    let mut params = ReaderParams::from(&cfg.reader);
    params.stream_type = StreamType::Static;
    let source = MediaSourceDescriptor {
        tracks: vec![TrackInfo::new(track_id, track_id)],
        expected_segments: Some(segments.len() as u64),
    };
    let reader = SegmentReaderManager::initialize(params, &source, Box::new(Fmp4Demuxer::new()))?;

    reader
        .open_local_init_segment(track_id, init)
        .with_context(|| format!("open init segment {}", init.display()))?;
    for (i, path) in segments.iter().enumerate() {
        reader
            .open_local_segment(track_id, i as u64 + 1, path, false)
            .with_context(|| format!("open segment {}", path.display()))?;
    }

    // Failed or evicted segments still count toward end of stream.
    let deadline = params.segment_timeout * 2 + Duration::from_secs(5);
    let count = tokio::task::spawn_blocking(move || {
        let count = drain_track(&reader, track_id, deadline);
        let stats = reader.stats();
        reader.close();
        count.map(|c| (c, stats))
    })
    .await
    .context("demux task join")??;

    let (packets, stats) = count;
    println!(
        "{} packet(s) from {} segment(s); {} failed, {} evicted",
        packets,
        segments.len(),
        stats.failed,
        stats.evicted
    );
    Ok(())
}
