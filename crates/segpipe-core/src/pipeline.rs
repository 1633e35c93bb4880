//! Download-to-demux glue: every finished segment download is opened on the
//! segment reader; failed downloads leave a gap in their track.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::SegpipeConfig;
use crate::demux::Demuxer;
use crate::error::{lock, PipelineResult};
use crate::reader::{
    InitSegment, MediaSegment, MediaSourceDescriptor, ReaderParams, ReaderStats, SegmentReaderManager,
};
use crate::scheduler::{
    DownloadScheduler, DownloadTask, SchedulerStats, TaskId, TaskIdSequence, TaskOutcome, TaskSnapshot,
    TransferParams,
};

/// Where a downloaded segment goes once it is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Init { init_segment_id: u32 },
    Media {
        track_id: u32,
        segment_number: u64,
        is_extractor: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub url: String,
    pub kind: SegmentKind,
}

impl SegmentRequest {
    pub fn init(url: impl Into<String>, init_segment_id: u32) -> Self {
        Self {
            url: url.into(),
            kind: SegmentKind::Init { init_segment_id },
        }
    }

    pub fn media(url: impl Into<String>, track_id: u32, segment_number: u64) -> Self {
        Self {
            url: url.into(),
            kind: SegmentKind::Media {
                track_id,
                segment_number,
                is_extractor: false,
            },
        }
    }
}

struct Inflight {
    kind: SegmentKind,
    buffer: Arc<Mutex<Vec<u8>>>,
}

#[derive(Default)]
struct Counters {
    requested: AtomicU64,
    opened: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub requested: u64,
    /// Downloads handed to the reader.
    pub opened: u64,
    /// Downloads that exhausted their retries or could not be opened.
    pub failed: u64,
    pub in_flight: usize,
    pub scheduler: SchedulerStats,
    pub reader: ReaderStats,
}

pub struct SegmentPipeline {
    scheduler: DownloadScheduler,
    reader: Arc<SegmentReaderManager>,
    inflight: Arc<Mutex<HashMap<TaskId, Inflight>>>,
    counters: Arc<Counters>,
}

impl SegmentPipeline {
    pub fn start(
        cfg: &SegpipeConfig,
        source: &MediaSourceDescriptor,
        demuxer: Box<dyn Demuxer>,
    ) -> PipelineResult<Self> {
        let reader = Arc::new(SegmentReaderManager::initialize(
            ReaderParams::from(&cfg.reader),
            source,
            demuxer,
        )?);
        let inflight: Arc<Mutex<HashMap<TaskId, Inflight>>> = Arc::new(Mutex::new(HashMap::new()));
        let counters = Arc::new(Counters::default());

        let done_reader = Arc::clone(&reader);
        let done_inflight = Arc::clone(&inflight);
        let done_counters = Arc::clone(&counters);
        let scheduler = DownloadScheduler::init(
            TransferParams::from(&cfg.transfer),
            TaskIdSequence::default(),
            move |outcome| on_download_done(&done_reader, &done_inflight, &done_counters, outcome),
        )?;
        Ok(Self {
            scheduler,
            reader,
            inflight,
            counters,
        })
    }

    /// Schedule a segment download. The buffer is opened on the reader when
    /// the download finishes.
    pub fn request(&self, req: SegmentRequest) -> PipelineResult<TaskId> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let task = DownloadTask::new(req.url.clone()).on_chunk(move |data, offset| {
            let mut buf = lock(&sink);
            buf.truncate(offset as usize);
            buf.extend_from_slice(data);
        });
        // Held across add_task so the completion callback always finds the entry.
        let mut inflight = lock(&self.inflight);
        let id = self.scheduler.add_task(task)?;
        inflight.insert(
            id,
            Inflight {
                kind: req.kind,
                buffer,
            },
        );
        self.counters.requested.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task = %id, url = %req.url, kind = ?req.kind, "segment requested");
        Ok(id)
    }

    /// Cancel a pending or running download. Its segment is never opened.
    pub fn cancel(&self, id: TaskId) -> PipelineResult<TaskSnapshot> {
        let snapshot = self.scheduler.remove_task(id)?;
        lock(&self.inflight).remove(&id);
        Ok(snapshot)
    }

    pub fn reader(&self) -> &SegmentReaderManager {
        &self.reader
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            requested: self.counters.requested.load(Ordering::Relaxed),
            opened: self.counters.opened.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight: lock(&self.inflight).len(),
            scheduler: self.scheduler.stats(),
            reader: self.reader.stats(),
        }
    }

    /// Stop downloads, then the reader. Queued packets stay readable.
    pub fn close(&mut self) {
        let abandoned = self.scheduler.close();
        if !abandoned.is_empty() {
            tracing::info!(count = abandoned.len(), "pipeline closed with downloads outstanding");
        }
        lock(&self.inflight).clear();
        self.reader.close();
    }
}

impl Drop for SegmentPipeline {
    fn drop(&mut self) {
        self.close();
    }
}

fn on_download_done(
    reader: &SegmentReaderManager,
    inflight: &Mutex<HashMap<TaskId, Inflight>>,
    counters: &Counters,
    outcome: TaskOutcome,
) {
    let id = outcome.task.id;
    let Some(entry) = lock(inflight).remove(&id) else {
        tracing::trace!(task = %id, "completion for a cancelled segment");
        return;
    };
    if !outcome.is_success() {
        counters.failed.fetch_add(1, Ordering::Relaxed);
        let reason = outcome.error.map(|e| e.to_string()).unwrap_or_default();
        tracing::warn!(
            task = %id,
            url = %outcome.task.url,
            kind = ?entry.kind,
            "segment download failed, leaving a gap: {}",
            reason
        );
        skip_media(reader, entry.kind);
        return;
    }

    let data = Bytes::from(std::mem::take(&mut *lock(&entry.buffer)));
    let opened = match entry.kind {
        SegmentKind::Init { init_segment_id } => reader.open_init_segment(InitSegment {
            init_segment_id,
            data,
        }),
        SegmentKind::Media {
            track_id,
            segment_number,
            is_extractor,
        } => reader.open_segment(
            MediaSegment {
                track_id,
                segment_number,
                data,
            },
            is_extractor,
        ),
    };
    match opened {
        Ok(()) => {
            counters.opened.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(task = %id, kind = ?entry.kind, "could not open downloaded segment: {}", e);
            skip_media(reader, entry.kind);
        }
    }
}

/// A lost media segment still counts toward its track's end of stream.
fn skip_media(reader: &SegmentReaderManager, kind: SegmentKind) {
    if let SegmentKind::Media {
        track_id,
        segment_number,
        ..
    } = kind
    {
        if let Err(e) = reader.skip_segment(track_id, segment_number) {
            tracing::debug!(track = track_id, "could not record skipped segment: {}", e);
        }
    }
}
