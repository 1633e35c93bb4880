//! Segment reader manager.
//!
//! Downloaded segments are opened as nodes grouped by timeline point. A
//! dedicated worker demuxes each node once its track's init chain is parsed,
//! appends the packets to the track's queue, and evicts nodes that wait for
//! their init segments past the configured timeout.

mod deps;
mod packet;
mod queue;
mod segment;
mod source;
mod worker;

pub use packet::MediaPacket;
pub use segment::{InitSegment, MediaSegment, NodeState};
pub use source::{MediaSourceDescriptor, ReaderParams, StreamType, TrackInfo};

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::demux::Demuxer;
use crate::error::{lock, PipelineError, PipelineResult};

use deps::DependencyMap;
use queue::PacketQueue;
use segment::{NodeKind, SegmentNode, Timeline};

/// Init segments sort before every media segment.
const INIT_TIMELINE_POINT: u64 = 0;

struct TrackSlot {
    queue: PacketQueue,
    /// Media segments parsed, failed or evicted.
    seen: u64,
    /// Static end-of-stream threshold for this track.
    expected: Option<u64>,
    eos: bool,
    /// Init chain fully parsed.
    ready: bool,
}

#[derive(Default)]
struct ParsedState {
    timeline: Timeline,
    inits: HashSet<u32>,
}

struct Inner {
    params: ReaderParams,
    deps: DependencyMap,
    working: AtomicBool,
    next_seq: AtomicU64,
    opening: Mutex<Timeline>,
    opening_cv: Condvar,
    opened: Mutex<Timeline>,
    parsed: Mutex<ParsedState>,
    parsed_cv: Condvar,
    tracks: BTreeMap<u32, Mutex<TrackSlot>>,
    codec_params: Mutex<HashMap<u32, Bytes>>,
    ready_count: AtomicUsize,
    all_ready: AtomicBool,
    evicted: AtomicU64,
    failed: AtomicU64,
}

impl Inner {
    fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    fn track(&self, track_id: u32) -> PipelineResult<&Mutex<TrackSlot>> {
        self.tracks
            .get(&track_id)
            .ok_or_else(|| PipelineError::InvalidArgument(format!("unknown track {}", track_id)))
    }

    fn enqueue(&self, kind: NodeKind, track_id: u32, timeline_point: u64, data: Bytes) {
        let node = SegmentNode {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            kind,
            track_id,
            timeline_point,
            data,
            created: Instant::now(),
            state: NodeState::Opening,
        };
        tracing::trace!(
            track = track_id,
            timeline_point,
            bytes = node.data.len(),
            init = node.is_init(),
            "segment opened"
        );
        lock(&self.opening).insert(node);
        self.opening_cv.notify_one();
    }
}

/// Point-in-time reader counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub opening: usize,
    pub opened: usize,
    pub parsed_sets: usize,
    pub ready_tracks: usize,
    pub queued_packets: usize,
    pub dropped_packets: u64,
    /// Nodes evicted for waiting on their init segments past the timeout.
    pub evicted: u64,
    /// Nodes that failed to demux or were evicted.
    pub failed: u64,
    pub oldest_opening_wait: Option<Duration>,
}

pub struct SegmentReaderManager {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SegmentReaderManager {
    /// Load the track/init dependency graph from `source` and start the reader worker.
    pub fn initialize(
        params: ReaderParams,
        source: &MediaSourceDescriptor,
        demuxer: Box<dyn Demuxer>,
    ) -> PipelineResult<Self> {
        let deps = DependencyMap::build(source)?;
        let tracks = deps
            .track_ids()
            .map(|id| {
                let expected = source
                    .tracks
                    .iter()
                    .find(|t| t.track_id == id)
                    .and_then(|t| t.expected_segments)
                    .or(source.expected_segments);
                let slot = TrackSlot {
                    queue: PacketQueue::new(id, params.max_packet_queue_len),
                    seen: 0,
                    expected,
                    eos: false,
                    ready: false,
                };
                (id, Mutex::new(slot))
            })
            .collect();
        let inner = Arc::new(Inner {
            params,
            deps,
            working: AtomicBool::new(true),
            next_seq: AtomicU64::new(0),
            opening: Mutex::new(Timeline::default()),
            opening_cv: Condvar::new(),
            opened: Mutex::new(Timeline::default()),
            parsed: Mutex::new(ParsedState::default()),
            parsed_cv: Condvar::new(),
            tracks,
            codec_params: Mutex::new(HashMap::new()),
            ready_count: AtomicUsize::new(0),
            all_ready: AtomicBool::new(false),
            evicted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("segpipe-reader".into())
            .spawn(move || worker::run(worker_inner, demuxer))
            .map_err(|e| PipelineError::ResourceExhausted(format!("spawn reader worker: {}", e)))?;

        tracing::info!(
            tracks = inner.deps.track_count(),
            segment_timeout_ms = params.segment_timeout.as_millis() as u64,
            stream_type = ?params.stream_type,
            "segment reader started"
        );
        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    fn ensure_open(&self) -> PipelineResult<()> {
        if self.inner.is_working() {
            Ok(())
        } else {
            Err(PipelineError::InvalidArgument("segment reader is closed".into()))
        }
    }

    /// Queue a downloaded init segment for parsing. Returns immediately.
    pub fn open_init_segment(&self, segment: InitSegment) -> PipelineResult<()> {
        self.ensure_open()?;
        if segment.data.is_empty() {
            return Err(PipelineError::InvalidArgument(format!(
                "init segment {} is empty",
                segment.init_segment_id
            )));
        }
        let track_id = self
            .inner
            .deps
            .track_for_init(segment.init_segment_id)
            .ok_or_else(|| {
                PipelineError::InvalidArgument(format!(
                    "unknown init segment {}",
                    segment.init_segment_id
                ))
            })?;
        self.inner.enqueue(
            NodeKind::Init {
                init_segment_id: segment.init_segment_id,
            },
            track_id,
            INIT_TIMELINE_POINT,
            segment.data,
        );
        Ok(())
    }

    /// Queue a downloaded media segment. It is demuxed once its track's init
    /// chain is parsed, or evicted after the segment timeout.
    pub fn open_segment(&self, segment: MediaSegment, is_extractor: bool) -> PipelineResult<()> {
        self.ensure_open()?;
        self.inner.track(segment.track_id)?;
        if segment.data.is_empty() {
            return Err(PipelineError::InvalidArgument(format!(
                "segment {} of track {} is empty",
                segment.segment_number, segment.track_id
            )));
        }
        let is_extractor = is_extractor || self.inner.deps.is_extractor(segment.track_id);
        self.inner.enqueue(
            NodeKind::Media { is_extractor },
            segment.track_id,
            segment.segment_number,
            segment.data,
        );
        Ok(())
    }

    /// Read an init segment from disk and open it like a downloaded one.
    pub fn open_local_init_segment(&self, init_segment_id: u32, path: impl AsRef<Path>) -> PipelineResult<()> {
        let data = read_local(path.as_ref())?;
        self.open_init_segment(InitSegment {
            init_segment_id,
            data,
        })
    }

    /// Read a media segment from disk and open it like a downloaded one.
    pub fn open_local_segment(
        &self,
        track_id: u32,
        segment_number: u64,
        path: impl AsRef<Path>,
        is_extractor: bool,
    ) -> PipelineResult<()> {
        let data = read_local(path.as_ref())?;
        self.open_segment(
            MediaSegment {
                track_id,
                segment_number,
                data,
            },
            is_extractor,
        )
    }

    /// Pop the oldest packet of a track without blocking.
    pub fn get_next_packet(&self, track_id: u32) -> PipelineResult<MediaPacket> {
        let mut slot = lock(self.inner.track(track_id)?);
        let was_full = slot.queue.is_full();
        match slot.queue.pop() {
            Some(packet) => {
                drop(slot);
                if was_full {
                    // Room freed: segments held back by backpressure may proceed.
                    self.inner.opening_cv.notify_one();
                }
                Ok(packet)
            }
            None if slot.eos => Err(PipelineError::EndOfStream),
            None => Err(PipelineError::NotReady),
        }
    }

    /// Like `get_next_packet`, with the track's decoder configuration attached.
    pub fn get_next_packet_with_params(&self, track_id: u32) -> PipelineResult<MediaPacket> {
        let mut packet = self.get_next_packet(track_id)?;
        packet.params = self
            .inner
            .deps
            .init_for_track(track_id)
            .and_then(|init| lock(&self.inner.codec_params).get(&init).cloned());
        Ok(packet)
    }

    pub fn get_packet_queue_size(&self, track_id: u32) -> PipelineResult<usize> {
        Ok(lock(self.inner.track(track_id)?).queue.len())
    }

    /// True once every track's init dependency chain has been parsed.
    pub fn is_init_segments_parsed(&self) -> bool {
        self.inner.all_ready.load(Ordering::Acquire)
    }

    /// Block until every init chain is parsed, the reader closes, or `timeout` passes.
    pub fn wait_init_segments_parsed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut parsed = lock(&self.inner.parsed);
        loop {
            if self.is_init_segments_parsed() {
                return true;
            }
            let now = Instant::now();
            if !self.inner.is_working() || now >= deadline {
                return false;
            }
            parsed = match self.inner.parsed_cv.wait_timeout(parsed, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Account for a media segment that will never be opened, e.g. because
    /// its download failed. It counts toward end of stream like a failed node.
    pub fn skip_segment(&self, track_id: u32, segment_number: u64) -> PipelineResult<()> {
        let mut slot = lock(self.inner.track(track_id)?);
        slot.seen += 1;
        self.inner.check_eos(track_id, &mut slot);
        tracing::debug!(track = track_id, segment = segment_number, "segment skipped");
        Ok(())
    }

    pub fn get_oldest_packet_pts(&self, track_id: u32) -> PipelineResult<Option<u64>> {
        Ok(lock(self.inner.track(track_id)?).queue.oldest_pts())
    }

    /// Drop queued packets of a track whose pts is below `pts`. Returns the number removed.
    pub fn remove_outdated_packets(&self, track_id: u32, pts: u64) -> PipelineResult<usize> {
        let removed = lock(self.inner.track(track_id)?).queue.remove_outdated(pts);
        if removed > 0 {
            tracing::debug!(track = track_id, pts, removed, "trimmed outdated packets");
            self.inner.opening_cv.notify_one();
        }
        Ok(removed)
    }

    pub fn stats(&self) -> ReaderStats {
        let now = Instant::now();
        let (opening, oldest_opening_wait) = {
            let opening = lock(&self.inner.opening);
            (opening.node_count(), opening.oldest_age(now))
        };
        let (queued_packets, dropped_packets) = self
            .inner
            .tracks
            .values()
            .map(|slot| {
                let slot = lock(slot);
                (slot.queue.len(), slot.queue.dropped())
            })
            .fold((0, 0), |(q, d), (sq, sd)| (q + sq, d + sd));
        ReaderStats {
            opening,
            opened: lock(&self.inner.opened).node_count(),
            parsed_sets: lock(&self.inner.parsed).timeline.set_count(),
            ready_tracks: self.inner.ready_count.load(Ordering::Acquire),
            queued_packets,
            dropped_packets,
            evicted: self.inner.evicted.load(Ordering::Acquire),
            failed: self.inner.failed.load(Ordering::Acquire),
            oldest_opening_wait,
        }
    }

    /// Stop and join the worker and drop segments not yet parsed. Queued
    /// packets stay readable. Idempotent.
    pub fn close(&self) {
        let Some(handle) = lock(&self.worker).take() else {
            return;
        };
        self.inner.working.store(false, Ordering::Release);
        {
            let _opening = lock(&self.inner.opening);
            self.inner.opening_cv.notify_all();
        }
        {
            let _parsed = lock(&self.inner.parsed);
            self.inner.parsed_cv.notify_all();
        }
        if handle.join().is_err() {
            tracing::error!("segment reader worker panicked");
        }
        let dropped = lock(&self.inner.opening).clear() + lock(&self.inner.opened).clear();
        tracing::info!(dropped, "segment reader closed");
    }
}

impl Drop for SegmentReaderManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_local(path: &Path) -> PipelineResult<Bytes> {
    fs::read(path)
        .map(Bytes::from)
        .map_err(|e| PipelineError::InvalidArgument(format!("read {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests;
