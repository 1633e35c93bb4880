//! Reader worker loop: evict stale nodes, pick the first ready node, demux it.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::demux::{DemuxError, Demuxer, MediaUnit};
use crate::error::{lock, PipelineError};

use super::segment::{NodeKind, NodeState, SegmentNode};
use super::source::StreamType;
use super::{Inner, TrackSlot};

/// Upper bound on one idle wait, so stale nodes are evicted promptly.
const IDLE_WAIT: Duration = Duration::from_millis(20);
/// Parsed timeline points kept behind the newest one.
const PARSED_RETENTION: u64 = 2;

pub(super) fn run(inner: Arc<Inner>, mut demuxer: Box<dyn Demuxer>) {
    tracing::debug!("reader worker running");
    while inner.is_working() {
        inner.evict_stale(Instant::now());
        match inner.next_ready_node() {
            Some(node) => inner.process(node, demuxer.as_mut()),
            None => inner.wait_for_segments(),
        }
    }
    demuxer.close();
    tracing::debug!("reader worker stopped");
}

impl Inner {
    fn parsed_inits(&self) -> HashSet<u32> {
        lock(&self.parsed).inits.clone()
    }

    /// Take the first node, in timeline order, whose dependencies are parsed
    /// and whose track queue has room. Init segments are always ready.
    fn next_ready_node(&self) -> Option<SegmentNode> {
        let inits = self.parsed_inits();
        let full: HashSet<u32> = self
            .tracks
            .iter()
            .filter(|(_, slot)| lock(slot).queue.is_full())
            .map(|(id, _)| *id)
            .collect();
        lock(&self.opening).take_first(|node| match node.kind {
            NodeKind::Init { .. } => true,
            NodeKind::Media { .. } => {
                !full.contains(&node.track_id) && self.deps.chain_parsed(node.track_id, &inits)
            }
        })
    }

    /// Only media nodes whose init chain is unparsed can go stale. Nodes held
    /// back by a full queue wait for the consumer instead.
    fn waits_on_inits(&self, node: &SegmentNode, inits: &HashSet<u32>) -> bool {
        !node.is_init() && !self.deps.chain_parsed(node.track_id, inits)
    }

    /// Sleep until the next possible eviction, at most `IDLE_WAIT`. New
    /// segments and freed queue room wake the worker early.
    pub(super) fn wait_for_segments(&self) {
        let inits = self.parsed_inits();
        let opening = lock(&self.opening);
        if !self.is_working() {
            return;
        }
        let now = Instant::now();
        let timeout = opening
            .next_deadline(self.params.segment_timeout, |node| self.waits_on_inits(node, &inits))
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or(IDLE_WAIT)
            .clamp(Duration::from_millis(1), IDLE_WAIT);
        let _ = self.opening_cv.wait_timeout(opening, timeout);
    }

    /// Mark nodes still waiting for init segments past the timeout as FAILED.
    fn evict_stale(&self, now: Instant) {
        let inits = self.parsed_inits();
        let evicted = lock(&self.opening).evict_stale(self.params.segment_timeout, now, |node| {
            self.waits_on_inits(node, &inits)
        });
        for node in evicted {
            let err = PipelineError::DependencyUnsatisfied(format!(
                "track {} segment {} waited {:?}",
                node.track_id,
                node.timeline_point,
                now.saturating_duration_since(node.created)
            ));
            tracing::warn!(track = node.track_id, timeline_point = node.timeline_point, "evicting stalled segment: {}", err);
            self.evicted.fetch_add(1, Ordering::AcqRel);
            self.finish(node, NodeState::Failed);
        }
    }

    fn process(&self, mut node: SegmentNode, demuxer: &mut dyn Demuxer) {
        node.state = NodeState::Opened;
        lock(&self.opened).insert(node.clone());
        let outcome = catch_unwind(AssertUnwindSafe(|| self.demux(&node, demuxer)));
        lock(&self.opened).remove(node.timeline_point, node.seq);
        let state = match outcome {
            Ok(Ok(())) => NodeState::Parsed,
            Ok(Err(e)) => {
                tracing::warn!(
                    track = node.track_id,
                    timeline_point = node.timeline_point,
                    "demux failed: {}",
                    e
                );
                NodeState::Failed
            }
            Err(_) => {
                tracing::error!(
                    track = node.track_id,
                    timeline_point = node.timeline_point,
                    "demuxer panicked"
                );
                NodeState::Failed
            }
        };
        self.finish(node, state);
    }

    fn demux(&self, node: &SegmentNode, demuxer: &mut dyn Demuxer) -> Result<(), DemuxError> {
        match node.kind {
            NodeKind::Init { init_segment_id } => {
                demuxer.parse_init(init_segment_id, &node.data)?;
                if let Some(params) = demuxer.codec_params(init_segment_id) {
                    lock(&self.codec_params).insert(init_segment_id, params);
                }
                Ok(())
            }
            NodeKind::Media { is_extractor } => {
                let chain = self.deps.track_chain(node.track_id).unwrap_or_default();
                let unit = MediaUnit {
                    track_id: node.track_id,
                    segment_number: node.timeline_point,
                    init_chain: &chain,
                    is_extractor,
                    data: &node.data,
                };
                let packets = demuxer.parse_media(&unit)?;
                let Some(slot) = self.tracks.get(&node.track_id) else {
                    return Ok(());
                };
                let mut slot = lock(slot);
                let mut queued = 0usize;
                for mut packet in packets {
                    packet.track_id = node.track_id;
                    packet.segment_number = node.timeline_point;
                    let eos = packet.eos;
                    if slot.queue.push(packet) {
                        queued += 1;
                    }
                    if eos && !slot.eos {
                        slot.eos = true;
                        tracing::info!(track = node.track_id, "end of stream marked by demuxer");
                    }
                }
                tracing::trace!(
                    track = node.track_id,
                    timeline_point = node.timeline_point,
                    queued,
                    "segment demuxed"
                );
                Ok(())
            }
        }
    }

    /// Record the node's final state, update readiness and end-of-stream
    /// accounting, and move it to the parsed list.
    fn finish(&self, mut node: SegmentNode, state: NodeState) {
        node.state = state;
        node.data = Bytes::new();
        if state == NodeState::Failed {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
        if !node.is_init() {
            if let Some(slot) = self.tracks.get(&node.track_id) {
                let mut slot = lock(slot);
                slot.seen += 1;
                self.check_eos(node.track_id, &mut slot);
            }
        }

        let mut parsed = lock(&self.parsed);
        if let (NodeKind::Init { init_segment_id }, NodeState::Parsed) = (node.kind, state) {
            parsed.inits.insert(init_segment_id);
            self.update_readiness(&parsed.inits);
        }
        let point = node.timeline_point;
        parsed.timeline.insert(node);
        if let Some(newest) = parsed.timeline.newest_point() {
            if point == newest && newest > PARSED_RETENTION {
                parsed.timeline.prune_before(newest - PARSED_RETENTION);
            }
        }
        drop(parsed);
        self.parsed_cv.notify_all();
    }

    /// Flip per-track readiness for tracks whose init chain is now parsed.
    /// Called with the parsed lock held.
    fn update_readiness(&self, inits: &HashSet<u32>) {
        for (track_id, slot) in &self.tracks {
            let mut slot = lock(slot);
            if slot.ready || !self.deps.chain_parsed(*track_id, inits) {
                continue;
            }
            slot.ready = true;
            let ready = self.ready_count.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::debug!(track = track_id, ready, "track init chain parsed");
            if ready == self.tracks.len() {
                self.all_ready.store(true, Ordering::Release);
                tracing::info!(tracks = ready, "all init segments parsed");
            }
        }
    }

    pub(super) fn check_eos(&self, track_id: u32, slot: &mut TrackSlot) {
        if slot.eos || self.params.stream_type != StreamType::Static {
            return;
        }
        let Some(expected) = slot.expected else {
            return;
        };
        if slot.seen >= expected {
            slot.eos = true;
            slot.queue.mark_last_eos();
            tracing::info!(track = track_id, seen = slot.seen, "track reached end of stream");
        }
    }
}
