//! Segment nodes and the timeline-ordered lists they move through.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A downloaded init segment.
#[derive(Debug, Clone)]
pub struct InitSegment {
    pub init_segment_id: u32,
    pub data: Bytes,
}

/// A downloaded media segment of one track.
#[derive(Debug, Clone)]
pub struct MediaSegment {
    pub track_id: u32,
    /// Timeline point shared by all tracks' segments covering the same period.
    pub segment_number: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Opening,
    Opened,
    Parsed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Init { init_segment_id: u32 },
    Media { is_extractor: bool },
}

#[derive(Debug, Clone)]
pub(crate) struct SegmentNode {
    pub(crate) seq: u64,
    pub(crate) kind: NodeKind,
    pub(crate) track_id: u32,
    pub(crate) timeline_point: u64,
    pub(crate) data: Bytes,
    pub(crate) created: Instant,
    pub(crate) state: NodeState,
}

impl SegmentNode {
    pub(crate) fn is_init(&self) -> bool {
        matches!(self.kind, NodeKind::Init { .. })
    }

    pub(crate) fn waited_past(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created) >= timeout
    }
}

/// All nodes sharing one timeline point, across tracks.
#[derive(Debug)]
pub(crate) struct TimedSet {
    pub(crate) created: Instant,
    pub(crate) nodes: Vec<SegmentNode>,
}

/// Timed sets ordered by timeline point.
#[derive(Debug, Default)]
pub(crate) struct Timeline {
    sets: BTreeMap<u64, TimedSet>,
}

impl Timeline {
    pub(crate) fn insert(&mut self, node: SegmentNode) {
        self.sets
            .entry(node.timeline_point)
            .or_insert_with(|| TimedSet {
                created: node.created,
                nodes: Vec::new(),
            })
            .nodes
            .push(node);
    }

    /// Remove and return the first node, in timeline then arrival order, accepted by `ready`.
    pub(crate) fn take_first<F>(&mut self, mut ready: F) -> Option<SegmentNode>
    where
        F: FnMut(&SegmentNode) -> bool,
    {
        let (point, idx) = self.sets.iter().find_map(|(point, set)| {
            set.nodes.iter().position(&mut ready).map(|idx| (*point, idx))
        })?;
        self.remove_at(point, idx)
    }

    /// Remove the node with sequence number `seq` at `point`.
    pub(crate) fn remove(&mut self, point: u64, seq: u64) -> Option<SegmentNode> {
        let idx = self.sets.get(&point)?.nodes.iter().position(|n| n.seq == seq)?;
        self.remove_at(point, idx)
    }

    fn remove_at(&mut self, point: u64, idx: usize) -> Option<SegmentNode> {
        let set = self.sets.get_mut(&point)?;
        let node = set.nodes.remove(idx);
        if set.nodes.is_empty() {
            self.sets.remove(&point);
        }
        Some(node)
    }

    /// Remove nodes that are still blocked (`blocked` returns true) after `timeout`.
    pub(crate) fn evict_stale<F>(&mut self, timeout: Duration, now: Instant, mut blocked: F) -> Vec<SegmentNode>
    where
        F: FnMut(&SegmentNode) -> bool,
    {
        let mut evicted = Vec::new();
        for set in self.sets.values_mut() {
            let mut i = 0;
            while i < set.nodes.len() {
                if set.nodes[i].waited_past(timeout, now) && blocked(&set.nodes[i]) {
                    evicted.push(set.nodes.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        self.sets.retain(|_, set| !set.nodes.is_empty());
        evicted
    }

    /// Earliest instant at which a node matching `evictable` reaches `timeout`.
    pub(crate) fn next_deadline<F>(&self, timeout: Duration, mut evictable: F) -> Option<Instant>
    where
        F: FnMut(&SegmentNode) -> bool,
    {
        self.sets
            .values()
            .flat_map(|s| s.nodes.iter())
            .filter(|n| evictable(n))
            .map(|n| n.created + timeout)
            .min()
    }

    /// Drop every set whose timeline point is below `point`. Returns the number of sets removed.
    pub(crate) fn prune_before(&mut self, point: u64) -> usize {
        let kept = self.sets.split_off(&point);
        let removed = self.sets.len();
        self.sets = kept;
        removed
    }

    /// Age of the longest-waiting set.
    pub(crate) fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.sets
            .values()
            .map(|s| now.saturating_duration_since(s.created))
            .max()
    }

    pub(crate) fn newest_point(&self) -> Option<u64> {
        self.sets.keys().next_back().copied()
    }

    pub(crate) fn node_count(&self) -> usize {
        self.sets.values().map(|s| s.nodes.len()).sum()
    }

    pub(crate) fn set_count(&self) -> usize {
        self.sets.len()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let n = self.node_count();
        self.sets.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(seq: u64, track_id: u32, point: u64, created: Instant) -> SegmentNode {
        SegmentNode {
            seq,
            kind: NodeKind::Media { is_extractor: false },
            track_id,
            timeline_point: point,
            data: Bytes::from_static(b"x"),
            created,
            state: NodeState::Opening,
        }
    }

    #[test]
    fn take_first_follows_timeline_then_arrival() {
        let now = Instant::now();
        let mut t = Timeline::default();
        t.insert(node(1, 1, 5, now));
        t.insert(node(2, 2, 3, now));
        t.insert(node(3, 1, 3, now));
        assert_eq!(t.set_count(), 2);

        let first = t.take_first(|_| true).unwrap();
        assert_eq!((first.seq, first.timeline_point), (2, 3));
        let next = t.take_first(|n| n.track_id == 1).unwrap();
        assert_eq!(next.seq, 3);
        assert_eq!(t.set_count(), 1, "emptied set is dropped");
        assert!(t.take_first(|n| n.track_id == 9).is_none());
    }

    #[test]
    fn evicts_only_blocked_nodes_past_timeout() {
        let start = Instant::now();
        let mut t = Timeline::default();
        t.insert(node(1, 1, 1, start));
        t.insert(node(2, 2, 1, start));
        t.insert(node(3, 2, 2, start + Duration::from_millis(500)));

        let now = start + Duration::from_millis(300);
        let evicted = t.evict_stale(Duration::from_millis(200), now, |n| n.track_id == 2);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].seq, 2);
        assert_eq!(t.node_count(), 2);
        assert_eq!(
            t.next_deadline(Duration::from_millis(200), |_| true),
            Some(start + Duration::from_millis(200))
        );
    }

    #[test]
    fn deadline_ignores_nodes_that_cannot_be_evicted() {
        let start = Instant::now();
        let mut t = Timeline::default();
        t.insert(node(1, 1, 1, start));
        t.insert(node(2, 2, 2, start + Duration::from_millis(500)));
        let timeout = Duration::from_millis(200);

        assert_eq!(
            t.next_deadline(timeout, |n| n.track_id == 2),
            Some(start + Duration::from_millis(700))
        );
        assert_eq!(t.next_deadline(timeout, |n| n.track_id == 9), None);
    }

    #[test]
    fn prune_and_remove() {
        let now = Instant::now();
        let mut t = Timeline::default();
        for p in 0..6u64 {
            t.insert(node(p, 1, p, now));
        }
        assert_eq!(t.prune_before(4), 4);
        assert_eq!(t.newest_point(), Some(5));
        assert!(t.remove(5, 5).is_some());
        assert!(t.remove(5, 5).is_none());
        assert_eq!(t.clear(), 1);
    }
}
