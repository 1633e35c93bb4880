//! Per-track packet queue.

use std::collections::VecDeque;

use super::packet::MediaPacket;

/// FIFO of packets for one track, non-decreasing in `pts`.
///
/// The length bound is checked before a segment is demuxed, so one segment's
/// packets are always queued together and may overshoot it.
#[derive(Debug)]
pub(crate) struct PacketQueue {
    track_id: u32,
    packets: VecDeque<MediaPacket>,
    capacity: usize,
    last_pts: Option<u64>,
    dropped: u64,
}

impl PacketQueue {
    pub(crate) fn new(track_id: u32, capacity: usize) -> Self {
        Self {
            track_id,
            packets: VecDeque::new(),
            capacity: capacity.max(1),
            last_pts: None,
            dropped: 0,
        }
    }

    /// Append a packet. A packet whose pts is below the last queued pts is
    /// dropped; returns false in that case.
    pub(crate) fn push(&mut self, packet: MediaPacket) -> bool {
        if let Some(last) = self.last_pts {
            if packet.pts < last {
                self.dropped += 1;
                tracing::warn!(
                    track = self.track_id,
                    pts = packet.pts,
                    last_pts = last,
                    "dropping packet with regressing timestamp"
                );
                return false;
            }
        }
        self.last_pts = Some(packet.pts);
        self.packets.push_back(packet);
        true
    }

    pub(crate) fn pop(&mut self) -> Option<MediaPacket> {
        self.packets.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.packets.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.packets.len() >= self.capacity
    }

    pub(crate) fn oldest_pts(&self) -> Option<u64> {
        self.packets.front().map(|p| p.pts)
    }

    /// Drop queued packets with `pts < threshold`. Returns how many were removed.
    pub(crate) fn remove_outdated(&mut self, threshold: u64) -> usize {
        let mut removed = 0;
        while self.packets.front().map_or(false, |p| p.pts < threshold) {
            self.packets.pop_front();
            removed += 1;
        }
        removed
    }

    /// Flag the newest queued packet as end-of-stream.
    pub(crate) fn mark_last_eos(&mut self) -> bool {
        match self.packets.back_mut() {
            Some(p) => {
                p.eos = true;
                true
            }
            None => false,
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}
