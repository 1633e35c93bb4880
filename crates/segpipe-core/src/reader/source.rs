//! Media source description handed to the reader by the manifest layer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `dynamic` streams never end on their own; `static` streams end once every
/// expected segment of a track has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    #[default]
    Dynamic,
    Static,
}

/// One track and the init segment that configures it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub track_id: u32,
    pub init_segment_id: u32,
    /// Init segments this track's init segment depends on (extractor tracks).
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default)]
    pub is_extractor: bool,
    /// Media segments expected on this track. Overrides the descriptor-wide count.
    #[serde(default)]
    pub expected_segments: Option<u64>,
}

impl TrackInfo {
    pub fn new(track_id: u32, init_segment_id: u32) -> Self {
        Self {
            track_id,
            init_segment_id,
            depends_on: Vec::new(),
            is_extractor: false,
            expected_segments: None,
        }
    }

    pub fn depending_on(mut self, init_segment_ids: &[u32]) -> Self {
        self.depends_on = init_segment_ids.to_vec();
        self.is_extractor = true;
        self
    }

    pub fn expecting(mut self, segments: u64) -> Self {
        self.expected_segments = Some(segments);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSourceDescriptor {
    pub tracks: Vec<TrackInfo>,
    /// Media segments expected per track; used for end-of-stream on static
    /// streams when a track carries no count of its own.
    #[serde(default)]
    pub expected_segments: Option<u64>,
}

/// Runtime reader parameters, built from `ReaderConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderParams {
    /// How long a node may wait for its dependencies before eviction.
    pub segment_timeout: Duration,
    pub max_packet_queue_len: usize,
    pub stream_type: StreamType,
}

impl Default for ReaderParams {
    fn default() -> Self {
        Self::from(&crate::config::ReaderConfig::default())
    }
}
