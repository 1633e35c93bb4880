use bytes::Bytes;

/// One demultiplexed media unit, ready for decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub track_id: u32,
    /// Decode timestamp on the track timescale. Non-decreasing within a track queue.
    pub pts: u64,
    /// Signed offset from `pts` to the composition time, when the container carries one.
    pub composition_offset: i32,
    pub duration: u32,
    /// Timeline point of the segment this packet came from.
    pub segment_number: u64,
    pub payload: Bytes,
    pub is_keyframe: bool,
    /// Last packet of the track.
    pub eos: bool,
    /// Decoder configuration, attached on request by `get_next_packet_with_params`.
    pub params: Option<Bytes>,
}

impl MediaPacket {
    pub fn new(track_id: u32, pts: u64, payload: Bytes) -> Self {
        Self {
            track_id,
            pts,
            composition_offset: 0,
            duration: 0,
            segment_number: 0,
            payload,
            is_keyframe: false,
            eos: false,
            params: None,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
