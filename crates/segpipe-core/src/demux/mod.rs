//! Demuxer interface consumed by the segment reader, plus a built-in
//! fragmented MP4 implementation.

mod boxes;
mod fmp4;
#[cfg(test)]
pub(crate) mod test_support;

pub use fmp4::Fmp4Demuxer;

use bytes::Bytes;

use crate::reader::MediaPacket;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DemuxError {
    #[error("malformed segment: {0}")]
    Malformed(String),
    #[error("init segment {0} has not been parsed")]
    MissingInit(u32),
}

/// A media segment handed to the demuxer together with its routing data.
#[derive(Debug, Clone, Copy)]
pub struct MediaUnit<'a> {
    pub track_id: u32,
    pub segment_number: u64,
    /// The track's init segment followed by every init segment it depends on.
    pub init_chain: &'a [u32],
    pub is_extractor: bool,
    pub data: &'a Bytes,
}

/// Open/parse interface between the reader worker and a container parser.
///
/// All calls happen on the reader worker thread.
pub trait Demuxer: Send {
    fn parse_init(&mut self, init_segment_id: u32, data: &Bytes) -> Result<(), DemuxError>;

    /// Demultiplex one media segment into packets in decode order.
    fn parse_media(&mut self, unit: &MediaUnit<'_>) -> Result<Vec<MediaPacket>, DemuxError>;

    /// Decoder configuration record carried by a parsed init segment.
    fn codec_params(&self, _init_segment_id: u32) -> Option<Bytes> {
        None
    }

    fn close(&mut self) {}
}
