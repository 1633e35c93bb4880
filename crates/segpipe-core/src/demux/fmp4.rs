//! Fragmented MP4 demuxer.
//!
//! Init segments are read for `tkhd` track ids, `mdhd` timescales and the
//! first `stsd` sample entry (with its `avcC`/`hvcC`/`av1C` record). Media
//! segments are split into one packet per `trun` sample, timestamped with the
//! `tfdt` base decode time plus accumulated sample durations.

use bytes::Bytes;
use std::collections::HashMap;

use crate::reader::MediaPacket;

use super::boxes::{box_at, children, find_first_box, find_path, full_box_header, BoxView, Reader};
use super::{DemuxError, Demuxer, MediaUnit};

/// Bytes of a visual sample entry body before its child boxes.
const VISUAL_SAMPLE_ENTRY_HEADER: usize = 70;

const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
const TFHD_DEFAULT_DURATION: u32 = 0x000008;
const TFHD_DEFAULT_SIZE: u32 = 0x000010;
const TFHD_DEFAULT_FLAGS: u32 = 0x000020;

const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
const TRUN_DURATION: u32 = 0x000100;
const TRUN_SIZE: u32 = 0x000200;
const TRUN_FLAGS: u32 = 0x000400;
const TRUN_CTO: u32 = 0x000800;

/// `sample_is_non_sync_sample` bit of ISOBMFF sample flags.
const SAMPLE_NON_SYNC: u32 = 0x0001_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackDesc {
    track_id: u32,
    timescale: u32,
    sample_entry: [u8; 4],
    config: Option<Bytes>,
}

#[derive(Debug, Default)]
pub struct Fmp4Demuxer {
    inits: HashMap<u32, Vec<TrackDesc>>,
    /// Next decode time per (init segment, file track id), for fragments without `tfdt`.
    next_decode_time: HashMap<(u32, u32), u64>,
}

impl Fmp4Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timescale of the first track described by a parsed init segment.
    pub fn timescale(&self, init_segment_id: u32) -> Option<u32> {
        self.inits.get(&init_segment_id)?.first().map(|t| t.timescale)
    }

    /// Sample entry fourcc (e.g. `hvc1`) of the first track of an init segment.
    pub fn codec(&self, init_segment_id: u32) -> Option<String> {
        let t = self.inits.get(&init_segment_id)?.first()?;
        Some(String::from_utf8_lossy(&t.sample_entry).into_owned())
    }
}

impl Demuxer for Fmp4Demuxer {
    fn parse_init(&mut self, init_segment_id: u32, data: &Bytes) -> Result<(), DemuxError> {
        let tracks = parse_init_tracks(data)?;
        tracing::debug!(
            init_segment_id,
            tracks = tracks.len(),
            codec = %String::from_utf8_lossy(&tracks[0].sample_entry),
            timescale = tracks[0].timescale,
            "parsed init segment"
        );
        self.inits.insert(init_segment_id, tracks);
        Ok(())
    }

    fn parse_media(&mut self, unit: &MediaUnit<'_>) -> Result<Vec<MediaPacket>, DemuxError> {
        let Some((&own_init, deps)) = unit.init_chain.split_first() else {
            return Err(DemuxError::Malformed(format!("track {} has no init segment", unit.track_id)));
        };
        if let Some(missing) = deps.iter().find(|id| !self.inits.contains_key(id)) {
            return Err(DemuxError::MissingInit(*missing));
        }
        let tracks = self
            .inits
            .get(&own_init)
            .ok_or(DemuxError::MissingInit(own_init))?
            .clone();

        let data = unit.data;
        let mut packets = Vec::new();
        let mut fragments = 0usize;
        for top in children(data, 0, data.len()) {
            if top.fourcc != *b"moof" {
                continue;
            }
            fragments += 1;
            let mdat = find_first_box(data, top.end, data.len(), *b"mdat")
                .ok_or_else(|| DemuxError::Malformed("moof without following mdat".into()))?;
            for traf in children(data, top.body_start, top.end).filter(|b| b.fourcc == *b"traf") {
                self.parse_traf(unit, own_init, &tracks, data, top, traf, mdat, &mut packets)?;
            }
        }
        if fragments == 0 {
            return Err(DemuxError::Malformed(format!(
                "segment {} of track {} has no moof box",
                unit.segment_number, unit.track_id
            )));
        }
        Ok(packets)
    }

    fn codec_params(&self, init_segment_id: u32) -> Option<Bytes> {
        self.inits
            .get(&init_segment_id)?
            .iter()
            .find_map(|t| t.config.clone())
    }

    fn close(&mut self) {
        tracing::debug!(inits = self.inits.len(), "closing fmp4 demuxer");
        self.inits.clear();
        self.next_decode_time.clear();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FragmentDefaults {
    base_data_offset: u64,
    duration: Option<u32>,
    size: Option<u32>,
    flags: Option<u32>,
}

impl Fmp4Demuxer {
    #[allow(clippy::too_many_arguments)]
    fn parse_traf(
        &mut self,
        unit: &MediaUnit<'_>,
        own_init: u32,
        tracks: &[TrackDesc],
        data: &Bytes,
        moof: BoxView,
        traf: BoxView,
        mdat: BoxView,
        packets: &mut Vec<MediaPacket>,
    ) -> Result<(), DemuxError> {
        let tfhd = find_first_box(data, traf.body_start, traf.end, *b"tfhd")
            .ok_or_else(|| DemuxError::Malformed("traf without tfhd".into()))?;
        let (file_track_id, defaults) = parse_tfhd(tfhd.body(data), moof.start as u64)?;
        if !tracks.iter().any(|t| t.track_id == file_track_id) {
            tracing::trace!(file_track_id, "skipping fragment of a track outside the init segment");
            return Ok(());
        }

        let key = (own_init, file_track_id);
        let mut decode_time = match find_first_box(data, traf.body_start, traf.end, *b"tfdt") {
            Some(tfdt) => parse_tfdt(tfdt.body(data))?,
            None => self.next_decode_time.get(&key).copied().unwrap_or(0),
        };

        let mut next_offset: Option<u64> = None;
        for trun in children(data, traf.body_start, traf.end).filter(|b| b.fourcc == *b"trun") {
            let samples = parse_trun(trun.body(data), &defaults, &mut next_offset)?;
            for s in samples {
                let start = usize::try_from(s.offset)
                    .map_err(|_| DemuxError::Malformed("sample offset overflows".into()))?;
                let end = start
                    .checked_add(s.size as usize)
                    .ok_or_else(|| DemuxError::Malformed("sample end overflows".into()))?;
                if start < mdat.body_start || end > mdat.end {
                    return Err(DemuxError::Malformed(format!(
                        "sample [{}..{}) outside mdat [{}..{})",
                        start, end, mdat.body_start, mdat.end
                    )));
                }
                packets.push(MediaPacket {
                    track_id: unit.track_id,
                    pts: decode_time,
                    composition_offset: s.composition_offset,
                    duration: s.duration,
                    segment_number: unit.segment_number,
                    payload: data.slice(start..end),
                    is_keyframe: s.flags & SAMPLE_NON_SYNC == 0,
                    eos: false,
                    params: None,
                });
                decode_time = decode_time
                    .checked_add(u64::from(s.duration))
                    .ok_or_else(|| DemuxError::Malformed("decode time overflows".into()))?;
            }
        }
        self.next_decode_time.insert(key, decode_time);
        Ok(())
    }
}

fn parse_init_tracks(data: &Bytes) -> Result<Vec<TrackDesc>, DemuxError> {
    let moov = find_first_box(data, 0, data.len(), *b"moov")
        .ok_or_else(|| DemuxError::Malformed("init segment has no moov box".into()))?;
    let mut tracks = Vec::new();
    for trak in children(data, moov.body_start, moov.end).filter(|b| b.fourcc == *b"trak") {
        tracks.push(parse_trak(data, trak)?);
    }
    if tracks.is_empty() {
        return Err(DemuxError::Malformed("init segment has no tracks".into()));
    }
    Ok(tracks)
}

fn parse_trak(data: &Bytes, trak: BoxView) -> Result<TrackDesc, DemuxError> {
    let malformed = |what: &str| DemuxError::Malformed(format!("trak: {}", what));

    let tkhd = find_first_box(data, trak.body_start, trak.end, *b"tkhd").ok_or_else(|| malformed("missing tkhd"))?;
    let track_id = versioned_u32(tkhd.body(data), 12, 20).ok_or_else(|| malformed("short tkhd"))?;

    let mdhd = find_path(data, trak.body_start, trak.end, &[*b"mdia", *b"mdhd"]).ok_or_else(|| malformed("missing mdhd"))?;
    let timescale = versioned_u32(mdhd.body(data), 12, 20).ok_or_else(|| malformed("short mdhd"))?;

    let stsd = find_path(data, trak.body_start, trak.end, &[*b"mdia", *b"minf", *b"stbl", *b"stsd"])
        .ok_or_else(|| malformed("missing stsd"))?;
    // FullBox header + entry_count precede the sample entries.
    let entry = box_at(data, stsd.body_start + 8, stsd.end).ok_or_else(|| malformed("empty stsd"))?;
    let config = sample_entry_config(data, entry);

    Ok(TrackDesc {
        track_id,
        timescale,
        sample_entry: entry.fourcc,
        config,
    })
}

/// A u32 at `v0` bytes into a full box body, or `v1` bytes for version 1.
fn versioned_u32(body: &[u8], v0: usize, v1: usize) -> Option<u32> {
    let (version, _) = full_box_header(body)?;
    let at = if version == 1 { v1 } else { v0 };
    let b = body.get(at..at + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn sample_entry_config(data: &Bytes, entry: BoxView) -> Option<Bytes> {
    let target = match &entry.fourcc {
        b"avc1" | b"avc3" => *b"avcC",
        b"hvc1" | b"hev1" => *b"hvcC",
        b"av01" => *b"av1C",
        _ => return None,
    };
    let inner = entry.body_start + VISUAL_SAMPLE_ENTRY_HEADER;
    if inner >= entry.end {
        return None;
    }
    let b = find_first_box(data, inner, entry.end, target)?;
    Some(data.slice(b.body_start..b.end))
}

fn parse_tfhd(body: &[u8], moof_start: u64) -> Result<(u32, FragmentDefaults), DemuxError> {
    let short = || DemuxError::Malformed("tfhd box too short".into());
    let (_, flags) = full_box_header(body).ok_or_else(short)?;
    let mut r = Reader::new(body);
    r.skip(4).ok_or_else(short)?;
    let track_id = r.u32().ok_or_else(short)?;

    let mut d = FragmentDefaults {
        base_data_offset: moof_start,
        ..FragmentDefaults::default()
    };
    if flags & TFHD_BASE_DATA_OFFSET != 0 {
        d.base_data_offset = r.u64().ok_or_else(short)?;
    }
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
        r.skip(4).ok_or_else(short)?;
    }
    if flags & TFHD_DEFAULT_DURATION != 0 {
        d.duration = Some(r.u32().ok_or_else(short)?);
    }
    if flags & TFHD_DEFAULT_SIZE != 0 {
        d.size = Some(r.u32().ok_or_else(short)?);
    }
    if flags & TFHD_DEFAULT_FLAGS != 0 {
        d.flags = Some(r.u32().ok_or_else(short)?);
    }
    Ok((track_id, d))
}

fn parse_tfdt(body: &[u8]) -> Result<u64, DemuxError> {
    let short = || DemuxError::Malformed("tfdt box too short".into());
    let (version, _) = full_box_header(body).ok_or_else(short)?;
    let mut r = Reader::new(body);
    r.skip(4).ok_or_else(short)?;
    if version == 1 {
        r.u64().ok_or_else(short)
    } else {
        r.u32().map(u64::from).ok_or_else(short)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sample {
    offset: u64,
    size: u32,
    duration: u32,
    flags: u32,
    composition_offset: i32,
}

/// Expand a `trun` into samples with absolute offsets. `next_offset` carries
/// the end of the previous run for runs without a data offset.
fn parse_trun(
    body: &[u8],
    defaults: &FragmentDefaults,
    next_offset: &mut Option<u64>,
) -> Result<Vec<Sample>, DemuxError> {
    let short = || DemuxError::Malformed("trun box too short".into());
    let (version, flags) = full_box_header(body).ok_or_else(short)?;
    let mut r = Reader::new(body);
    r.skip(4).ok_or_else(short)?;
    let count = r.u32().ok_or_else(short)? as usize;

    let mut offset = if flags & TRUN_DATA_OFFSET != 0 {
        let rel = r.i32().ok_or_else(short)?;
        defaults
            .base_data_offset
            .checked_add_signed(i64::from(rel))
            .ok_or_else(|| DemuxError::Malformed("sample data offset out of range".into()))?
    } else {
        next_offset.unwrap_or(defaults.base_data_offset)
    };
    let first_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        Some(r.u32().ok_or_else(short)?)
    } else {
        None
    };

    // Each sample record is at most 16 bytes; refuse counts the box cannot hold.
    if count > body.len() {
        return Err(short());
    }
    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        let duration = if flags & TRUN_DURATION != 0 {
            r.u32().ok_or_else(short)?
        } else {
            defaults.duration.unwrap_or(0)
        };
        let size = if flags & TRUN_SIZE != 0 {
            r.u32().ok_or_else(short)?
        } else {
            defaults
                .size
                .ok_or_else(|| DemuxError::Malformed("sample size missing from trun and tfhd".into()))?
        };
        let sample_flags = if flags & TRUN_FLAGS != 0 {
            r.u32().ok_or_else(short)?
        } else if i == 0 && first_flags.is_some() {
            first_flags.unwrap_or(0)
        } else {
            defaults.flags.unwrap_or(0)
        };
        let composition_offset = if flags & TRUN_CTO != 0 {
            let raw = r.u32().ok_or_else(short)?;
            if version == 0 {
                i32::try_from(raw).unwrap_or(i32::MAX)
            } else {
                raw as i32
            }
        } else {
            0
        };
        samples.push(Sample {
            offset,
            size,
            duration,
            flags: sample_flags,
            composition_offset,
        });
        offset = offset
            .checked_add(u64::from(size))
            .ok_or_else(|| DemuxError::Malformed("sample offset overflows".into()))?;
    }
    *next_offset = Some(offset);
    Ok(samples)
}
