//! fMP4 builders for demuxer and reader tests.

use bytes::Bytes;

/// Bytes of a visual sample entry body before its child boxes.
const VISUAL_SAMPLE_ENTRY_HEADER: usize = 70;

pub(crate) fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = (8 + body.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

pub(crate) fn make_full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.push(version);
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(payload);
    make_box(fourcc, &body)
}

pub(crate) fn make_visual_sample_entry(fourcc: &[u8; 4], children: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; VISUAL_SAMPLE_ENTRY_HEADER];
    body.extend_from_slice(children);
    make_box(fourcc, &body)
}

/// `moov` with one video track. `config` is the decoder configuration box
/// (`avcC`, `hvcC`, `av1C`) placed inside the sample entry.
pub(crate) fn make_init_segment(
    track_id: u32,
    timescale: u32,
    sample_entry: &[u8; 4],
    config: Option<(&[u8; 4], &[u8])>,
) -> Bytes {
    let mut tkhd_payload = Vec::new();
    tkhd_payload.extend_from_slice(&0u32.to_be_bytes()); // creation_time
    tkhd_payload.extend_from_slice(&0u32.to_be_bytes()); // modification_time
    tkhd_payload.extend_from_slice(&track_id.to_be_bytes());
    tkhd_payload.extend_from_slice(&0u32.to_be_bytes()); // reserved
    let tkhd = make_full_box(b"tkhd", 0, 0x7, &tkhd_payload);

    let mut mdhd_payload = Vec::new();
    mdhd_payload.extend_from_slice(&0u32.to_be_bytes());
    mdhd_payload.extend_from_slice(&0u32.to_be_bytes());
    mdhd_payload.extend_from_slice(&timescale.to_be_bytes());
    mdhd_payload.extend_from_slice(&0u32.to_be_bytes()); // duration
    let mdhd = make_full_box(b"mdhd", 0, 0, &mdhd_payload);

    let children = config.map(|(fourcc, body)| make_box(fourcc, body)).unwrap_or_default();
    let entry = make_visual_sample_entry(sample_entry, &children);
    let mut stsd_payload = 1u32.to_be_bytes().to_vec();
    stsd_payload.extend_from_slice(&entry);
    let stsd = make_full_box(b"stsd", 0, 0, &stsd_payload);

    let stbl = make_box(b"stbl", &stsd);
    let minf = make_box(b"minf", &stbl);
    let mut mdia_body = mdhd;
    mdia_body.extend_from_slice(&minf);
    let mdia = make_box(b"mdia", &mdia_body);

    let mut trak_body = tkhd;
    trak_body.extend_from_slice(&mdia);
    let trak = make_box(b"trak", &trak_body);

    let mut out = make_box(b"ftyp", b"iso6\0\0\0\0");
    out.extend_from_slice(&make_box(b"moov", &trak));
    Bytes::from(out)
}

/// One sample of a test fragment: `(duration, payload, is_sync)`.
pub(crate) type TestSample<'a> = (u32, &'a [u8], bool);

/// `moof` + `mdat` for `track_id` starting at `base_decode_time`, with
/// per-sample durations, sizes and flags in `trun`.
pub(crate) fn make_media_segment(track_id: u32, base_decode_time: u64, samples: &[TestSample<'_>]) -> Bytes {
    // default-base-is-moof
    let tfhd = make_full_box(b"tfhd", 0, 0x020000, &track_id.to_be_bytes());
    let tfdt = make_full_box(b"tfdt", 1, 0, &base_decode_time.to_be_bytes());

    // data_offset, sample_duration, sample_size, sample_flags
    let trun_flags = 0x000001 | 0x000100 | 0x000200 | 0x000400;
    let mut trun_payload = Vec::new();
    trun_payload.extend_from_slice(&(samples.len() as u32).to_be_bytes());
    trun_payload.extend_from_slice(&0i32.to_be_bytes()); // data_offset placeholder
    for (duration, payload, sync) in samples {
        trun_payload.extend_from_slice(&duration.to_be_bytes());
        trun_payload.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        let flags: u32 = if *sync { 0x0200_0000 } else { 0x0101_0000 };
        trun_payload.extend_from_slice(&flags.to_be_bytes());
    }
    let mut trun = make_full_box(b"trun", 0, trun_flags, &trun_payload);

    let moof_len = 8 + 8 + tfhd.len() + tfdt.len() + trun.len();
    let data_offset = (moof_len + 8) as i32;
    let pos = 8 + 4 + 4;
    trun[pos..pos + 4].copy_from_slice(&data_offset.to_be_bytes());

    let mut traf_body = tfhd;
    traf_body.extend_from_slice(&tfdt);
    traf_body.extend_from_slice(&trun);
    let traf = make_box(b"traf", &traf_body);
    let moof = make_box(b"moof", &traf);

    let mdat_body: Vec<u8> = samples.iter().flat_map(|(_, p, _)| p.iter().copied()).collect();
    let mut out = moof;
    out.extend_from_slice(&make_box(b"mdat", &mdat_body));
    Bytes::from(out)
}
