use super::*;
use crate::demux::{DemuxError, MediaUnit};
use std::sync::atomic::AtomicBool;

/// Init payload `bad` fails; media payload is a comma list of pts values,
/// where `eos` flags the previous packet and `panic` panics.
#[derive(Default)]
struct ScriptedDemuxer {
    parsed: HashSet<u32>,
    closed: Option<Arc<AtomicBool>>,
}

impl Demuxer for ScriptedDemuxer {
    fn parse_init(&mut self, init_segment_id: u32, data: &Bytes) -> Result<(), DemuxError> {
        if data.as_ref() == b"bad" {
            return Err(DemuxError::Malformed("bad init".into()));
        }
        self.parsed.insert(init_segment_id);
        Ok(())
    }

    fn parse_media(&mut self, unit: &MediaUnit<'_>) -> Result<Vec<MediaPacket>, DemuxError> {
        if let Some(missing) = unit.init_chain.iter().find(|id| !self.parsed.contains(id)) {
            return Err(DemuxError::MissingInit(*missing));
        }
        let text = std::str::from_utf8(unit.data).map_err(|e| DemuxError::Malformed(e.to_string()))?;
        let mut out: Vec<MediaPacket> = Vec::new();
        for token in text.split(',') {
            match token.trim() {
                "panic" => panic!("scripted demuxer panic"),
                "eos" => {
                    if let Some(last) = out.last_mut() {
                        last.eos = true;
                    }
                }
                pts => {
                    let pts: u64 = pts
                        .parse()
                        .map_err(|_| DemuxError::Malformed(format!("bad pts {:?}", pts)))?;
                    out.push(MediaPacket::new(unit.track_id, pts, Bytes::copy_from_slice(token.as_bytes())));
                }
            }
        }
        Ok(out)
    }

    fn codec_params(&self, init_segment_id: u32) -> Option<Bytes> {
        Some(Bytes::from(format!("cfg-{}", init_segment_id)))
    }

    fn close(&mut self) {
        if let Some(flag) = &self.closed {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

fn tiled_source() -> MediaSourceDescriptor {
    MediaSourceDescriptor {
        tracks: vec![
            TrackInfo::new(1, 101),
            TrackInfo::new(2, 102),
            TrackInfo::new(3, 103).depending_on(&[101, 102]),
        ],
        expected_segments: None,
    }
}

fn params(timeout_ms: u64) -> ReaderParams {
    ReaderParams {
        segment_timeout: Duration::from_millis(timeout_ms),
        ..ReaderParams::default()
    }
}

fn reader(source: &MediaSourceDescriptor, params: ReaderParams) -> SegmentReaderManager {
    SegmentReaderManager::initialize(params, source, Box::new(ScriptedDemuxer::default())).unwrap()
}

fn init(id: u32) -> InitSegment {
    InitSegment {
        init_segment_id: id,
        data: Bytes::from_static(b"init"),
    }
}

fn media(track_id: u32, segment_number: u64, script: &str) -> MediaSegment {
    MediaSegment {
        track_id,
        segment_number,
        data: Bytes::copy_from_slice(script.as_bytes()),
    }
}

fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn init_readiness_waits_for_whole_chain() {
    let r = reader(&tiled_source(), params(10_000));
    r.open_init_segment(init(103)).unwrap();
    r.open_init_segment(init(101)).unwrap();
    assert!(wait_until(|| r.stats().ready_tracks == 1));
    assert!(!r.is_init_segments_parsed(), "extractor chain still misses 102");

    r.open_init_segment(init(102)).unwrap();
    assert!(r.wait_init_segments_parsed(Duration::from_secs(5)));
    assert_eq!(r.stats().ready_tracks, 3);
}

#[test]
fn media_waits_for_its_own_init() {
    let r = reader(&tiled_source(), params(10_000));
    r.open_segment(media(2, 1, "0,10"), false).unwrap();
    r.open_init_segment(init(101)).unwrap();
    r.open_segment(media(1, 1, "0"), false).unwrap();

    assert!(wait_until(|| r.get_packet_queue_size(1).unwrap() == 1));
    assert_eq!(r.get_packet_queue_size(2).unwrap(), 0);
    assert_eq!(r.get_next_packet(2), Err(PipelineError::NotReady));

    r.open_init_segment(init(102)).unwrap();
    assert!(wait_until(|| r.get_packet_queue_size(2).unwrap() == 2));
    let first = r.get_next_packet(2).unwrap();
    let second = r.get_next_packet(2).unwrap();
    assert_eq!((first.pts, second.pts), (0, 10));
    assert_eq!(first.segment_number, 1);
    assert_eq!(r.get_next_packet(2), Err(PipelineError::NotReady));
}

#[test]
fn extractor_segment_needs_all_dependencies() {
    let r = reader(&tiled_source(), params(10_000));
    r.open_init_segment(init(103)).unwrap();
    r.open_init_segment(init(101)).unwrap();
    r.open_segment(media(3, 1, "5"), true).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(r.get_packet_queue_size(3).unwrap(), 0);

    r.open_init_segment(init(102)).unwrap();
    assert!(wait_until(|| r.get_packet_queue_size(3).unwrap() == 1));
    assert_eq!(r.stats().failed, 0);
}

#[test]
fn stalled_segment_is_evicted_without_blocking_others() {
    let r = reader(&tiled_source(), params(100));
    let started = Instant::now();
    r.open_segment(media(1, 1, "0"), false).unwrap();
    r.open_init_segment(init(102)).unwrap();
    r.open_segment(media(2, 1, "0"), false).unwrap();

    assert!(wait_until(|| r.get_packet_queue_size(2).unwrap() == 1));
    assert!(wait_until(|| r.stats().evicted == 1));
    assert!(started.elapsed() >= Duration::from_millis(100));
    let stats = r.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.opening, 0);
    assert_eq!(r.get_next_packet(1), Err(PipelineError::NotReady));
}

#[test]
fn packets_are_fifo_and_regressions_dropped() {
    let r = reader(&tiled_source(), params(10_000));
    r.open_segment(media(1, 2, "20,30"), false).unwrap();
    r.open_segment(media(1, 1, "0,10"), false).unwrap();
    r.open_segment(media(1, 3, "25,40"), false).unwrap();
    r.open_init_segment(init(101)).unwrap();
    assert!(wait_until(|| r.get_packet_queue_size(1).unwrap() == 5));

    let mut last = 0;
    let mut seen = Vec::new();
    while let Ok(p) = r.get_next_packet(1) {
        assert!(p.pts >= last);
        last = p.pts;
        seen.push(p.pts);
    }
    assert_eq!(seen, vec![0, 10, 20, 30, 40]);
    assert_eq!(r.stats().dropped_packets, 1);
}

#[test]
fn static_stream_reports_end_of_stream() {
    let source = MediaSourceDescriptor {
        tracks: vec![TrackInfo::new(1, 101)],
        expected_segments: Some(2),
    };
    let p = ReaderParams {
        stream_type: StreamType::Static,
        ..params(10_000)
    };
    let r = reader(&source, p);
    r.open_init_segment(init(101)).unwrap();
    r.open_segment(media(1, 1, "0"), false).unwrap();
    r.open_segment(media(1, 2, "10"), false).unwrap();
    assert!(wait_until(|| r.get_packet_queue_size(1).unwrap() == 2));
    // init, segment 1 and segment 2 all reached the parsed list
    assert!(wait_until(|| r.stats().parsed_sets == 3));

    assert!(!r.get_next_packet(1).unwrap().eos);
    assert!(r.get_next_packet(1).unwrap().eos);
    assert_eq!(r.get_next_packet(1), Err(PipelineError::EndOfStream));
}

#[test]
fn skipped_segment_counts_toward_end_of_stream() {
    let source = MediaSourceDescriptor {
        tracks: vec![TrackInfo::new(1, 101)],
        expected_segments: Some(2),
    };
    let p = ReaderParams {
        stream_type: StreamType::Static,
        ..params(10_000)
    };
    let r = reader(&source, p);
    r.open_init_segment(init(101)).unwrap();
    r.open_segment(media(1, 1, "0,10"), false).unwrap();
    assert!(wait_until(|| r.stats().parsed_sets == 2));
    r.skip_segment(1, 2).unwrap();

    assert_eq!(r.get_next_packet(1).unwrap().pts, 0);
    assert!(r.get_next_packet(1).unwrap().eos);
    assert_eq!(r.get_next_packet(1), Err(PipelineError::EndOfStream));
    assert!(matches!(r.skip_segment(9, 1), Err(PipelineError::InvalidArgument(_))));
}

#[test]
fn per_track_segment_count_ends_shorter_track() {
    let source = MediaSourceDescriptor {
        tracks: vec![
            TrackInfo::new(1, 101).expecting(2),
            TrackInfo::new(3, 103).depending_on(&[101]).expecting(1),
        ],
        expected_segments: Some(5),
    };
    let p = ReaderParams {
        stream_type: StreamType::Static,
        ..params(10_000)
    };
    let r = reader(&source, p);
    r.open_init_segment(init(101)).unwrap();
    r.open_init_segment(init(103)).unwrap();
    r.open_segment(media(1, 1, "0"), false).unwrap();
    r.open_segment(media(3, 1, "0"), true).unwrap();

    let mut extractor_packets = 0;
    assert!(wait_until(|| match r.get_next_packet(3) {
        Ok(_) => {
            extractor_packets += 1;
            false
        }
        Err(e) => e == PipelineError::EndOfStream,
    }));
    assert_eq!(extractor_packets, 1);

    assert!(wait_until(|| r.stats().opening == 0 && r.stats().opened == 0));
    assert!(!r.get_next_packet(1).unwrap().eos, "track 1 still expects a second segment");
    assert_eq!(r.get_next_packet(1), Err(PipelineError::NotReady));
}

#[test]
fn demuxer_end_marker_ends_dynamic_track() {
    let r = reader(&tiled_source(), params(10_000));
    r.open_init_segment(init(101)).unwrap();
    r.open_segment(media(1, 1, "0,eos"), false).unwrap();
    assert!(wait_until(|| r.get_packet_queue_size(1).unwrap() == 1));
    assert!(r.get_next_packet(1).unwrap().eos);
    assert_eq!(r.get_next_packet(1), Err(PipelineError::EndOfStream));
}

#[test]
fn full_queue_holds_segments_back_without_evicting() {
    let p = ReaderParams {
        max_packet_queue_len: 2,
        ..params(50)
    };
    let r = reader(&tiled_source(), p);
    r.open_init_segment(init(101)).unwrap();
    r.open_segment(media(1, 1, "0,1,2"), false).unwrap();
    r.open_segment(media(1, 2, "3"), false).unwrap();
    assert!(wait_until(|| r.get_packet_queue_size(1).unwrap() == 3));
    thread::sleep(Duration::from_millis(150));
    assert_eq!(r.get_packet_queue_size(1).unwrap(), 3, "second segment held back");
    assert_eq!(r.stats().evicted, 0);

    for expected in 0..3 {
        assert_eq!(r.get_next_packet(1).unwrap().pts, expected);
    }
    assert!(wait_until(|| r.get_packet_queue_size(1).unwrap() == 1));
    assert_eq!(r.get_next_packet(1).unwrap().pts, 3);
}

#[test]
fn held_back_segment_does_not_shorten_idle_wait() {
    let p = ReaderParams {
        max_packet_queue_len: 1,
        ..params(50)
    };
    let r = reader(&tiled_source(), p);
    r.open_init_segment(init(101)).unwrap();
    r.open_segment(media(1, 1, "0"), false).unwrap();
    r.open_segment(media(1, 2, "1"), false).unwrap();
    assert!(wait_until(|| r.get_packet_queue_size(1).unwrap() == 1));
    thread::sleep(Duration::from_millis(120));
    assert_eq!(r.stats().opening, 1, "second segment still waiting for room");

    let started = Instant::now();
    for _ in 0..5 {
        r.inner.wait_for_segments();
    }
    assert!(
        started.elapsed() >= Duration::from_millis(50),
        "waits returned after {:?}",
        started.elapsed()
    );
    assert_eq!(r.stats().evicted, 0);
}

#[test]
fn params_attached_on_request() {
    let r = reader(&tiled_source(), params(10_000));
    r.open_init_segment(init(101)).unwrap();
    r.open_segment(media(1, 1, "0,1"), false).unwrap();
    assert!(wait_until(|| r.get_packet_queue_size(1).unwrap() == 2));
    assert!(r.get_next_packet(1).unwrap().params.is_none());
    let p = r.get_next_packet_with_params(1).unwrap();
    assert_eq!(p.params.as_deref(), Some(&b"cfg-101"[..]));
}

#[test]
fn staleness_trim_primitives() {
    let r = reader(&tiled_source(), params(10_000));
    assert_eq!(r.get_oldest_packet_pts(1).unwrap(), None);
    r.open_init_segment(init(101)).unwrap();
    r.open_segment(media(1, 1, "0,10,20"), false).unwrap();
    assert!(wait_until(|| r.get_packet_queue_size(1).unwrap() == 3));
    assert_eq!(r.get_oldest_packet_pts(1).unwrap(), Some(0));
    assert_eq!(r.remove_outdated_packets(1, 15).unwrap(), 2);
    assert_eq!(r.get_oldest_packet_pts(1).unwrap(), Some(20));
    assert!(r.remove_outdated_packets(9, 0).is_err());
}

#[test]
fn failing_and_panicking_demux_keep_worker_alive() {
    let r = reader(&tiled_source(), params(10_000));
    r.open_init_segment(InitSegment {
        init_segment_id: 102,
        data: Bytes::from_static(b"bad"),
    })
    .unwrap();
    r.open_init_segment(init(101)).unwrap();
    r.open_segment(media(1, 1, "panic"), false).unwrap();
    r.open_segment(media(1, 2, "7"), false).unwrap();
    assert!(wait_until(|| r.get_packet_queue_size(1).unwrap() == 1));
    assert_eq!(r.get_next_packet(1).unwrap().pts, 7);
    assert_eq!(r.stats().failed, 2);
    assert!(!r.is_init_segments_parsed());
}

#[test]
fn rejects_invalid_input() {
    let r = reader(&tiled_source(), params(10_000));
    assert!(matches!(r.get_next_packet(42), Err(PipelineError::InvalidArgument(_))));
    assert!(r.get_packet_queue_size(42).is_err());
    assert!(r.open_init_segment(init(999)).is_err());
    assert!(r.open_segment(media(1, 1, ""), false).is_err());
    assert!(r.open_segment(media(42, 1, "0"), false).is_err());
    assert!(r.open_local_init_segment(101, "/nonexistent/segpipe/init.mp4").is_err());
}

#[test]
fn local_segments_are_ingested() {
    let dir = tempfile::tempdir().unwrap();
    let init_path = dir.path().join("init.mp4");
    let seg_path = dir.path().join("seg1.m4s");
    fs::write(&init_path, b"init").unwrap();
    fs::write(&seg_path, b"3,4").unwrap();

    let r = reader(&tiled_source(), params(10_000));
    r.open_local_init_segment(101, &init_path).unwrap();
    r.open_local_segment(1, 1, &seg_path, false).unwrap();
    assert!(wait_until(|| r.get_packet_queue_size(1).unwrap() == 2));
}

#[test]
fn close_is_idempotent_and_closes_demuxer() {
    let closed = Arc::new(AtomicBool::new(false));
    let demuxer = ScriptedDemuxer {
        closed: Some(Arc::clone(&closed)),
        ..ScriptedDemuxer::default()
    };
    let r = SegmentReaderManager::initialize(params(10_000), &tiled_source(), Box::new(demuxer)).unwrap();
    r.open_segment(media(1, 1, "0"), false).unwrap();
    r.close();
    r.close();
    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(r.stats().opening, 0);
    assert!(r.open_init_segment(init(101)).is_err());
    assert!(!r.wait_init_segments_parsed(Duration::from_millis(10)));
}
