//! CLI parse tests and segment list handling.

use super::commands::{file_name_for, SegmentList};
use super::{Cli, CliCommand};
use clap::Parser;
use segpipe_core::pipeline::SegmentKind;
use segpipe_core::reader::StreamType;
use std::path::Path;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).unwrap()
}

#[test]
fn cli_parse_fetch() {
    let cli = parse(&["segpipe", "fetch", "https://cdn.example/a.m4s", "https://cdn.example/b.m4s"]);
    match cli.command {
        CliCommand::Fetch {
            urls,
            output_dir,
            max_parallel,
        } => {
            assert_eq!(urls.len(), 2);
            assert_eq!(output_dir, Path::new("."));
            assert!(max_parallel.is_none());
        }
        _ => panic!("expected Fetch"),
    }
    assert!(cli.config.is_none());
}

#[test]
fn cli_parse_fetch_options() {
    let cli = parse(&[
        "segpipe",
        "fetch",
        "-o",
        "/tmp/out",
        "--max-parallel",
        "8",
        "https://cdn.example/a.m4s",
    ]);
    match cli.command {
        CliCommand::Fetch {
            output_dir,
            max_parallel,
            ..
        } => {
            assert_eq!(output_dir, Path::new("/tmp/out"));
            assert_eq!(max_parallel, Some(8));
        }
        _ => panic!("expected Fetch with options"),
    }
}

#[test]
fn cli_fetch_requires_url() {
    assert!(Cli::try_parse_from(["segpipe", "fetch"]).is_err());
}

#[test]
fn cli_parse_demux() {
    match parse(&["segpipe", "demux", "init.mp4", "1.m4s", "2.m4s", "--track-id", "3"]).command {
        CliCommand::Demux {
            init,
            segments,
            track_id,
        } => {
            assert_eq!(init, Path::new("init.mp4"));
            assert_eq!(segments.len(), 2);
            assert_eq!(track_id, 3);
        }
        _ => panic!("expected Demux"),
    }
}

#[test]
fn cli_parse_run_with_global_config() {
    let cli = parse(&["segpipe", "run", "list.toml", "--config", "/etc/segpipe.toml"]);
    assert_eq!(cli.config.as_deref(), Some(Path::new("/etc/segpipe.toml")));
    match cli.command {
        CliCommand::Run { segments } => assert_eq!(segments, Path::new("list.toml")),
        _ => panic!("expected Run"),
    }
}

#[test]
fn cli_parse_config() {
    match parse(&["segpipe", "config", "--path"]).command {
        CliCommand::Config { path } => assert!(path),
        _ => panic!("expected Config"),
    }
}

#[test]
fn file_names_come_from_url_path() {
    assert_eq!(file_name_for("https://cdn.example/tile1/7.m4s?sig=x", 0), "7.m4s");
    assert_eq!(file_name_for("https://cdn.example/", 3), "segment-3");
    assert_eq!(file_name_for("not a url", 4), "segment-4");
}

const LIST: &str = r#"
    [[tracks]]
    track_id = 1
    init_segment_id = 101
    init_url = "http://h/1/init.mp4"
    segments = ["http://h/1/1.m4s", "http://h/1/2.m4s"]

    [[tracks]]
    track_id = 3
    init_segment_id = 103
    depends_on = [101]
    init_url = "http://h/3/init.mp4"
    segments = ["http://h/3/1.m4s"]
"#;

#[test]
fn segment_list_builds_source_and_requests() {
    let list = SegmentList::parse(LIST).unwrap();
    assert!(list.stream_type.is_none());

    let source = list.source();
    assert_eq!(source.tracks.len(), 2);
    assert!(source.tracks[1].is_extractor);
    assert_eq!(source.tracks[1].depends_on, vec![101]);
    assert_eq!(source.expected_segments, None);
    assert_eq!(source.tracks[0].expected_segments, Some(2));

    let reqs = list.requests();
    assert_eq!(reqs.len(), 5);
    assert!(matches!(reqs[0].kind, SegmentKind::Init { init_segment_id: 101 }));
    assert!(matches!(reqs[1].kind, SegmentKind::Init { init_segment_id: 103 }));
    assert!(matches!(
        reqs[3].kind,
        SegmentKind::Media {
            track_id: 3,
            segment_number: 1,
            is_extractor: true
        }
    ));
    assert_eq!(reqs[4].url, "http://h/1/2.m4s");
}

#[test]
fn segment_list_stream_type_and_empty_tracks() {
    let list = SegmentList::parse(&format!("stream_type = \"dynamic\"\n{}", LIST)).unwrap();
    assert_eq!(list.stream_type, Some(StreamType::Dynamic));
    assert!(SegmentList::parse("tracks = []").is_err());
}

#[test]
fn uneven_tracks_each_expect_their_own_segment_count() {
    let list = SegmentList::parse(&format!("stream_type = \"static\"\n{}", LIST)).unwrap();
    let source = list.source();
    let counts: Vec<_> = source
        .tracks
        .iter()
        .map(|t| (t.track_id, t.expected_segments))
        .collect();
    assert_eq!(counts, vec![(1, Some(2)), (3, Some(1))]);
}
