//! Load, playback and unload of simulated clips.

mod common;

use std::sync::Arc;
use std::time::Duration;

use braw_reader::engine::{ClipAudio, PipelineKind};
use braw_reader::frame_queue::FrameQueue;
use braw_reader::simulated::{SimulatedClip, SimulatedConfig, SimulatedEngine};
use braw_reader::video::SampleFormat;
use braw_reader::{
    FrameReader, MediaStatus, PlaybackState, ReaderError, ReaderEvent, ReaderOptions, SelectError,
};

use common::*;

fn continue_at_end() -> ReaderOptions {
    ReaderOptions {
        continue_at_end: true,
        ..ReaderOptions::default()
    }
}

// =========================================================================
// Playback to end
// =========================================================================

#[test]
fn plays_clip_to_end_and_unloads() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), ReaderOptions::default());
    let events = reader.events();

    reader.try_load("A001_C001.braw").unwrap();
    let seen = wait_for_status(&events, MediaStatus::Unloaded);

    assert_eq!(sink.indices(), (0..10).collect::<Vec<_>>());
    assert_eq!(sink.eos_count(), 1);
    assert!(sink.frames().last().is_some_and(|f| f.is_eos()));
    assert_eq!(engine.read_log(), (0..10).collect::<Vec<_>>());
    assert_eq!(reader.ledger().outstanding(), 0);
    assert_eq!(reader.status(), MediaStatus::Unloaded);
    assert_eq!(reader.playback_state(), PlaybackState::Stopped);

    let statuses: Vec<MediaStatus> = seen
        .iter()
        .filter_map(|e| match e {
            ReaderEvent::StatusChanged(s) => Some(*s),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            MediaStatus::Loading,
            MediaStatus::Loaded,
            MediaStatus::Unloading,
            MediaStatus::Unloaded
        ]
    );

    let counters = engine.counters();
    assert_eq!(counters.images_created, 10);
    assert_eq!(counters.images_released, 10);
    assert_eq!(reader.stats().frames_delivered, 10);
    // unloading after the end is not a second unload
    assert!(!reader.unload());
}

#[test]
fn timestamps_follow_average_frame_duration() {
    init_tracing();
    let clip = SimulatedClip::new(32, 18, 23.976, 24);
    let engine = SimulatedEngine::new(SimulatedConfig::cpu().with_clip(clip));
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), ReaderOptions::default());
    let events = reader.events();

    reader.try_load("A002_C003.braw").unwrap();
    let seen = wait_for_status(&events, MediaStatus::Unloaded);

    let info = seen
        .iter()
        .find_map(|e| match e {
            ReaderEvent::MediaInfoChanged(info) => Some(info.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(info.duration, 1001);
    assert_eq!(info.video[0].frames, 24);

    let frames: Vec<_> = sink.frames().into_iter().filter(|f| !f.is_eos()).collect();
    assert_eq!(frames.len(), 24);
    for (i, frame) in frames.iter().enumerate() {
        let expected = 1.001 * i as f64 / 24.0;
        assert!((frame.timestamp - expected).abs() < 1e-9, "frame {i}");
        assert!((frame.duration - 1.001 / 24.0).abs() < 1e-9);
    }
}

#[test]
fn continue_at_end_keeps_session_until_unload() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), continue_at_end());
    let events = reader.events();

    reader.try_load("clip.braw").unwrap();
    wait_for_status(&events, MediaStatus::AtEnd);
    assert!(engine.wait_idle(TIMEOUT));
    assert_eq!(reader.status(), MediaStatus::AtEnd);
    assert!(reader.media_info().is_some());
    assert_eq!(sink.eos_count(), 1);

    assert!(reader.unload());
    assert!(!reader.unload());
    assert_eq!(sink.eos_count(), 1);
    assert_eq!(reader.status(), MediaStatus::Unloaded);
    assert!(reader.media_info().is_none());
    assert_eq!(engine.counters().flushes, 1);
}

#[test]
fn double_unload_releases_readback_once() {
    init_tracing();
    let engine = SimulatedEngine::new(SimulatedConfig::gpu(PipelineKind::Cuda));
    let sink = RecordingSink::new();
    let options = ReaderOptions {
        copy: true,
        ..continue_at_end()
    };
    let reader = reader(&engine, sink.clone(), options);
    let events = reader.events();

    reader.try_load("clip.braw").unwrap();
    wait_for_status(&events, MediaStatus::AtEnd);
    assert!(engine.wait_idle(TIMEOUT));
    assert_eq!(engine.live_readback_resources(), 1);

    assert!(reader.unload());
    assert!(!reader.unload());
    assert_eq!(engine.live_readback_resources(), 0);

    let stats = reader.stats();
    assert_eq!(stats.host_copies, 10);
    assert_eq!(stats.readback_allocations, 1);
    assert_eq!(stats.native_buffers_live(), 0);
    let counters = engine.counters();
    assert_eq!(counters.images_released, counters.images_created);
}

#[test]
fn drop_unloads_loaded_reader() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), continue_at_end());
    let events = reader.events();

    reader.try_load("clip.braw").unwrap();
    wait_for_status(&events, MediaStatus::AtEnd);
    let ledger = reader.ledger();
    drop(reader);

    wait_for_status(&events, MediaStatus::Unloaded);
    assert_eq!(ledger.outstanding(), 0);
    assert_eq!(sink.eos_count(), 1);
}

// =========================================================================
// Pause, play and backpressure
// =========================================================================

#[test]
fn pause_stops_chain_and_play_resumes() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), ReaderOptions::default());
    let events = reader.events();

    engine.hold();
    reader.try_load("clip.braw").unwrap();
    assert!(reader.pause());
    engine.release();

    assert!(wait_until(TIMEOUT, || sink.indices() == vec![0]));
    assert!(engine.wait_idle(TIMEOUT));
    assert_eq!(engine.read_log(), vec![0]);
    assert_eq!(reader.playback_state(), PlaybackState::Paused);

    assert!(reader.play());
    wait_for_status(&events, MediaStatus::Unloaded);
    assert_eq!(sink.indices(), (0..10).collect::<Vec<_>>());
}

#[test]
fn rejected_frame_is_read_again_after_play() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let queue = Arc::new(FrameQueue::new(16));
    let reader = reader(&engine, queue.clone(), ReaderOptions::default());
    let events = reader.events();

    engine.hold();
    reader.try_load("clip.braw").unwrap();
    queue.set_paused(true);
    engine.release();

    assert!(wait_until(TIMEOUT, || reader.stats().frames_rejected == 1));
    assert!(engine.wait_idle(TIMEOUT));
    assert!(queue.is_empty());

    queue.set_paused(false);
    assert!(reader.play());
    wait_for_status(&events, MediaStatus::Unloaded);

    assert_eq!(engine.read_log(), vec![0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    let mut timestamps = Vec::new();
    while let Some(frame) = queue.pop() {
        timestamps.push(frame.timestamp);
    }
    assert_eq!(timestamps.len(), 10);
    assert_eq!(timestamps[0], 0.0);
    assert!(queue.is_eos());
}

#[test]
fn full_queue_applies_backpressure() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let queue = Arc::new(FrameQueue::new(2));
    let reader = reader(&engine, queue.clone(), ReaderOptions::default());
    let events = reader.events();

    reader.try_load("clip.braw").unwrap();
    assert!(wait_until(TIMEOUT, || queue.is_full()));
    // producer is parked on the full queue
    std::thread::sleep(Duration::from_millis(20));
    assert!(engine.read_log().len() <= 4);

    let mut delivered = 0;
    while let Some(frame) = queue.pop_blocking(TIMEOUT) {
        assert_eq!(frame.width, 16);
        delivered += 1;
    }
    assert_eq!(delivered, 10);
    wait_for_status(&events, MediaStatus::Unloaded);
}

#[test]
fn unload_releases_blocked_producer() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let queue = Arc::new(FrameQueue::new(1));
    let reader = reader(&engine, queue.clone(), ReaderOptions::default());

    reader.try_load("clip.braw").unwrap();
    assert!(wait_until(TIMEOUT, || queue.is_full()));
    std::thread::sleep(Duration::from_millis(20));

    assert!(reader.unload());
    assert!(engine.wait_idle(TIMEOUT));
    assert_eq!(reader.status(), MediaStatus::Unloaded);
    assert_eq!(reader.ledger().outstanding(), 0);
    assert!(queue.is_eos());
}

// =========================================================================
// Load failures and session description
// =========================================================================

#[test]
fn load_failures_leave_reader_unloaded() {
    init_tracing();
    let mut config = SimulatedConfig::cpu();
    config.fail_open = true;
    let engine = SimulatedEngine::new(config);
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), ReaderOptions::default());
    let events = reader.events();

    let err = reader.try_load("missing.braw").unwrap_err();
    assert!(matches!(
        err,
        ReaderError::OpenFailed { ref locator, .. } if locator == "missing.braw"
    ));
    assert_eq!(reader.status(), MediaStatus::Unloaded);
    let seen: Vec<_> = events.try_iter().collect();
    assert_eq!(
        seen,
        vec![
            ReaderEvent::StatusChanged(MediaStatus::Loading),
            ReaderEvent::StatusChanged(MediaStatus::Unloaded)
        ]
    );
    assert!(!reader.unload());
    assert!(sink.frames().is_empty());
    assert!(!FrameReader::load(&reader, "missing.braw"));
}

#[test]
fn device_filter_without_match_fails_selection() {
    init_tracing();
    let engine = SimulatedEngine::new(SimulatedConfig::gpu(PipelineKind::Cuda));
    let options = ReaderOptions::parse("gpu=cuda:device=quadro").unwrap();
    let reader = reader(&engine, RecordingSink::new(), options);

    let err = reader.try_load("clip.braw").unwrap_err();
    assert_eq!(
        err,
        ReaderError::Select(SelectError::NoDevice {
            pipeline: PipelineKind::Cuda,
            filter: Some("quadro".into()),
        })
    );
    assert_eq!(reader.status(), MediaStatus::Unloaded);
}

#[test]
fn empty_clip_is_rejected() {
    init_tracing();
    let clip = SimulatedClip::new(16, 8, 24.0, 0);
    let engine = SimulatedEngine::new(SimulatedConfig::cpu().with_clip(clip));
    let reader = reader(&engine, RecordingSink::new(), ReaderOptions::default());

    assert_eq!(reader.try_load("clip.braw"), Err(ReaderError::EmptyClip));
    assert!(engine.read_log().is_empty());
}

#[test]
fn second_load_is_refused() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let reader = reader(&engine, RecordingSink::new(), continue_at_end());
    let events = reader.events();

    reader.try_load("clip.braw").unwrap();
    assert_eq!(reader.try_load("other.braw"), Err(ReaderError::AlreadyLoaded));
    wait_for_status(&events, MediaStatus::AtEnd);
    assert!(reader.unload());

    // a new session after unload is fine
    reader.try_load("other.braw").unwrap();
    wait_for_status(&events, MediaStatus::AtEnd);
    assert_eq!(engine.counters().codecs_created, 2);
}

#[test]
fn decoder_selected_reports_pipeline_and_device() {
    init_tracing();
    let engine = SimulatedEngine::new(SimulatedConfig::gpu(PipelineKind::Cuda));
    let options = ReaderOptions::parse("device=GPU 1:continue_at_end=1").unwrap();
    let reader = reader(&engine, RecordingSink::new(), options);
    let events = reader.events();

    reader.try_load("clip.braw").unwrap();
    let seen = events_until(&events, |e| matches!(e, ReaderEvent::DecoderSelected { .. }));
    assert_eq!(
        seen.last(),
        Some(&ReaderEvent::DecoderSelected {
            name: "BRAW",
            pipeline: PipelineKind::Cuda,
            device: "Simulated GPU 1".into(),
        })
    );
    assert_eq!(
        reader.selected_device(),
        Some((PipelineKind::Cuda, "Simulated GPU 1".to_string()))
    );
}

#[test]
fn media_info_includes_audio_track() {
    init_tracing();
    let clip = SimulatedClip::new(64, 36, 25.0, 50).with_audio(ClipAudio {
        channels: 2,
        sample_rate: 48_000,
        sample_count: 96_000,
        bit_depth: 24,
    });
    let engine = SimulatedEngine::new(SimulatedConfig::cpu().with_clip(clip));
    let reader = reader(&engine, RecordingSink::new(), continue_at_end());

    reader.try_load("clip.braw").unwrap();
    let info = reader.media_info().unwrap();
    assert_eq!(info.streams, 2);
    assert_eq!(info.video[0].duration, 2000);
    assert_eq!(info.audio[0].channels, 2);
    assert_eq!(info.audio[0].format, SampleFormat::S24);
    assert_eq!(info.audio[0].duration, 2000);
    assert_eq!(info.duration, 2000);
}

#[test]
fn scale_option_reduces_output_size() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let sink = RecordingSink::new();
    let options = ReaderOptions::parse("scale=1/2").unwrap();
    let reader = reader(&engine, sink.clone(), options);
    let events = reader.events();

    reader.try_load("clip.braw").unwrap();
    wait_for_status(&events, MediaStatus::Unloaded);
    let frame = sink.frames().into_iter().next().unwrap();
    assert_eq!(frame.dimensions(), (8, 4));
}

#[test]
fn failed_read_stops_chain_until_seek() {
    init_tracing();
    let mut config = SimulatedConfig::cpu();
    config.fail_read_at = Some(4);
    let engine = SimulatedEngine::new(config);
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), continue_at_end());
    let events = reader.events();

    reader.try_load("clip.braw").unwrap();
    assert!(wait_until(TIMEOUT, || reader.stats().failed_jobs == 1));
    assert!(engine.wait_idle(TIMEOUT));
    assert_eq!(sink.indices(), vec![0, 1, 2, 3]);
    assert_eq!(reader.status(), MediaStatus::Loaded);

    assert!(reader.seek_to(600, braw_reader::SeekFlags::DEFAULT, 21));
    wait_for_status(&events, MediaStatus::AtEnd);
    assert!(engine.wait_idle(TIMEOUT));
    assert_eq!(sink.indices(), vec![0, 1, 2, 3, 6, 7, 8, 9]);
    assert_eq!(reader.ledger().outstanding(), 0);
}
