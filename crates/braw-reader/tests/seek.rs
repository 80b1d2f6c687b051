//! Seek coordination against the simulated engine.

mod common;

use std::sync::Arc;

use braw_reader::reader::BrawReader;
use braw_reader::simulated::{SimulatedConfig, SimulatedEngine};
use braw_reader::video::DecodedFrame;
use braw_reader::{
    FrameSink, MediaStatus, ReaderEvent, ReaderOptions, SeekFlags, SeekOutcome, VideoFrame,
};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use common::*;

fn continue_at_end() -> ReaderOptions {
    ReaderOptions {
        continue_at_end: true,
        ..ReaderOptions::default()
    }
}

// =========================================================================
// Coalescing
// =========================================================================

#[test]
fn coalesced_seeks_deliver_only_the_last() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), continue_at_end());
    let events = reader.events();

    engine.hold();
    reader.try_load("clip.braw").unwrap();
    assert!(reader.seek_to(100, SeekFlags::DEFAULT, 1));
    assert!(reader.seek_to(200, SeekFlags::DEFAULT, 2));
    assert!(reader.seek_to(300, SeekFlags::DEFAULT, 3));
    engine.release();

    let seen = wait_for_status(&events, MediaStatus::AtEnd);
    assert!(engine.wait_idle(TIMEOUT));

    // overtaken seeks are dropped without an event
    assert_eq!(
        seek_outcomes(&seen),
        vec![(3, SeekOutcome::Completed { position_ms: 300 })]
    );
    assert_eq!(sink.indices(), vec![3, 4, 5, 6, 7, 8, 9]);
    assert_eq!(sink.reset_count(), 1);

    let frames = sink.frames();
    assert!(frames[0].is_reset());
    assert!((frames[0].timestamp - 0.3).abs() < 1e-9);
    assert_eq!(engine.read_log(), vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

    let stats = reader.stats();
    assert_eq!(stats.seeks_superseded, 2);
    assert_eq!(stats.seeks_completed, 1);
    assert_eq!(reader.ledger().outstanding(), 0);
}

#[test]
fn seek_during_playback_drops_stale_frames() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), continue_at_end());
    let events = reader.events();

    engine.hold();
    reader.try_load("clip.braw").unwrap();
    assert!(reader.seek_to(800, SeekFlags::DEFAULT, 5));
    engine.release();

    wait_for_status(&events, MediaStatus::AtEnd);
    assert!(engine.wait_idle(TIMEOUT));
    assert_eq!(sink.indices(), vec![8, 9]);
    assert!(reader.stats().stale_drops >= 1);
    assert_eq!(sink.eos_count(), 1);
}

// =========================================================================
// Completion ordering
// =========================================================================

/// Records, while frame 5 is being pushed, which seek completions have
/// already been published.
#[derive(Default)]
struct OrderingSink {
    events: Mutex<Option<Receiver<ReaderEvent>>>,
    seen_during_push: Mutex<Option<Vec<(u64, SeekOutcome)>>>,
    frames: RecordingSink,
}

impl FrameSink for OrderingSink {
    fn push(&self, frame: VideoFrame) -> bool {
        if !matches!(frame.frame, DecodedFrame::Empty) && frame_index(&frame) == 5 {
            let published: Vec<ReaderEvent> = self
                .events
                .lock()
                .as_ref()
                .map(|events| events.try_iter().collect())
                .unwrap_or_default();
            *self.seen_during_push.lock() = Some(seek_outcomes(&published));
        }
        self.frames.push(frame)
    }
}

fn ordering_setup(flags: SeekFlags) -> (SimulatedEngine, Arc<OrderingSink>, BrawReader) {
    let engine = SimulatedEngine::default();
    let sink = Arc::new(OrderingSink::default());
    let reader = reader(&engine, sink.clone(), continue_at_end());
    *sink.events.lock() = Some(reader.events());

    engine.hold();
    reader.try_load("clip.braw").unwrap();
    assert!(reader.pause());
    assert!(reader.seek_to(500, flags, 7));
    engine.release();

    assert!(wait_until(TIMEOUT, || sink.frames.indices() == vec![5]));
    assert!(engine.wait_idle(TIMEOUT));
    (engine, sink, reader)
}

#[test]
fn seek_completion_follows_decoded_frame() {
    init_tracing();
    let (engine, sink, reader) = ordering_setup(SeekFlags::DEFAULT);

    let seen = sink.seen_during_push.lock().clone().unwrap();
    assert!(seen.is_empty(), "completed before delivery: {seen:?}");
    assert_eq!(engine.read_log(), vec![0, 5]);
    assert!(wait_until(TIMEOUT, || reader.stats().seeks_completed == 1));
    assert_eq!(sink.frames.reset_count(), 1);
}

#[test]
fn notify_on_read_completes_before_delivery() {
    init_tracing();
    let (_engine, sink, _reader) = ordering_setup(SeekFlags::DEFAULT.notify_on_read());

    let seen = sink.seen_during_push.lock().clone().unwrap();
    assert_eq!(seen, vec![(7, SeekOutcome::Completed { position_ms: 500 })]);
}

#[test]
fn seek_without_wait_is_superseded_by_a_later_seek() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), continue_at_end());
    let events = reader.events();

    engine.hold();
    reader.try_load("clip.braw").unwrap();
    assert!(reader.pause());
    assert!(reader.seek_to(200, SeekFlags::DEFAULT.notify_on_read(), 1));
    assert!(reader.seek_to(400, SeekFlags::DEFAULT, 2));
    engine.release();

    let seen = events_until(&events, |e| {
        matches!(e, ReaderEvent::SeekCompleted { seek_id: 2, .. })
    });
    assert!(engine.wait_idle(TIMEOUT));
    assert_eq!(
        seek_outcomes(&seen),
        vec![(2, SeekOutcome::Completed { position_ms: 400 })]
    );
    assert_eq!(sink.indices(), vec![4]);
    assert_eq!(engine.read_log(), vec![0, 2, 4]);
    assert_eq!(reader.stats().seeks_superseded, 1);
}

// =========================================================================
// Targets
// =========================================================================

#[test]
fn relative_seeks_step_from_current_frame() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), continue_at_end());
    let events = reader.events();

    engine.hold();
    reader.try_load("clip.braw").unwrap();
    assert!(reader.pause());
    assert!(reader.seek_to(500, SeekFlags::DEFAULT, 7));
    engine.release();
    assert!(wait_until(TIMEOUT, || sink.indices() == vec![5]));
    assert!(engine.wait_idle(TIMEOUT));

    assert!(reader.seek_to(2, SeekFlags::frame_step(), 8));
    assert!(wait_until(TIMEOUT, || sink.indices() == vec![5, 7]));
    assert!(engine.wait_idle(TIMEOUT));

    // zero delta from now completes in place without reading
    let reads = engine.read_log().len();
    assert!(reader.seek_to(0, SeekFlags::from_now(), 9));
    let seen = events_until(&events, |e| {
        matches!(e, ReaderEvent::SeekCompleted { seek_id: 9, .. })
    });
    assert_eq!(
        seek_outcomes(&seen).last(),
        Some(&(9, SeekOutcome::Completed { position_ms: 700 }))
    );
    assert_eq!(engine.read_log().len(), reads);

    // steps past either end clamp
    assert!(reader.seek_to(-100, SeekFlags::frame_step(), 10));
    assert!(wait_until(TIMEOUT, || sink.indices() == vec![5, 7, 0]));
    assert!(engine.wait_idle(TIMEOUT));
}

#[test]
fn seek_after_end_plays_again() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), continue_at_end());
    let events = reader.events();

    reader.try_load("clip.braw").unwrap();
    wait_for_status(&events, MediaStatus::AtEnd);
    assert!(engine.wait_idle(TIMEOUT));

    assert!(reader.seek_to(0, SeekFlags::DEFAULT, 11));
    assert_eq!(reader.status(), MediaStatus::Loaded);
    wait_for_status(&events, MediaStatus::AtEnd);
    assert!(engine.wait_idle(TIMEOUT));

    let mut expected: Vec<u64> = (0..10).collect();
    expected.extend(0..10);
    assert_eq!(sink.indices(), expected);
    assert_eq!(sink.eos_count(), 2);
    assert_eq!(sink.reset_count(), 1);
}

#[test]
fn seek_without_session_is_refused() {
    init_tracing();
    let engine = SimulatedEngine::default();
    let reader = reader(&engine, RecordingSink::new(), ReaderOptions::default());
    assert!(!reader.seek_to(100, SeekFlags::DEFAULT, 1));
    assert!(reader.events().try_recv().is_err());
}

#[test]
fn failed_seek_job_reports_failure() {
    init_tracing();
    let mut config = SimulatedConfig::cpu();
    config.fail_process_at = Some(6);
    let engine = SimulatedEngine::new(config);
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), continue_at_end());
    let events = reader.events();

    engine.hold();
    reader.try_load("clip.braw").unwrap();
    assert!(reader.pause());
    assert!(reader.seek_to(600, SeekFlags::DEFAULT, 4));
    engine.release();

    let seen = events_until(&events, |e| {
        matches!(e, ReaderEvent::SeekCompleted { seek_id: 4, .. })
    });
    assert_eq!(seek_outcomes(&seen), vec![(4, SeekOutcome::Failed)]);
    assert!(engine.wait_idle(TIMEOUT));
    assert!(sink.indices().is_empty());

    // playback resumes past the failed frame
    assert!(reader.play());
    wait_for_status(&events, MediaStatus::AtEnd);
    assert_eq!(sink.indices(), vec![7, 8, 9]);
}

#[test]
fn failed_seek_submission_keeps_chain_resumable() {
    init_tracing();
    let mut config = SimulatedConfig::cpu();
    config.fail_create_read_at = Some(5);
    let engine = SimulatedEngine::new(config);
    let sink = RecordingSink::new();
    let reader = reader(&engine, sink.clone(), continue_at_end());
    let events = reader.events();

    engine.hold();
    reader.try_load("clip.braw").unwrap();
    assert!(reader.seek_to(100, SeekFlags::DEFAULT, 1));
    // the read job for frame 5 cannot be created
    assert!(!reader.seek_to(500, SeekFlags::DEFAULT, 2));
    engine.release();

    assert!(wait_until(TIMEOUT, || reader.stats().seeks_superseded == 1));
    assert!(engine.wait_idle(TIMEOUT));
    assert_eq!(engine.read_log(), vec![0, 1]);
    // the older seek must not land in place of the failed one
    assert!(sink.indices().is_empty());
    assert_eq!(sink.reset_count(), 0);
    let seen: Vec<ReaderEvent> = events.try_iter().collect();
    assert_eq!(seek_outcomes(&seen), vec![(2, SeekOutcome::Failed)]);
    assert_eq!(reader.stats().seeks_completed, 0);

    assert!(reader.play());
    wait_for_status(&events, MediaStatus::AtEnd);
    assert!(engine.wait_idle(TIMEOUT));
    assert_eq!(sink.indices(), (0..10).collect::<Vec<u64>>());
    assert_eq!(sink.eos_count(), 1);
    assert_eq!(reader.ledger().outstanding(), 0);
}
