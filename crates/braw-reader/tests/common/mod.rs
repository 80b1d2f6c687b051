//! Shared helpers for the reader integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use braw_reader::reader::BrawReader;
use braw_reader::simulated::SimulatedEngine;
use braw_reader::video::DecodedFrame;
use braw_reader::{FrameSink, MediaStatus, ReaderEvent, ReaderOptions, SeekOutcome, VideoFrame};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Sink that keeps every frame it is handed.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<VideoFrame>>,
    reject: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuses frames while set. Markers are still recorded.
    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::Release);
    }

    pub fn frames(&self) -> Vec<VideoFrame> {
        self.frames.lock().clone()
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    /// Frame indices of delivered pictures, in delivery order.
    pub fn indices(&self) -> Vec<u64> {
        self.frames
            .lock()
            .iter()
            .filter(|f| !matches!(f.frame, DecodedFrame::Empty))
            .map(frame_index)
            .collect()
    }

    pub fn eos_count(&self) -> usize {
        self.frames.lock().iter().filter(|f| f.is_eos()).count()
    }

    pub fn reset_count(&self) -> usize {
        self.frames.lock().iter().filter(|f| f.is_reset()).count()
    }
}

impl FrameSink for RecordingSink {
    fn push(&self, frame: VideoFrame) -> bool {
        let marker = matches!(frame.frame, DecodedFrame::Empty);
        if !marker && self.reject.load(Ordering::Acquire) {
            return false;
        }
        self.frames.lock().push(frame);
        true
    }
}

/// Index carried in the frame's attributes.
pub fn frame_index(frame: &VideoFrame) -> u64 {
    frame
        .attributes
        .iter()
        .find(|(key, _)| key == "frame_index")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(u64::MAX)
}

pub fn reader(
    engine: &SimulatedEngine,
    sink: Arc<dyn FrameSink>,
    options: ReaderOptions,
) -> BrawReader {
    BrawReader::new(Arc::new(engine.clone()), sink, options)
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

/// Receives events until `stop` matches one, returning everything seen.
pub fn events_until(
    events: &Receiver<ReaderEvent>,
    mut stop: impl FnMut(&ReaderEvent) -> bool,
) -> Vec<ReaderEvent> {
    let mut seen = Vec::new();
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) => {
                let done = stop(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            Err(_) => panic!("timed out waiting for reader event; saw {seen:?}"),
        }
    }
}

pub fn wait_for_status(events: &Receiver<ReaderEvent>, status: MediaStatus) -> Vec<ReaderEvent> {
    events_until(events, |e| *e == ReaderEvent::StatusChanged(status))
}

/// Seek completions among `events`, in order.
pub fn seek_outcomes(events: &[ReaderEvent]) -> Vec<(u64, SeekOutcome)> {
    events
        .iter()
        .filter_map(|e| match e {
            ReaderEvent::SeekCompleted { seek_id, outcome } => Some((*seek_id, *outcome)),
            _ => None,
        })
        .collect()
}
