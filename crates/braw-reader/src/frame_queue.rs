//! Frame queue sink.
//!
//! A bounded queue that sits between the reader (producing on engine callback
//! threads) and a consumer such as a render or encode loop. Implements
//! [`FrameSink`], so the reader pushes into it directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::video::{FrameSink, VideoFrame};

/// Default number of frames to buffer ahead.
const DEFAULT_BUFFER_SIZE: usize = 5;

/// A thread-safe queue of decoded frames.
///
/// - A full queue blocks the producer until the consumer pops a frame.
/// - A reset marker drops everything queued before it.
/// - The end-of-stream marker sets a flag instead of taking a slot, so it
///   never blocks.
/// - A paused or stopped queue rejects frames, which stops the reader's
///   read chain until playback resumes.
pub struct FrameQueue {
    /// Frames ready for the consumer
    frames: Mutex<VecDeque<VideoFrame>>,
    /// Maximum number of frames to buffer
    capacity: usize,
    /// Signaled when frames are available
    frame_available: Condvar,
    /// Signaled when space is available
    space_available: Condvar,
    /// Rejects frames without tearing down
    paused: AtomicBool,
    /// End of stream reached
    eos: AtomicBool,
    /// Releases blocked producers for shutdown
    stopped: AtomicBool,
}

impl FrameQueue {
    /// Creates a new frame queue with the specified capacity.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            frame_available: Condvar::new(),
            space_available: Condvar::new(),
            paused: AtomicBool::new(false),
            eos: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Creates a new frame queue with the default capacity.
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }

    fn rejecting(&self) -> bool {
        self.paused.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire)
    }

    /// Queues a frame, blocking while the queue is full.
    ///
    /// Returns false if the queue is paused or stopped and the frame was
    /// discarded.
    pub fn push_frame(&self, frame: VideoFrame) -> bool {
        if frame.is_eos() {
            self.set_eos();
            return true;
        }
        if frame.is_reset() {
            self.flush();
            return true;
        }

        let mut frames = self.frames.lock();
        while frames.len() >= self.capacity {
            if self.rejecting() {
                return false;
            }
            self.space_available.wait(&mut frames);
        }
        if self.rejecting() {
            return false;
        }

        tracing::trace!("queued frame at {:.3}s", frame.timestamp);
        frames.push_back(frame);
        self.frame_available.notify_one();
        true
    }

    /// Takes the next frame without waiting.
    pub fn pop(&self) -> Option<VideoFrame> {
        let mut frames = self.frames.lock();
        let frame = frames.pop_front();
        if frame.is_some() {
            self.space_available.notify_one();
        }
        frame
    }

    /// Takes the next frame, waiting up to `timeout` for one.
    ///
    /// Returns None on timeout, or at end of stream once the queue is empty.
    pub fn pop_blocking(&self, timeout: Duration) -> Option<VideoFrame> {
        let mut frames = self.frames.lock();
        if frames.is_empty() {
            if self.is_eos() || self.stopped.load(Ordering::Acquire) {
                return None;
            }
            let result = self.frame_available.wait_for(&mut frames, timeout);
            if result.timed_out() && frames.is_empty() {
                return None;
            }
        }

        let frame = frames.pop_front();
        if frame.is_some() {
            self.space_available.notify_one();
        }
        frame
    }

    /// Returns the presentation timestamp of the next frame without removing it.
    pub fn peek_pts(&self) -> Option<Duration> {
        self.frames.lock().front().and_then(|f| f.pts())
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Drops every queued frame and clears end of stream.
    pub fn flush(&self) {
        let dropped = {
            let mut frames = self.frames.lock();
            let count = frames.len();
            frames.clear();
            count
        };
        self.space_available.notify_all();
        self.eos.store(false, Ordering::Release);
        tracing::debug!("FrameQueue::flush: dropped {} frames", dropped);
    }

    /// Marks that end of stream has been reached.
    pub fn set_eos(&self) {
        self.eos.store(true, Ordering::Release);
        self.frame_available.notify_all();
    }

    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::Acquire)
    }

    /// Rejects (or again accepts) frames. Wakes a blocked producer.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        if paused {
            self.space_available.notify_all();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Stops the queue, waking blocked producers and consumers.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.space_available.notify_all();
        self.frame_available.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Clears frames and every flag so the queue can serve a new session.
    pub fn reset(&self) {
        self.frames.lock().clear();
        self.paused.store(false, Ordering::Release);
        self.eos.store(false, Ordering::Release);
        self.stopped.store(false, Ordering::Release);
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

impl FrameSink for FrameQueue {
    fn push(&self, frame: VideoFrame) -> bool {
        self.push_frame(frame)
    }

    fn unblock(&self) {
        self.stop();
    }

    fn reset(&self) {
        FrameQueue::reset(self);
    }
}
