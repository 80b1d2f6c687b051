//! Seek coordination.
//!
//! The engine cannot cancel a job once submitted, so seeks are coordinated
//! cooperatively: each seek bumps an outstanding-seek counter and a seek
//! epoch, and each seek completion decrements the counter. A completion
//! that leaves the counter above zero has been overtaken by a newer seek
//! and is dropped instead of delivered, as is a seek completion issued under
//! an older epoch than the newest seek. Ordinary playback jobs are stale
//! while any seek is outstanding or when they were issued under an older
//! epoch.

use std::sync::atomic::{AtomicU64, Ordering};

/// How the seek target is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekMode {
    /// Absolute position in milliseconds
    #[default]
    Default,
    /// Delta relative to the current frame
    FromNow,
    /// Frame step relative to the current frame
    Frame,
}

/// Flags accepted by `seek_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekFlags {
    pub mode: SeekMode,
    /// Report completion once the target frame is processed (default) rather
    /// than when it has been read
    pub wait_for_decoded_frame: bool,
}

impl SeekFlags {
    pub const DEFAULT: SeekFlags = SeekFlags {
        mode: SeekMode::Default,
        wait_for_decoded_frame: true,
    };

    pub fn from_now() -> Self {
        Self {
            mode: SeekMode::FromNow,
            ..Self::DEFAULT
        }
    }

    pub fn frame_step() -> Self {
        Self {
            mode: SeekMode::Frame,
            ..Self::DEFAULT
        }
    }

    /// Report completion at read time instead of after processing.
    pub fn notify_on_read(mut self) -> Self {
        self.wait_for_decoded_frame = false;
        self
    }

    pub fn is_relative(&self) -> bool {
        matches!(self.mode, SeekMode::FromNow | SeekMode::Frame)
    }
}

impl Default for SeekFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Result reported for a seek request.
///
/// Seeks overtaken by a newer one report nothing; only the newest seek of a
/// burst publishes an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    /// The seek landed; position of the frame it resolved to
    Completed { position_ms: i64 },
    /// The seek job could not be carried out
    Failed,
}

/// Where a seek should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    /// Read this frame
    Index(u64),
    /// Nothing to do: report the current position
    Current,
}

/// Computes the frame a seek lands on.
///
/// Absolute targets map milliseconds to a frame through the clip's average
/// frame duration. Relative targets add `target` frames to `current`. The
/// result is clamped to `[0, frame_count - 1]`.
pub fn resolve_target(
    target: i64,
    flags: SeekFlags,
    current: u64,
    frame_count: u64,
    duration_ms: i64,
) -> SeekTarget {
    let last = frame_count.saturating_sub(1);
    if flags.is_relative() {
        if flags.mode == SeekMode::FromNow && target == 0 {
            return SeekTarget::Current;
        }
        let index = (current as i128 + target as i128).clamp(0, last as i128);
        return SeekTarget::Index(index as u64);
    }
    if target <= 0 || frame_count == 0 || duration_ms <= 0 {
        return SeekTarget::Index(0);
    }
    let frame_ms = duration_ms as f64 / frame_count as f64;
    // tolerate rounding when target is an exact frame timestamp
    let index = (target as f64 / frame_ms + 1e-6).floor() as u64;
    SeekTarget::Index(index.min(last))
}

/// Outstanding seek registered by [`SeekCoordinator::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekRequest {
    pub target_index: u64,
    pub seek_id: u64,
    pub wait_for_decoded_frame: bool,
    pub epoch: u64,
}

/// Verdict for a seek completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResolution {
    /// Last outstanding seek: deliver and report completion
    Current,
    /// A newer seek is outstanding: drop
    Superseded,
}

/// Tracks outstanding seeks across engine callback threads.
#[derive(Debug, Default)]
pub struct SeekCoordinator {
    seeking: AtomicU64,
    epoch: AtomicU64,
}

impl SeekCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a seek. Every playback job issued before this call becomes
    /// stale.
    pub fn begin(
        &self,
        target_index: u64,
        seek_id: u64,
        wait_for_decoded_frame: bool,
    ) -> SeekRequest {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.seeking.fetch_add(1, Ordering::AcqRel);
        SeekRequest {
            target_index,
            seek_id,
            wait_for_decoded_frame,
            epoch,
        }
    }

    /// Retires one outstanding seek issued under `epoch` and decides whether
    /// its completion is still current.
    ///
    /// The decision is made against the counter value observed by this
    /// decrement: if other seeks remain outstanding afterwards, this one has
    /// been superseded. A seek from an older epoch is superseded even when
    /// it is the last one counted, since the newer seek may have been
    /// cancelled.
    pub fn resolve(&self, epoch: u64) -> SeekResolution {
        match self
            .seeking
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) if previous > 1 => SeekResolution::Superseded,
            Ok(_) if epoch != self.epoch() => SeekResolution::Superseded,
            Ok(_) => SeekResolution::Current,
            Err(_) => {
                tracing::debug!("seek completion with no outstanding seek");
                SeekResolution::Superseded
            }
        }
    }

    /// Withdraws a seek whose job never reached the engine. The epoch stays
    /// bumped, so jobs issued before the seek remain stale.
    pub fn cancel(&self) {
        let _ = self
            .seeking
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Number of outstanding seeks.
    pub fn pending(&self) -> u64 {
        self.seeking.load(Ordering::Acquire)
    }

    pub fn is_seeking(&self) -> bool {
        self.pending() > 0
    }

    /// Current seek epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Returns true if a playback (non-seek) job issued under `epoch` must
    /// not be delivered.
    pub fn is_stale_playback(&self, epoch: u64) -> bool {
        self.is_seeking() || epoch != self.epoch()
    }

    /// Forgets outstanding seeks. Called when a session is torn down.
    pub fn reset(&self) {
        self.seeking.store(0, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}
