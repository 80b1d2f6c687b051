//! Reader statistics.
//!
//! Atomic counters updated from engine callback threads and from the
//! threads that drop native buffers. Exposed via [`ReaderStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by a reader and its buffer pools.
#[derive(Debug, Default)]
pub struct ReaderStats {
    frames_delivered: AtomicU64,
    frames_rejected: AtomicU64,
    stale_drops: AtomicU64,
    failed_jobs: AtomicU64,
    seeks_completed: AtomicU64,
    seeks_superseded: AtomicU64,
    direct_maps: AtomicU64,
    host_copies: AtomicU64,
    interop_maps: AtomicU64,
    readback_allocations: AtomicU64,
    native_buffers_created: AtomicU64,
    native_buffers_released: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl ReaderStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_frame_delivered, frames_delivered);
    counter!(record_frame_rejected, frames_rejected);
    counter!(record_stale_drop, stale_drops);
    counter!(record_failed_job, failed_jobs);
    counter!(record_seek_completed, seeks_completed);
    counter!(record_seek_superseded, seeks_superseded);
    counter!(record_direct_map, direct_maps);
    counter!(record_host_copy, host_copies);
    counter!(record_interop_map, interop_maps);
    counter!(record_readback_allocation, readback_allocations);
    counter!(record_native_buffer_created, native_buffers_created);
    counter!(record_native_buffer_released, native_buffers_released);

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            stale_drops: self.stale_drops.load(Ordering::Relaxed),
            failed_jobs: self.failed_jobs.load(Ordering::Relaxed),
            seeks_completed: self.seeks_completed.load(Ordering::Relaxed),
            seeks_superseded: self.seeks_superseded.load(Ordering::Relaxed),
            direct_maps: self.direct_maps.load(Ordering::Relaxed),
            host_copies: self.host_copies.load(Ordering::Relaxed),
            interop_maps: self.interop_maps.load(Ordering::Relaxed),
            readback_allocations: self.readback_allocations.load(Ordering::Relaxed),
            native_buffers_created: self.native_buffers_created.load(Ordering::Relaxed),
            native_buffers_released: self.native_buffers_released.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`ReaderStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames accepted by the sink (markers excluded)
    pub frames_delivered: u64,
    /// Frames the sink refused
    pub frames_rejected: u64,
    /// Completions dropped because a seek overtook them
    pub stale_drops: u64,
    /// Jobs abandoned after an engine failure
    pub failed_jobs: u64,
    pub seeks_completed: u64,
    pub seeks_superseded: u64,
    /// Host mappings served by the resource's own host pointer
    pub direct_maps: u64,
    /// Host mappings served through the readback resource
    pub host_copies: u64,
    /// Mappings served by an interop backend
    pub interop_maps: u64,
    pub readback_allocations: u64,
    pub native_buffers_created: u64,
    pub native_buffers_released: u64,
}

impl StatsSnapshot {
    /// Native buffers still referenced downstream.
    pub fn native_buffers_live(&self) -> u64 {
        self.native_buffers_created
            .saturating_sub(self.native_buffers_released)
    }

    /// Percentage of host mappings that avoided a readback copy (0.0 - 100.0).
    ///
    /// Returns `0.0` if nothing has been mapped yet.
    pub fn zero_copy_percentage(&self) -> f64 {
        let total = self.direct_maps + self.host_copies + self.interop_maps;
        if total == 0 {
            return 0.0;
        }
        ((self.direct_maps + self.interop_maps) as f64 / total as f64) * 100.0
    }
}
