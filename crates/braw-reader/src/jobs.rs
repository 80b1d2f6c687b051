//! Per-job context records and their accounting.
//!
//! Every job submitted to the engine carries a [`JobContext`]. The engine
//! hands it back in the matching completion, where the reader either moves
//! it into the next job of the chain (via [`JobContext::successor`]) or lets
//! it drop. Contexts are issued and retired through a shared [`JobLedger`]
//! so a finished session can prove that nothing leaked.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counts job contexts issued and retired.
#[derive(Debug, Default)]
pub struct JobLedger {
    issued: AtomicU64,
    retired: AtomicU64,
}

impl JobLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Issues a fresh context for a job reading `frame_index`.
    pub fn issue(self: &Arc<Self>, frame_index: u64, seek: SeekTag, epoch: u64) -> JobContext {
        self.issued.fetch_add(1, Ordering::AcqRel);
        JobContext {
            frame_index,
            seek_id: seek.seek_id,
            seek_wait_frame: seek.wait_frame,
            epoch,
            attributes: Vec::new(),
            ledger: Arc::clone(self),
        }
    }

    /// Number of contexts issued so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    /// Number of contexts retired (dropped) so far.
    pub fn retired(&self) -> u64 {
        self.retired.load(Ordering::Acquire)
    }

    /// Contexts currently owned by the engine or a callback.
    pub fn outstanding(&self) -> u64 {
        self.issued().saturating_sub(self.retired())
    }
}

/// Seek identity attached to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeekTag {
    /// Seek request id, `0` when the job is not part of a seek
    pub seek_id: u64,
    /// Report seek completion once the processed frame exists rather than at
    /// read time
    pub wait_frame: bool,
}

impl SeekTag {
    /// Tag for ordinary playback jobs.
    pub const NONE: SeekTag = SeekTag {
        seek_id: 0,
        wait_frame: false,
    };

    pub fn is_seek(&self) -> bool {
        self.seek_id > 0
    }
}

/// User data attached to one engine job.
///
/// Not `Clone`: each job owns exactly one context, and the context is
/// retired in the ledger when dropped.
pub struct JobContext {
    pub frame_index: u64,
    pub seek_id: u64,
    pub seek_wait_frame: bool,
    /// Seek epoch the job was issued under
    pub epoch: u64,
    /// Frame metadata carried from the read job to the process job
    pub attributes: Vec<(String, String)>,
    ledger: Arc<JobLedger>,
}

impl JobContext {
    pub fn seek_tag(&self) -> SeekTag {
        SeekTag {
            seek_id: self.seek_id,
            wait_frame: self.seek_wait_frame,
        }
    }

    /// Retires this context and issues a fresh one carrying the same frame,
    /// seek and epoch fields forward for the next job in the chain.
    pub fn successor(mut self) -> JobContext {
        let mut next = self.ledger.issue(self.frame_index, self.seek_tag(), self.epoch);
        next.attributes = std::mem::take(&mut self.attributes);
        next
    }
}

impl Drop for JobContext {
    fn drop(&mut self) {
        self.ledger.retired.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("frame_index", &self.frame_index)
            .field("seek_id", &self.seek_id)
            .field("seek_wait_frame", &self.seek_wait_frame)
            .field("epoch", &self.epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_balances_after_drop() {
        let ledger = JobLedger::new();
        let ctx = ledger.issue(3, SeekTag::NONE, 0);
        assert_eq!(ledger.outstanding(), 1);
        drop(ctx);
        assert_eq!(ledger.issued(), 1);
        assert_eq!(ledger.retired(), 1);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_successor_retires_previous_context() {
        let ledger = JobLedger::new();
        let tag = SeekTag {
            seek_id: 7,
            wait_frame: true,
        };
        let mut ctx = ledger.issue(5, tag, 2);
        ctx.attributes.push(("iso".into(), "800".into()));

        let next = ctx.successor();
        assert_eq!(ledger.issued(), 2);
        assert_eq!(ledger.retired(), 1);
        assert_eq!(next.frame_index, 5);
        assert_eq!(next.seek_tag(), tag);
        assert_eq!(next.epoch, 2);
        assert_eq!(next.attributes, vec![("iso".to_string(), "800".to_string())]);
    }
}
