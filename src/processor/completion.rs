//! All-or-nothing acknowledgement of one record's outputs

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::Instant;

use crate::record::Record;

/// What a single output result means for its input record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionOutcome {
    /// More results outstanding
    Pending,
    /// The last output succeeded and none failed; fires once
    AllSucceeded,
    /// The first failure; fires once
    FirstFailure,
    /// A result arriving after a failure
    AfterFailure,
}

/// Shared by the result callbacks of one input record
#[derive(Debug)]
pub(crate) struct OutputCompletion {
    pub(crate) record: Record,
    pub(crate) started: Instant,
    total: usize,
    succeeded: AtomicUsize,
    failed: AtomicBool,
}

impl OutputCompletion {
    pub(crate) fn new(record: Record, total: usize, started: Instant) -> Self {
        Self {
            record,
            started,
            total,
            succeeded: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }

    /// Account for one result; safe under concurrent callbacks
    pub(crate) fn on_result(&self, success: bool) -> CompletionOutcome {
        if !success {
            return if self.failed.swap(true, Ordering::AcqRel) {
                CompletionOutcome::AfterFailure
            } else {
                CompletionOutcome::FirstFailure
            };
        }
        // a failure means some output never succeeds, so the count can only reach
        // `total` when every result was a success
        let succeeded = self.succeeded.fetch_add(1, Ordering::AcqRel) + 1;
        if succeeded == self.total {
            CompletionOutcome::AllSucceeded
        } else if self.failed.load(Ordering::Acquire) {
            CompletionOutcome::AfterFailure
        } else {
            CompletionOutcome::Pending
        }
    }
}
