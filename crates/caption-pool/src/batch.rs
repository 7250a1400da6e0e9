use crate::{payload::CaptionSpec, JobStatus};
use serde::Serialize;
use std::{collections::VecDeque, path::PathBuf};

/// Images waiting for their caption job, in input order. An image leaves the
/// queue when it is dispatched, so `len()` is the number not yet started.
#[derive(Debug, Default)]
pub(crate) struct BatchQueue {
    items: VecDeque<PathBuf>,
}

impl BatchQueue {
    pub fn new(images: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            items: images.into_iter().collect(),
        }
    }

    pub fn pop_front(&mut self) -> Option<PathBuf> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Empties the queue and returns how many items were dropped.
    pub fn drain(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}

/// What `start_batch` decided to do with its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BatchPlan {
    pub queued: usize,
    pub skipped: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    /// 1-based index of the last dispatched item.
    pub index: usize,
    pub total: usize,
    pub captioned: usize,
    pub remaining: usize,
}

/// Final state of a batch run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub status: JobStatus,
    /// Items dispatched, whatever their outcome.
    pub consumed: usize,
    pub captioned: usize,
    pub remaining: usize,
}

pub(crate) struct BatchRun {
    pub queue: BatchQueue,
    pub spec: CaptionSpec,
    pub total: usize,
    pub dispatched: usize,
    pub captioned: usize,
    /// Items drained from the queue by a cancel.
    pub dropped: usize,
    pub cancel_requested: bool,
    pub done: tokio::sync::oneshot::Sender<Result<BatchSummary, crate::JobError>>,
}

impl BatchRun {
    pub fn progress(&self) -> BatchProgress {
        BatchProgress {
            index: self.dispatched,
            total: self.total,
            captioned: self.captioned,
            remaining: self.queue.len(),
        }
    }

    pub fn summary(&self, status: JobStatus) -> BatchSummary {
        BatchSummary {
            status,
            consumed: self.dispatched,
            captioned: self.captioned,
            remaining: self.queue.len(),
        }
    }
}
