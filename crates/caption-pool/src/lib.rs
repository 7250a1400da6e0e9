mod batch;
mod cache;
mod cleanup;
mod error;
mod notification;
mod payload;
mod runner;
mod sidecar;

#[cfg(test)]
mod testing;

pub use batch::{BatchPlan, BatchProgress, BatchSummary};
pub use cache::CaptionCache;
pub use cleanup::{apply_affixes, clean_caption, finalize_caption};
pub use error::{JobError, AUTH_HINT};
pub use notification::{
    BatchEvent, CaptionEvent, DownloadEvent, JobEvent, JobKind, JobStatus, ModelEvent,
};
pub use payload::{
    BatchHandle, CaptionHandle, CaptionOutcome, CaptionSpec, DatasetStats, ExportSummary,
    ImportSummary, JobHandle, ModelState, RunnerSnapshot,
};
pub use runner::CaptionRunner;
pub use sidecar::{has_sidecar, read_sidecar, write_sidecar};
