use crate::{batch::BatchSummary, BatchPlan, BatchProgress, JobError, JobStatus};
use file_downloader::DownloadRequest;
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use vlm_inference::{SamplingParams, VisionEngine};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, JobError>>;

/// Everything a caption job needs besides the image.
#[derive(Clone, Debug, Default)]
pub struct CaptionSpec {
    pub prompt: String,
    pub params: SamplingParams,
    pub prefix: String,
    pub suffix: String,
    /// Write the sidecar as soon as the caption is done.
    pub auto_save: bool,
}

/// Resolves once the admitted job reaches a final state.
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<Result<T, JobError>>,
}

impl<T> JobHandle<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, JobError>>) -> Self {
        Self { rx }
    }

    pub async fn wait(self) -> Result<T, JobError> {
        self.rx.await.map_err(|_| JobError::RunnerStopped)?
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptionOutcome {
    pub image: PathBuf,
    /// `Done` or `Cancelled`; failures resolve the handle with an error.
    pub status: JobStatus,
    pub text: String,
    pub elapsed: Duration,
}

/// A running single-image caption job: its tokens as they arrive, then its outcome.
#[derive(Debug)]
pub struct CaptionHandle {
    pub image: PathBuf,
    tokens: mpsc::UnboundedReceiver<String>,
    outcome: JobHandle<CaptionOutcome>,
}

impl CaptionHandle {
    pub(crate) fn new(
        image: PathBuf,
        tokens: mpsc::UnboundedReceiver<String>,
        outcome: JobHandle<CaptionOutcome>,
    ) -> Self {
        Self {
            image,
            tokens,
            outcome,
        }
    }

    /// Next generated piece, `None` once generation stopped.
    pub async fn next_token(&mut self) -> Option<String> {
        self.tokens.recv().await
    }

    pub async fn finish(self) -> Result<CaptionOutcome, JobError> {
        self.outcome.wait().await
    }
}

#[derive(Debug)]
pub struct BatchHandle {
    pub plan: BatchPlan,
    outcome: JobHandle<BatchSummary>,
}

impl BatchHandle {
    pub(crate) fn new(plan: BatchPlan, outcome: JobHandle<BatchSummary>) -> Self {
        Self { plan, outcome }
    }

    pub async fn wait(self) -> Result<BatchSummary, JobError> {
        self.outcome.wait().await
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub added: usize,
    pub with_captions: usize,
    pub ignored: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub written: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct DatasetStats {
    pub total: usize,
    pub captioned: usize,
    pub uncaptioned: usize,
    pub percent: u32,
}

impl DatasetStats {
    pub fn new(total: usize, captioned: usize) -> Self {
        let percent = if total > 0 {
            (captioned * 100 / total) as u32
        } else {
            0
        };
        Self {
            total,
            captioned,
            uncaptioned: total.saturating_sub(captioned),
            percent,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ModelState {
    #[default]
    Unloaded,
    Loading {
        model_path: PathBuf,
    },
    Loaded {
        model_path: PathBuf,
        vision_path: PathBuf,
    },
}

impl ModelState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelState::Loaded { .. })
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RunnerSnapshot {
    pub model: ModelState,
    pub captioning: Option<PathBuf>,
    pub batch: Option<BatchProgress>,
    pub downloading: Option<String>,
    pub last_inference: Option<Duration>,
    pub images: usize,
    pub cached_captions: usize,
}

pub(crate) struct CaptionRequest {
    pub image: PathBuf,
    pub spec: CaptionSpec,
    pub tokens: mpsc::UnboundedSender<String>,
    pub done: Reply<CaptionOutcome>,
}

/// Result of one generation, as reported by the caption worker.
pub(crate) enum Generated {
    Done { raw: String },
    Cancelled { partial: String },
    Failed { message: String },
}

pub(crate) enum RunnerPayload {
    LoadModel {
        model_path: PathBuf,
        vision_path: PathBuf,
        done: Reply<()>,
        reply: Reply<()>,
    },
    UnloadModel {
        reply: Reply<()>,
    },
    Caption {
        request: CaptionRequest,
        reply: Reply<()>,
    },
    StartBatch {
        images: Vec<PathBuf>,
        spec: CaptionSpec,
        skip_existing: bool,
        done: Reply<BatchSummary>,
        reply: Reply<BatchPlan>,
    },
    CancelCurrent,
    SkipCurrent,
    Download {
        request: DownloadRequest,
        done: Reply<PathBuf>,
        reply: Reply<()>,
    },
    DownloadVisionEncoder {
        target_dir: PathBuf,
        token: Option<String>,
        done: Reply<PathBuf>,
        reply: Reply<()>,
    },
    ImportImages {
        paths: Vec<PathBuf>,
        reply: Reply<ImportSummary>,
    },
    ImportFolder {
        dir: PathBuf,
        reply: Reply<ImportSummary>,
    },
    CaptionFor {
        image: PathBuf,
        reply: Reply<Option<String>>,
    },
    SetCaption {
        image: PathBuf,
        text: String,
        reply: Reply<()>,
    },
    SaveCaption {
        image: PathBuf,
        text: String,
        reply: Reply<PathBuf>,
    },
    ExportAll {
        reply: Reply<ExportSummary>,
    },
    ClearWorkspace {
        reply: Reply<()>,
    },
    DatasetStats {
        reply: Reply<DatasetStats>,
    },
    Snapshot {
        reply: Reply<RunnerSnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
    LoadFinished {
        engine: Box<dyn VisionEngine>,
        model_path: PathBuf,
        vision_path: PathBuf,
        result: anyhow::Result<Duration>,
    },
    CaptionFinished {
        engine: Box<dyn VisionEngine>,
        image: PathBuf,
        generated: Generated,
        elapsed: Duration,
    },
    DownloadFinished {
        result: Result<PathBuf, JobError>,
        done: Reply<PathBuf>,
    },
}

pub(crate) fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
