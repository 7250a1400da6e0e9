use crate::payload::file_label as file_name;
use serde::Serialize;
use std::{path::PathBuf, time::Duration};
use strum_macros::{AsRefStr, Display, EnumString};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum JobKind {
    Load,
    Caption,
    Download,
}

/// `Idle -> Running -> {Done, Cancelled, Failed} -> Idle`, per job kind.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Display, AsRefStr, EnumString, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Done,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug)]
pub enum ModelEvent {
    Loading {
        model_path: PathBuf,
    },
    Loaded {
        model_path: PathBuf,
        vision_path: PathBuf,
        elapsed: Duration,
    },
    Unloaded,
    Failed {
        message: String,
    },
}

#[derive(Clone, Debug)]
pub enum CaptionEvent {
    Started {
        image: PathBuf,
    },
    Token {
        image: PathBuf,
        text: String,
    },
    Finished {
        image: PathBuf,
        caption: String,
        elapsed: Duration,
    },
    Cancelled {
        image: PathBuf,
        partial: String,
    },
    Failed {
        image: PathBuf,
        message: String,
    },
    Saved {
        image: PathBuf,
        path: PathBuf,
    },
    SaveFailed {
        image: PathBuf,
        message: String,
    },
}

#[derive(Clone, Debug)]
pub enum BatchEvent {
    Started {
        queued: usize,
        skipped: usize,
    },
    Skipped {
        skipped: usize,
    },
    AllSkipped {
        skipped: usize,
    },
    Progress {
        index: usize,
        total: usize,
        image: PathBuf,
    },
    Completed {
        completed: usize,
    },
    Halted {
        completed: usize,
        remaining: usize,
        message: String,
    },
    Cancelled {
        completed: usize,
        dropped: usize,
    },
}

#[derive(Clone, Debug)]
pub enum DownloadEvent {
    Started {
        repo_id: String,
        filename: String,
    },
    Progress {
        filename: String,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
    },
    Finished {
        path: PathBuf,
    },
    Failed {
        filename: String,
        message: String,
        auth: bool,
    },
}

/// Everything the runner reports back to its front end.
#[derive(Clone, Debug)]
pub enum JobEvent {
    Model(ModelEvent),
    Caption(CaptionEvent),
    Batch(BatchEvent),
    Download(DownloadEvent),
}

impl JobEvent {
    pub fn kind(&self) -> JobKind {
        match self {
            JobEvent::Model(_) => JobKind::Load,
            JobEvent::Caption(_) | JobEvent::Batch(_) => JobKind::Caption,
            JobEvent::Download(_) => JobKind::Download,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            JobEvent::Model(ModelEvent::Failed { .. })
                | JobEvent::Caption(CaptionEvent::Failed { .. })
                | JobEvent::Caption(CaptionEvent::SaveFailed { .. })
                | JobEvent::Batch(BatchEvent::Halted { .. })
                | JobEvent::Download(DownloadEvent::Failed { .. })
        )
    }

    /// Human readable line for the event, `None` for high-frequency events.
    pub fn message(&self) -> Option<String> {
        let message = match self {
            JobEvent::Model(event) => match event {
                ModelEvent::Loading { model_path } => {
                    format!("Loading {}...", file_name(model_path))
                }
                ModelEvent::Loaded {
                    model_path,
                    elapsed,
                    ..
                } => format!(
                    "Model loaded: {} ({:.1}s)",
                    file_name(model_path),
                    elapsed.as_secs_f64()
                ),
                ModelEvent::Unloaded => "Model unloaded".to_string(),
                ModelEvent::Failed { message } => format!("Failed to load model: {}", message),
            },
            JobEvent::Caption(event) => match event {
                CaptionEvent::Started { image } => format!("Captioning {}", file_name(image)),
                CaptionEvent::Token { .. } => return None,
                CaptionEvent::Finished { image, elapsed, .. } => format!(
                    "Caption generated for {} in {:.1}s",
                    file_name(image),
                    elapsed.as_secs_f64()
                ),
                CaptionEvent::Cancelled { image, .. } => {
                    format!("Caption cancelled for {}", file_name(image))
                }
                CaptionEvent::Failed { image, message } => {
                    format!("Caption failed for {}: {}", file_name(image), message)
                }
                CaptionEvent::Saved { path, .. } => format!("Saved {}", file_name(path)),
                CaptionEvent::SaveFailed { image, message } => {
                    format!("Failed to save caption for {}: {}", file_name(image), message)
                }
            },
            JobEvent::Batch(event) => match event {
                BatchEvent::Started { queued, .. } => {
                    format!("Batch started: {} images queued", queued)
                }
                BatchEvent::Skipped { skipped } => {
                    format!("Skipping {} images that already have captions", skipped)
                }
                BatchEvent::AllSkipped { skipped } => {
                    format!("All {} images already have .txt captions.", skipped)
                }
                BatchEvent::Progress {
                    index,
                    total,
                    image,
                } => format!("Batch {}/{}: {}", index, total, file_name(image)),
                BatchEvent::Completed { completed } => {
                    format!("Batch complete: {} images captioned", completed)
                }
                BatchEvent::Halted {
                    completed,
                    remaining,
                    message,
                } => format!(
                    "Batch stopped after {} images, {} remaining: {}",
                    completed, remaining, message
                ),
                BatchEvent::Cancelled { completed, dropped } => format!(
                    "Batch cancelled: {} images captioned, {} not started",
                    completed, dropped
                ),
            },
            JobEvent::Download(event) => match event {
                DownloadEvent::Started { filename, .. } => format!("Downloading {}...", filename),
                DownloadEvent::Progress { .. } => return None,
                DownloadEvent::Finished { path } => format!("Downloaded {}", file_name(path)),
                DownloadEvent::Failed {
                    filename, message, ..
                } => format!("Download failed for {}: {}", filename, message),
            },
        };

        Some(message)
    }
}
