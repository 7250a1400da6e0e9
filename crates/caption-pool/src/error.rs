use file_downloader::DownloadError;
use std::path::PathBuf;

pub const AUTH_HINT: &str =
    "This model may require a HuggingFace token. Add your token in Settings and try again.";

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("busy: {0}")]
    Busy(&'static str),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("{AUTH_HINT} ({0})")]
    Auth(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("no model loaded")]
    ModelNotLoaded,
    #[error("nothing to caption")]
    NothingToCaption,
    #[error("caption persistence failed: {0}")]
    Persistence(#[from] std::io::Error),
    #[error("job runner stopped")]
    RunnerStopped,
}

impl From<DownloadError> for JobError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::AlreadyExists(path) => JobError::AlreadyExists(path),
            e if e.is_auth() => JobError::Auth(e.to_string()),
            e => JobError::Download(e.to_string()),
        }
    }
}
