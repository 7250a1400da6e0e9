use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("unauthorized ({status}) for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("http error ({status}) for {url}")]
    Http { status: u16, url: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
}

impl DownloadError {
    pub fn is_auth(&self) -> bool {
        matches!(self, DownloadError::Unauthorized { .. })
    }
}

pub(crate) fn check_status(status: reqwest::StatusCode, url: &str) -> Result<(), DownloadError> {
    if status.is_success() {
        return Ok(());
    }

    let status_code = status.as_u16();
    match status_code {
        401 | 403 => Err(DownloadError::Unauthorized {
            status: status_code,
            url: url.to_string(),
        }),
        _ => Err(DownloadError::Http {
            status: status_code,
            url: url.to_string(),
        }),
    }
}
