use crate::{error::check_status, DownloadError};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::mpsc,
};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub repo_id: String,
    pub filename: String,
    pub target_dir: PathBuf,
    pub token: Option<String>,
}

impl DownloadRequest {
    pub fn new(repo_id: &str, filename: &str, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            filename: filename.to_string(),
            target_dir: target_dir.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn target_path(&self) -> PathBuf {
        self.target_dir.join(&self.filename)
    }

    /// Partial download location, `<target>.temp` next to the target.
    pub fn temp_path(&self) -> PathBuf {
        self.target_dir.join(format!("{}.temp", self.filename))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
}

/// Fetches a single file from a model hub into a local directory.
#[async_trait]
pub trait ModelFetcher: Send + Sync + 'static {
    async fn fetch(
        &self,
        request: &DownloadRequest,
        progress: mpsc::Sender<DownloadProgress>,
    ) -> Result<PathBuf, DownloadError>;
}

pub struct HubDownloadConfig {
    pub endpoint: String,
}

impl Default for HubDownloadConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://huggingface.co".to_string(),
        }
    }
}

pub struct HubDownload {
    endpoint: String,
    client: reqwest::Client,
}

impl HubDownload {
    pub fn new(config: HubDownloadConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn file_url(&self, repo_id: &str, filename: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.endpoint, repo_id, filename)
    }

    async fn download_to_path(
        &self,
        request: &DownloadRequest,
        file_path: &Path,
        progress: &mpsc::Sender<DownloadProgress>,
    ) -> Result<(), DownloadError> {
        let url = self.file_url(&request.repo_id, &request.filename);
        let temp_download_path = request.temp_path();

        let mut builder = self.client.get(&url);
        if let Some(token) = &request.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let mut response = builder.send().await?;
        check_status(response.status(), &url)?;

        let total_bytes = response.content_length();
        debug!("download {} ({:?} bytes)", url, total_bytes);

        // create parent folder
        if let Some(parent_dir) = file_path.parent() {
            fs::create_dir_all(parent_dir).await?;
        }

        let mut file = File::create(&temp_download_path).await?;
        let mut downloaded_bytes = 0u64;

        let written: Result<(), DownloadError> = async {
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
                downloaded_bytes += chunk.len() as u64;
                // progress is advisory, drop it when the receiver lags
                let _ = progress.try_send(DownloadProgress {
                    downloaded_bytes,
                    total_bytes,
                });
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = written {
            drop(file);
            if let Err(remove_err) = fs::remove_file(&temp_download_path).await {
                warn!("failed to remove partial download: {}", remove_err);
            }
            return Err(e);
        }

        fs::rename(&temp_download_path, file_path).await?;
        Ok(())
    }
}

#[async_trait]
impl ModelFetcher for HubDownload {
    #[tracing::instrument(name = "HubDownload::fetch", err(Debug), skip_all, fields(repo_id = %request.repo_id, filename = %request.filename))]
    async fn fetch(
        &self,
        request: &DownloadRequest,
        progress: mpsc::Sender<DownloadProgress>,
    ) -> Result<PathBuf, DownloadError> {
        let file_path = request.target_path();
        info!("check file path: {:?}", file_path);
        if file_path.exists() {
            return Err(DownloadError::AlreadyExists(file_path));
        }

        self.download_to_path(request, &file_path, &progress).await?;

        info!("file {:?} downloaded", file_path);

        Ok(file_path)
    }
}
