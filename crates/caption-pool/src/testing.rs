use async_trait::async_trait;
use file_downloader::{DownloadError, DownloadProgress, DownloadRequest, ModelFetcher};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use vlm_inference::{GenerateRequest, TokenStream, VisionEngine};

#[derive(Clone, Debug)]
pub(crate) enum Script {
    Tokens(Vec<&'static str>),
    /// Emits the tokens, then never finishes.
    Hang(Vec<&'static str>),
    /// Emits the tokens, then fails.
    Fail(Vec<&'static str>),
    /// Waits, then emits the tokens.
    Delayed(Duration, Vec<&'static str>),
}

/// Scripted engine: replies per image file name, falling back to `default`.
pub(crate) struct FakeEngine {
    pub default: Script,
    pub scripts: HashMap<&'static str, Script>,
    pub fail_load: bool,
    pub load_delay: Duration,
    pub loaded: Arc<AtomicBool>,
    pub generated: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeEngine {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            scripts: HashMap::new(),
            fail_load: false,
            load_delay: Duration::ZERO,
            loaded: Arc::new(AtomicBool::new(false)),
            generated: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn with_script(mut self, file_name: &'static str, script: Script) -> Self {
        self.scripts.insert(file_name, script);
        self
    }
}

#[async_trait]
impl VisionEngine for FakeEngine {
    async fn load(&mut self, _model_path: &Path, _vision_path: &Path) -> anyhow::Result<()> {
        tokio::time::sleep(self.load_delay).await;
        if self.fail_load {
            anyhow::bail!("native loader refused the model");
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn generate(&mut self, request: GenerateRequest) -> anyhow::Result<TokenStream> {
        if !self.is_loaded() {
            anyhow::bail!("no model loaded");
        }
        self.generated
            .lock()
            .unwrap()
            .push(request.image_path.clone());

        let name = request
            .image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let script = self
            .scripts
            .get(name.as_str())
            .cloned()
            .unwrap_or_else(|| self.default.clone());

        let stream = async_stream::stream! {
            match script {
                Script::Tokens(tokens) => {
                    for token in tokens {
                        tokio::task::yield_now().await;
                        yield Ok(token.to_string());
                    }
                }
                Script::Hang(tokens) => {
                    for token in tokens {
                        yield Ok(token.to_string());
                    }
                    futures::future::pending::<()>().await;
                }
                Script::Fail(tokens) => {
                    for token in tokens {
                        yield Ok(token.to_string());
                    }
                    yield Err(anyhow::anyhow!("engine fault"));
                }
                Script::Delayed(delay, tokens) => {
                    tokio::time::sleep(delay).await;
                    for token in tokens {
                        yield Ok(token.to_string());
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn unload(&mut self) -> anyhow::Result<()> {
        self.loaded.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum FetchReply {
    Ok,
    Unauthorized,
    ServerError,
    /// Reports the target as already on disk without writing it.
    Present,
}

/// Scripted fetcher keyed by file name. Unlisted files succeed.
#[derive(Default)]
pub(crate) struct FakeFetcher {
    pub replies: HashMap<&'static str, FetchReply>,
    pub requested: Mutex<Vec<String>>,
    pub delay: Duration,
}

impl FakeFetcher {
    pub fn with_reply(mut self, filename: &'static str, reply: FetchReply) -> Self {
        self.replies.insert(filename, reply);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ModelFetcher for FakeFetcher {
    async fn fetch(
        &self,
        request: &DownloadRequest,
        progress: mpsc::Sender<DownloadProgress>,
    ) -> Result<PathBuf, DownloadError> {
        self.requested.lock().unwrap().push(request.filename.clone());
        tokio::time::sleep(self.delay).await;
        let target = request.target_path();
        if target.exists() {
            return Err(DownloadError::AlreadyExists(target));
        }

        match self
            .replies
            .get(request.filename.as_str())
            .copied()
            .unwrap_or(FetchReply::Ok)
        {
            FetchReply::Ok => {
                let _ = progress
                    .send(DownloadProgress {
                        downloaded_bytes: 4,
                        total_bytes: Some(4),
                    })
                    .await;
                std::fs::create_dir_all(&request.target_dir)?;
                std::fs::write(&target, b"gguf")?;
                Ok(target)
            }
            FetchReply::Unauthorized => Err(DownloadError::Unauthorized {
                status: 401,
                url: format!("https://hub/{}/{}", request.repo_id, request.filename),
            }),
            FetchReply::ServerError => Err(DownloadError::Http {
                status: 500,
                url: format!("https://hub/{}/{}", request.repo_id, request.filename),
            }),
            FetchReply::Present => Err(DownloadError::AlreadyExists(target)),
        }
    }
}
