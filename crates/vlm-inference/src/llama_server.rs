use crate::{
    caption_messages, image_to_data_uri, ChatMessage, GenerateRequest, TokenStream, VisionEngine,
    DEFAULT_MAX_IMAGE_DIM, DEFAULT_SYSTEM_PROMPT,
};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header::CONTENT_TYPE, StatusCode, Url};
use reqwest_eventsource::{Event, EventSource};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::{
    process::{Child, Command},
    sync::mpsc,
};
use tracing::{debug, error, info};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct LlamaServerConfig {
    pub binary_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub context_size: u32,
    /// -1 offloads every layer to the GPU.
    pub gpu_layers: i32,
    pub startup_timeout: Duration,
    pub max_image_dim: u32,
    pub system_prompt: String,
    pub extra_args: Vec<String>,
}

impl Default for LlamaServerConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("llama-server"),
            host: "127.0.0.1".to_string(),
            port: 8080,
            context_size: 8192,
            gpu_layers: -1,
            startup_timeout: Duration::from_secs(180),
            max_image_dim: DEFAULT_MAX_IMAGE_DIM,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            extra_args: vec![],
        }
    }
}

struct ServerProcess {
    child: Child,
    endpoint: Url,
    model_path: PathBuf,
}

/// Runs a GGUF vision model through a llama.cpp `llama-server` child process
/// and streams completions from its OpenAI-compatible endpoint.
pub struct LlamaServerEngine {
    config: LlamaServerConfig,
    client: reqwest::Client,
    server: Option<ServerProcess>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    choices: Vec<ChunkChoice>,
}

/// Text pieces carried by one streamed chunk, and whether generation finished.
fn parse_chunk(data: &str) -> anyhow::Result<(Vec<String>, bool)> {
    let chunk: CompletionChunk = serde_json::from_str(data)?;
    let mut finished = false;
    let mut pieces = vec![];

    for choice in chunk.choices {
        if let Some(ChunkDelta {
            content: Some(content),
        }) = choice.delta
        {
            if !content.is_empty() {
                pieces.push(content);
            }
        }
        if let Some(reason) = choice.finish_reason {
            debug!("finish reason: {}", reason);
            finished = true;
        }
    }

    Ok((pieces, finished))
}

impl LlamaServerEngine {
    pub fn new(config: LlamaServerConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            server: None,
        }
    }

    pub fn config(&self) -> &LlamaServerConfig {
        &self.config
    }

    pub fn loaded_model(&self) -> Option<&Path> {
        self.server.as_ref().map(|s| s.model_path.as_path())
    }

    fn endpoint(&self) -> anyhow::Result<Url> {
        Ok(Url::parse(&format!(
            "http://{}:{}/",
            self.config.host, self.config.port
        ))?)
    }

    fn server_args(&self, model_path: &Path, vision_path: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-m".into(),
            model_path.to_string_lossy().into_owned(),
            "--mmproj".into(),
            vision_path.to_string_lossy().into_owned(),
            "--host".into(),
            self.config.host.clone(),
            "--port".into(),
            self.config.port.to_string(),
            "-c".into(),
            self.config.context_size.to_string(),
            "-ngl".into(),
            self.config.gpu_layers.to_string(),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    async fn wait_until_healthy(&self, child: &mut Child, endpoint: &Url) -> anyhow::Result<()> {
        let health = endpoint.join("health")?;
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;

        loop {
            if let Some(status) = child.try_wait()? {
                bail!("llama server exited during startup: {}", status);
            }

            if let Ok(resp) = self.client.get(health.clone()).send().await {
                if resp.status() == StatusCode::OK {
                    return Ok(());
                }
            }

            if tokio::time::Instant::now() >= deadline {
                bail!("llama server start timeout");
            }

            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl VisionEngine for LlamaServerEngine {
    #[tracing::instrument(name = "LlamaServerEngine::load", err(Debug), skip_all, fields(model = %model_path.display()))]
    async fn load(&mut self, model_path: &Path, vision_path: &Path) -> anyhow::Result<()> {
        if !model_path.is_file() {
            bail!("Model file not found: {}", model_path.display());
        }
        if !vision_path.is_file() {
            bail!("Vision encoder file not found: {}", vision_path.display());
        }

        self.unload().await?;

        let endpoint = self.endpoint()?;
        let args = self.server_args(model_path, vision_path);
        debug!("spawn llama server: {:?} {:?}", &self.config.binary_path, &args);

        let mut child = Command::new(&self.config.binary_path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("failed to spawn llama server: {}", e))?;

        if let Err(e) = self.wait_until_healthy(&mut child, &endpoint).await {
            if let Err(kill_err) = child.kill().await {
                error!("failed to stop llama server: {}", kill_err);
            }
            return Err(e);
        }

        info!("llama server ready at {}", endpoint);

        self.server = Some(ServerProcess {
            child,
            endpoint,
            model_path: model_path.to_path_buf(),
        });

        Ok(())
    }

    #[tracing::instrument(name = "LlamaServerEngine::generate", err(Debug), skip_all, fields(image = %request.image_path.display()))]
    async fn generate(&mut self, request: GenerateRequest) -> anyhow::Result<TokenStream> {
        let endpoint = match &self.server {
            Some(server) => server.endpoint.join("v1/chat/completions")?,
            None => bail!("no model loaded"),
        };

        let image_path = request.image_path.clone();
        let max_dim = self.config.max_image_dim;
        let image_uri =
            tokio::task::spawn_blocking(move || image_to_data_uri(image_path, max_dim)).await??;

        let params = request.params.effective();
        let messages = caption_messages(&self.config.system_prompt, &image_uri, &request.prompt)
            .iter()
            .map(ChatMessage::to_value)
            .collect::<Vec<Value>>();

        let builder = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(
                json!({
                    "messages": messages,
                    "stream": true,
                    "temperature": params.temperature,
                    "top_p": params.top_p,
                    "max_tokens": params.max_tokens,
                })
                .to_string(),
            );

        let mut es = EventSource::new(builder)
            .map_err(|e| anyhow!("failed to open completion stream: {}", e))?;
        let (tx, mut rx) = mpsc::channel::<anyhow::Result<String>>(512);

        tokio::spawn(async move {
            while let Some(event) = es.next().await {
                match event {
                    Ok(Event::Open) => {
                        debug!("stream opened");
                    }
                    Ok(Event::Message(message)) => {
                        if message.data.trim() == "[DONE]" {
                            break;
                        }

                        match parse_chunk(&message.data) {
                            Ok((pieces, finished)) => {
                                for piece in pieces {
                                    if tx.send(Ok(piece)).await.is_err() {
                                        // receiver gone, generation was abandoned
                                        debug!("token receiver dropped");
                                        es.close();
                                        return;
                                    }
                                }
                                if finished {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("failed to parse response: {}", &message.data);
                                let _ = tx.send(Err(e)).await;
                                break;
                            }
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => {
                        debug!("stream ended");
                        break;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(anyhow!("completion stream failed: {}", e)))
                            .await;
                        break;
                    }
                }
            }
            es.close();
        });

        let stream = async_stream::stream! {
            while let Some(result) = rx.recv().await {
                yield result;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn unload(&mut self) -> anyhow::Result<()> {
        if let Some(mut server) = self.server.take() {
            server.child.kill().await?;
            info!("llama server stopped: {}", server.model_path.display());
        }
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.server.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SamplingParams;

    #[test]
    fn test_parse_chunk() {
        let (pieces, finished) = parse_chunk(
            r#"{"id":"x","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"A red"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(pieces, vec!["A red".to_string()]);
        assert!(!finished);

        let (pieces, finished) =
            parse_chunk(r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#).unwrap();
        assert!(pieces.is_empty());
        assert!(finished);

        assert!(parse_chunk("{not json").is_err());
    }

    #[test]
    fn test_server_args() {
        let engine = LlamaServerEngine::new(LlamaServerConfig {
            port: 9090,
            extra_args: vec!["--flash-attn".into()],
            ..Default::default()
        });
        let args = engine.server_args(Path::new("/m/model.gguf"), Path::new("/m/mmproj.gguf"));
        assert_eq!(
            args,
            vec![
                "-m",
                "/m/model.gguf",
                "--mmproj",
                "/m/mmproj.gguf",
                "--host",
                "127.0.0.1",
                "--port",
                "9090",
                "-c",
                "8192",
                "-ngl",
                "-1",
                "--flash-attn"
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_load_rejects_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.gguf");
        std::fs::write(&model, b"gguf").unwrap();

        let mut engine = LlamaServerEngine::new(LlamaServerConfig::default());
        let err = engine
            .load(&dir.path().join("absent.gguf"), &model)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Model file not found"));

        let err = engine
            .load(&model, &dir.path().join("mmproj.gguf"))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Vision encoder file not found"));
        assert!(!engine.is_loaded());
    }

    #[test_log::test(tokio::test)]
    async fn test_generate_requires_model() {
        let mut engine = LlamaServerEngine::new(LlamaServerConfig::default());
        let result = engine
            .generate(GenerateRequest {
                image_path: PathBuf::from("a.png"),
                prompt: "Describe.".into(),
                params: SamplingParams::default(),
            })
            .await;
        assert!(result.is_err());
        engine.unload().await.unwrap();
    }
}
