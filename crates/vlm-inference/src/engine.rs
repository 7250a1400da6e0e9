use crate::SamplingParams;
use async_trait::async_trait;
use futures::Stream;
use std::{
    path::{Path, PathBuf},
    pin::Pin,
};

/// Generated text pieces, in generation order. Dropping the stream stops generation.
pub type TokenStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub image_path: PathBuf,
    pub prompt: String,
    pub params: SamplingParams,
}

/// A vision-language model that holds at most one model in memory.
#[async_trait]
pub trait VisionEngine: Send + 'static {
    /// Load a model together with its vision encoder. Any resident model is released first.
    async fn load(&mut self, model_path: &Path, vision_path: &Path) -> anyhow::Result<()>;

    async fn generate(&mut self, request: GenerateRequest) -> anyhow::Result<TokenStream>;

    /// Release the resident model. Calling this with nothing loaded is a no-op.
    async fn unload(&mut self) -> anyhow::Result<()>;

    fn is_loaded(&self) -> bool;
}
