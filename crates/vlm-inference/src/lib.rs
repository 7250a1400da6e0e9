mod engine;
mod image;
mod llama_server;
mod message;
mod params;

pub use engine::{GenerateRequest, TokenStream, VisionEngine};
pub use image::{image_to_data_uri, DEFAULT_MAX_IMAGE_DIM};
pub use llama_server::{LlamaServerConfig, LlamaServerEngine};
pub use message::{caption_messages, ChatMessage, UserContent, DEFAULT_SYSTEM_PROMPT};
pub use params::SamplingParams;
