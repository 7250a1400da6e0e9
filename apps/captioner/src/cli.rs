use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use prompt_composer::{CaptionLength, GenerationSettings, OptionKey, TrainingMode};
use std::path::PathBuf;
use vlm_inference::{LlamaServerConfig, SamplingParams};

/// Batch image captioning with a local vision-language model
#[derive(Parser, Debug)]
#[command(name = "vl-captioner", version)]
pub struct Cli {
    /// Preferences file, defaults to ~/.vlcaptioner/config.json
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Write logs to <dir>/captioner.log instead of the terminal
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Directory downloaded models are stored in, searched first for local models
    #[arg(long, global = true, default_value = "models")]
    pub model_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the composed prompt with the effective prefix and suffix
    Prompt(PromptArgs),
    /// List local models, the vision encoder and downloadable quantisations
    Models,
    /// Download a model from the registry
    Download(DownloadArgs),
    /// Caption one image, streaming tokens as they are generated
    Caption(CaptionArgs),
    /// Caption every image in a folder, one after another
    Batch(BatchArgs),
    /// Caption coverage of a folder
    Stats {
        folder: PathBuf,
    },
    /// Show or change stored preferences
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    Show,
    SetToken { token: String },
    AddSearchPath { dir: PathBuf },
}

#[derive(Args, Debug, Clone)]
pub struct PromptArgs {
    /// Start from settings saved as JSON
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Target architecture: sd, flux1, flux2, zimage, chroma, pony, qwen
    #[arg(long)]
    pub preset: Option<String>,

    /// Short, Medium, Long or Descriptive
    #[arg(long)]
    pub length: Option<CaptionLength>,

    /// Enable an option by id, e.g. includeLighting (repeatable)
    #[arg(long = "option")]
    pub options: Vec<OptionKey>,

    /// general, style, character or concept
    #[arg(long)]
    pub training_mode: Option<TrainingMode>,

    /// Elements to leave out of captions when training a style, character or concept
    #[arg(long)]
    pub exclude: Option<String>,

    #[arg(long)]
    pub trigger: Option<String>,

    /// Subject name used by the referAsName option
    #[arg(long)]
    pub name: Option<String>,

    /// Prompt template used when no preset is selected
    #[arg(long)]
    pub template: Option<String>,

    #[arg(long)]
    pub prefix: Option<String>,

    #[arg(long)]
    pub suffix: Option<String>,

    /// Send this prompt verbatim (training exclusions are still appended)
    #[arg(long)]
    pub custom: Option<String>,
}

impl PromptArgs {
    pub fn to_settings(&self) -> anyhow::Result<GenerationSettings> {
        let mut settings = match &self.settings {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => GenerationSettings::default(),
        };

        if let Some(preset) = &self.preset {
            // selecting the active preset again would switch it off
            if settings.active_preset().map(|p| p.id) != Some(preset.as_str()) {
                settings.select_preset(preset)?;
            }
        }
        if let Some(template) = &self.template {
            settings.set_prompt_template(template.as_str());
        }
        if let Some(prefix) = &self.prefix {
            settings.set_prefix(prefix.as_str());
        }
        if let Some(suffix) = &self.suffix {
            settings.set_suffix(suffix.as_str());
        }
        if let Some(length) = self.length {
            settings.set_length(length)?;
        }
        for key in &self.options {
            if !settings.is_option_available(*key) {
                tracing::warn!("option {} is not supported by the selected preset", key);
            }
            settings.set_option(*key, true);
        }
        if let Some(mode) = self.training_mode {
            settings.set_training_mode(mode);
        }
        if let Some(exclude) = &self.exclude {
            settings.set_exclusion(exclude.as_str());
        }
        if let Some(trigger) = &self.trigger {
            settings.set_trigger_word(trigger.as_str());
        }
        if let Some(name) = &self.name {
            settings.set_subject_name(name.as_str());
        }
        if let Some(custom) = &self.custom {
            settings.set_custom_prompt(custom.as_str());
            if !settings.is_custom_edit() {
                settings.toggle_custom_edit();
            }
        }

        Ok(settings)
    }
}

#[derive(Args, Debug, Clone)]
pub struct SamplingArgs {
    /// 0 means greedy decoding
    #[arg(long, default_value_t = 0.6)]
    pub temperature: f32,

    #[arg(long, default_value_t = 0.9)]
    pub top_p: f32,

    #[arg(long, default_value_t = 1024)]
    pub max_tokens: u32,
}

impl SamplingArgs {
    pub fn params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
        }
        .clamped()
    }
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Model file, or the file name of a model in the search directories
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Vision encoder (mmproj) file, detected next to the model by default
    #[arg(long)]
    pub vision: Option<PathBuf>,

    /// llama.cpp server binary
    #[arg(long, default_value = "llama-server")]
    pub server_bin: PathBuf,

    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Longest image side sent to the model, in pixels
    #[arg(long, default_value_t = vlm_inference::DEFAULT_MAX_IMAGE_DIM)]
    pub max_image_dim: u32,
}

impl ModelArgs {
    pub fn server_config(&self) -> LlamaServerConfig {
        LlamaServerConfig {
            binary_path: self.server_bin.clone(),
            port: self.port,
            max_image_dim: self.max_image_dim,
            ..Default::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Quantisation (e.g. Q4_K_M) or display name from `models`
    pub model: String,

    /// HuggingFace token, overrides the stored token and HF_TOKEN
    #[arg(long)]
    pub token: Option<String>,

    /// Also fetch a vision encoder when none is present
    #[arg(long)]
    pub with_vision_encoder: bool,
}

#[derive(Args, Debug)]
pub struct CaptionArgs {
    pub image: PathBuf,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub sampling: SamplingArgs,

    #[command(flatten)]
    pub prompt: PromptArgs,

    /// Write the caption to the .txt sidecar
    #[arg(long)]
    pub save: bool,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    pub folder: PathBuf,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub sampling: SamplingArgs,

    #[command(flatten)]
    pub prompt: PromptArgs,

    /// Leave images that already have a caption alone
    #[arg(long)]
    pub skip_existing: bool,

    /// Keep captions in memory instead of writing sidecars
    #[arg(long)]
    pub no_save: bool,
}
