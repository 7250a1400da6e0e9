//! Builds the instruction text sent alongside every image.
//!
//! Composition is a pure function of [`GenerationSettings`]: the same settings
//! always produce byte-identical prompts.

mod builders;
mod error;
mod length;
mod options;
mod preset;
mod settings;
mod training;

pub use error::ComposeError;
pub use length::CaptionLength;
pub use options::OptionKey;
pub use preset::{find_preset, PresetConfig, DEFAULT_PROMPT_TEMPLATE, PRESETS};
pub use settings::GenerationSettings;
pub use training::TrainingMode;
