use crate::{
    builders::{self, BuildInput, PromptBuilder},
    CaptionLength, OptionKey,
};

/// Prompt template shown before any preset is picked.
pub const DEFAULT_PROMPT_TEMPLATE: &str =
    "Describe this image as comma-separated booru-style tags for Stable Diffusion training:";

const TAG_LENGTHS: &[CaptionLength] = &[
    CaptionLength::Short,
    CaptionLength::Medium,
    CaptionLength::Long,
];

/// A target training architecture with its own prompt builder.
pub struct PresetConfig {
    pub id: &'static str,
    pub name: &'static str,
    pub template: &'static str,
    pub prefix: &'static str,
    pub suffix: &'static str,
    pub supported_options: &'static [OptionKey],
    pub allowed_lengths: &'static [CaptionLength],
    pub(crate) builder: PromptBuilder,
}

impl PresetConfig {
    pub fn supports(&self, key: OptionKey) -> bool {
        self.supported_options.contains(&key)
    }

    pub fn allows(&self, length: CaptionLength) -> bool {
        self.allowed_lengths.contains(&length)
    }

    pub(crate) fn build(&self, input: &BuildInput) -> String {
        (self.builder)(input)
    }
}

impl std::fmt::Debug for PresetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresetConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

pub static PRESETS: [PresetConfig; 7] = [
    PresetConfig {
        id: "sd",
        name: "Stable Diffusion",
        template: DEFAULT_PROMPT_TEMPLATE,
        prefix: "",
        suffix: ", high quality, masterwork",
        supported_options: &OptionKey::ALL,
        allowed_lengths: TAG_LENGTHS,
        builder: builders::stable_diffusion,
    },
    PresetConfig {
        id: "flux1",
        name: "Flux 1",
        template: "Provide a very long, highly detailed natural language description of this image for Flux.1:",
        prefix: "",
        suffix: "",
        supported_options: &OptionKey::ALL,
        allowed_lengths: &CaptionLength::ALL,
        builder: builders::flux1,
    },
    PresetConfig {
        id: "flux2",
        name: "Flux 2",
        template: "Provide a comprehensive aesthetic description for Flux.2:",
        prefix: "",
        suffix: "",
        supported_options: &OptionKey::ALL,
        allowed_lengths: &CaptionLength::ALL,
        builder: builders::flux2,
    },
    PresetConfig {
        id: "zimage",
        name: "Z-Image",
        template: "Detailed description for Z-Image fine-tuning:",
        prefix: "",
        suffix: "",
        supported_options: &OptionKey::ALL,
        allowed_lengths: &CaptionLength::ALL,
        builder: builders::zimage,
    },
    PresetConfig {
        id: "chroma",
        name: "Chroma",
        template: "Color-focused descriptive caption for Chroma:",
        prefix: "",
        suffix: "",
        supported_options: &OptionKey::ALL,
        allowed_lengths: &CaptionLength::ALL,
        builder: builders::chroma,
    },
    PresetConfig {
        id: "pony",
        name: "Pony (SDXL)",
        template: "Describe this image as comma-separated booru tags for Pony Diffusion:",
        prefix: "score_9, score_8_up, score_7_up, ",
        suffix: ", rating_safe",
        supported_options: &OptionKey::ALL,
        allowed_lengths: TAG_LENGTHS,
        builder: builders::pony,
    },
    PresetConfig {
        id: "qwen",
        name: "Qwen Image",
        template: "Provide a comprehensive description of this image for Qwen-based generation:",
        prefix: "",
        suffix: "",
        supported_options: &OptionKey::ALL,
        allowed_lengths: &CaptionLength::ALL,
        builder: builders::qwen,
    },
];

pub fn find_preset(id: &str) -> Option<&'static PresetConfig> {
    PRESETS.iter().find(|preset| preset.id == id)
}
