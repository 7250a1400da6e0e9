use serde::Serialize;
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

pub const MODEL_REPO_ID: &str = "prithivMLmods/Qwen3-VL-8B-Instruct-abliterated-v1-GGUF";
const MODEL_FILE_STEM: &str = "Qwen3-VL-8B-Instruct-abliterated-v1";

/// A single file in a model hub repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HubFile {
    pub repo_id: &'static str,
    pub filename: &'static str,
}

/// Vision encoders to try, in order, when none is present locally.
pub const VISION_ENCODER_SOURCES: [HubFile; 4] = [
    HubFile {
        repo_id: MODEL_REPO_ID,
        filename: "Qwen3-VL-8B-Instruct-abliterated-v1.mmproj-f16.gguf",
    },
    HubFile {
        repo_id: MODEL_REPO_ID,
        filename: "Qwen3-VL-8B-Instruct-abliterated-v1.mmproj-Q8_0.gguf",
    },
    HubFile {
        repo_id: "bartowski/Qwen3-VL-8B-Instruct-GGUF",
        filename: "Qwen3-VL-8B-Instruct-mmproj-f16.gguf",
    },
    HubFile {
        repo_id: "Qwen/Qwen3-VL-8B-Instruct-GGUF",
        filename: "mmproj-Qwen3VL-8B-Instruct-F16.gguf",
    },
];

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, EnumString, AsRefStr, Display, Serialize,
)]
#[strum(ascii_case_insensitive)]
pub enum Quant {
    #[strum(serialize = "Q2_K")]
    Q2K,
    #[strum(serialize = "Q3_K_S")]
    Q3KS,
    #[strum(serialize = "Q3_K_M")]
    Q3KM,
    #[strum(serialize = "Q3_K_L")]
    Q3KL,
    #[strum(serialize = "IQ4_XS")]
    IQ4XS,
    #[strum(serialize = "Q4_K_S")]
    Q4KS,
    #[strum(serialize = "Q4_K_M")]
    Q4KM,
    #[strum(serialize = "Q5_K_S")]
    Q5KS,
    #[strum(serialize = "Q5_K_M")]
    Q5KM,
    #[strum(serialize = "Q6_K")]
    Q6K,
    #[strum(serialize = "Q8_0")]
    Q80,
    #[strum(serialize = "F16")]
    F16,
}

impl Quant {
    /// Download size in GB.
    pub fn size_gb(&self) -> f32 {
        match self {
            Quant::Q2K => 3.28,
            Quant::Q3KS => 3.77,
            Quant::Q3KM => 4.12,
            Quant::Q3KL => 4.43,
            Quant::IQ4XS => 4.59,
            Quant::Q4KS => 4.80,
            Quant::Q4KM => 5.03,
            Quant::Q5KS => 5.72,
            Quant::Q5KM => 5.85,
            Quant::Q6K => 6.73,
            Quant::Q80 => 8.71,
            Quant::F16 => 16.4,
        }
    }

    pub fn filename(&self) -> String {
        match self {
            Quant::F16 => format!("{}.f16.gguf", MODEL_FILE_STEM),
            quant => format!("{}.{}.gguf", MODEL_FILE_STEM, quant),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegistryModel {
    pub quant: Quant,
    pub display_name: String,
    pub repo_id: &'static str,
    pub filename: String,
    pub size_gb: f32,
    pub gated: bool,
}

impl From<Quant> for RegistryModel {
    fn from(quant: Quant) -> Self {
        Self {
            quant,
            display_name: format!("Qwen3-VL 8B ABL - {} ({:.2} GB)", quant, quant.size_gb()),
            repo_id: MODEL_REPO_ID,
            filename: quant.filename(),
            size_gb: quant.size_gb(),
            gated: false,
        }
    }
}

impl RegistryModel {
    pub fn all() -> Vec<RegistryModel> {
        Quant::iter().map(RegistryModel::from).collect()
    }
}

/// Look up a downloadable model by quantisation ("Q4_K_M") or display name.
pub fn registry_model(name: &str) -> Option<RegistryModel> {
    let name = name.trim();
    if let Ok(quant) = name.parse::<Quant>() {
        return Some(quant.into());
    }
    RegistryModel::all()
        .into_iter()
        .find(|model| model.display_name == name)
}
