use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    EnumString,
    Display,
    Serialize,
    Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum CaptionLength {
    Short,
    #[default]
    Medium,
    Long,
    #[strum(to_string = "Descriptive (Longest)", serialize = "Descriptive")]
    #[serde(rename = "Descriptive (Longest)", alias = "Descriptive")]
    Descriptive,
}

impl CaptionLength {
    pub const ALL: [CaptionLength; 4] = [
        CaptionLength::Short,
        CaptionLength::Medium,
        CaptionLength::Long,
        CaptionLength::Descriptive,
    ];

    pub fn instruction(&self) -> &'static str {
        match self {
            CaptionLength::Short => "Keep the description brief, around 1-2 sentences.",
            CaptionLength::Medium => "Provide a moderately detailed description in 2-4 sentences.",
            CaptionLength::Long => {
                "Provide a long, detailed description covering all visual elements."
            }
            CaptionLength::Descriptive => {
                "Provide an extremely detailed, comprehensive description covering every visual element, style, mood, lighting, composition, and technical details."
            }
        }
    }
}
