use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// What kind of LoRA the dataset is being captioned for.
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
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum TrainingMode {
    #[default]
    General,
    Style,
    Character,
    Concept,
}

impl TrainingMode {
    pub(crate) fn exclusion_context(&self) -> Option<&'static str> {
        match self {
            TrainingMode::General => None,
            TrainingMode::Style => Some(
                "The user is training a STYLE LoRA. The following visual style elements are what the model should learn implicitly — do NOT describe or mention them in your caption. Focus on describing everything ELSE in the image (subject, scene, composition, colors, lighting setup, mood).",
            ),
            TrainingMode::Character => Some(
                "The user is training a CHARACTER LoRA. The following physical traits belong to the character being trained — do NOT describe or mention them in your caption. Focus on describing everything ELSE (pose, action, clothing, expression, setting, background, lighting).",
            ),
            TrainingMode::Concept => Some(
                "The user is training a CONCEPT LoRA. The following concept-specific elements are what the model should learn implicitly — do NOT describe or mention them in your caption. Focus on describing everything ELSE in the image.",
            ),
        }
    }

    /// Guidance for the exclusion field, empty for general captioning.
    pub fn hint(&self) -> &'static str {
        match self {
            TrainingMode::General => "",
            TrainingMode::Style => {
                "Describe the visual style elements the model should learn (e.g. texture, artistic treatment, medium). These will NOT appear in captions."
            }
            TrainingMode::Character => {
                "Describe the character's fixed physical traits (e.g. face shape, eye color, body type). These will NOT appear in captions."
            }
            TrainingMode::Concept => {
                "Describe the concept or visual motif being trained (e.g. a composition technique, effect). These will NOT appear in captions."
            }
        }
    }

    /// Paragraph telling the model which elements to leave out.
    pub(crate) fn exclusion_block(&self, exclusion: &str) -> Option<String> {
        let exclusion = exclusion.trim();
        if exclusion.is_empty() {
            return None;
        }

        self.exclusion_context()
            .map(|context| format!("{} Elements to EXCLUDE: {}.", context, exclusion))
    }
}
