use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Extra captioning options, declared in registry order.
///
/// The derived `Ord` follows declaration order, so a `BTreeSet<OptionKey>`
/// iterates in registry order and every builder emits sentences in that order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    EnumString,
    AsRefStr,
    Display,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum OptionKey {
    ReferAsName,
    ExcludeStaticAttributes,
    IncludeLighting,
    IncludeCameraAngle,
    IncludeWatermark,
    IncludeArtifacts,
    IncludeTechnicalDetails,
    #[strum(serialize = "keepPG")]
    #[serde(rename = "keepPG")]
    KeepPG,
    ExcludeResolution,
    IncludeAestheticQuality,
    IncludeComposition,
    ExcludeText,
    #[strum(serialize = "includeDOF")]
    #[serde(rename = "includeDOF")]
    IncludeDOF,
    IncludeLightSource,
    NoAmbiguity,
    IncludeSafety,
}

impl OptionKey {
    pub const ALL: [OptionKey; 16] = [
        OptionKey::ReferAsName,
        OptionKey::ExcludeStaticAttributes,
        OptionKey::IncludeLighting,
        OptionKey::IncludeCameraAngle,
        OptionKey::IncludeWatermark,
        OptionKey::IncludeArtifacts,
        OptionKey::IncludeTechnicalDetails,
        OptionKey::KeepPG,
        OptionKey::ExcludeResolution,
        OptionKey::IncludeAestheticQuality,
        OptionKey::IncludeComposition,
        OptionKey::ExcludeText,
        OptionKey::IncludeDOF,
        OptionKey::IncludeLightSource,
        OptionKey::NoAmbiguity,
        OptionKey::IncludeSafety,
    ];

    /// Short label for toggles and listings.
    pub fn label(&self) -> &'static str {
        match self {
            OptionKey::ReferAsName => "Refer as {name}",
            OptionKey::ExcludeStaticAttributes => "Exclude static attributes",
            OptionKey::IncludeLighting => "Lighting",
            OptionKey::IncludeCameraAngle => "Camera angle",
            OptionKey::IncludeWatermark => "Watermark detection",
            OptionKey::IncludeArtifacts => "JPEG artifacts",
            OptionKey::IncludeTechnicalDetails => "Camera / tech details",
            OptionKey::KeepPG => "Keep PG (no NSFW)",
            OptionKey::ExcludeResolution => "Exclude resolution",
            OptionKey::IncludeAestheticQuality => "Aesthetic quality",
            OptionKey::IncludeComposition => "Composition style",
            OptionKey::ExcludeText => "Exclude text / OCR",
            OptionKey::IncludeDOF => "Depth of field",
            OptionKey::IncludeLightSource => "Light sources",
            OptionKey::NoAmbiguity => "No ambiguous language",
            OptionKey::IncludeSafety => "SFW / NSFW rating",
        }
    }

    /// Full instruction sentence used by the generic and Qwen builders.
    pub fn instruction(&self) -> &'static str {
        match self {
            OptionKey::ReferAsName => {
                "If there is a person/character in the image you must refer to them as {name}."
            }
            OptionKey::ExcludeStaticAttributes => {
                "Do NOT include information about people/characters that cannot be changed (like ethnicity, gender, etc), but do still include changeable attributes (like hair style)."
            }
            OptionKey::IncludeLighting => "Include information about lighting.",
            OptionKey::IncludeCameraAngle => "Include information about camera angle.",
            OptionKey::IncludeWatermark => {
                "Include information about whether there is a watermark or not."
            }
            OptionKey::IncludeArtifacts => {
                "Include information about whether there are JPEG artifacts or not."
            }
            OptionKey::IncludeTechnicalDetails => {
                "If it is a photo you MUST include information about what camera was likely used and details such as aperture, shutter speed, ISO, etc."
            }
            OptionKey::KeepPG => "Do NOT include anything sexual; keep it PG.",
            OptionKey::ExcludeResolution => "Do NOT mention the image's resolution.",
            OptionKey::IncludeAestheticQuality => {
                "You MUST include information about the subjective aesthetic quality of the image from low to very high."
            }
            OptionKey::IncludeComposition => {
                "Include information on the image's composition style, such as leading lines, rule of thirds, or symmetry."
            }
            OptionKey::ExcludeText => "Do NOT mention any text that is in the image.",
            OptionKey::IncludeDOF => {
                "Specify the depth of field and whether the background is in focus or blurred."
            }
            OptionKey::IncludeLightSource => {
                "If applicable, mention the likely use of artificial or natural lighting sources."
            }
            OptionKey::NoAmbiguity => "Do NOT use any ambiguous language.",
            OptionKey::IncludeSafety => "Include whether the image is sfw, suggestive, or nsfw.",
        }
    }

    /// Compact booru-style hint for tag-based presets.
    pub fn tag_hint(&self) -> Option<&'static str> {
        match self {
            OptionKey::IncludeLighting => Some("lighting"),
            OptionKey::IncludeCameraAngle => Some("camera angle"),
            OptionKey::IncludeWatermark => Some("watermark"),
            OptionKey::IncludeArtifacts => Some("jpeg artifacts"),
            OptionKey::IncludeTechnicalDetails => Some("camera details"),
            OptionKey::IncludeAestheticQuality => Some("aesthetic quality"),
            OptionKey::IncludeComposition => Some("composition"),
            OptionKey::IncludeDOF => Some("depth of field"),
            OptionKey::IncludeLightSource => Some("light source"),
            OptionKey::IncludeSafety => Some("sfw/nsfw tag"),
            _ => None,
        }
    }
}

pub(crate) fn name_sentence(name: &str) -> String {
    OptionKey::ReferAsName.instruction().replace("{name}", name)
}
