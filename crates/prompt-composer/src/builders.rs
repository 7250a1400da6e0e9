use crate::{options::name_sentence, CaptionLength, OptionKey};
use std::collections::BTreeSet;

/// Everything a preset builder may look at.
pub(crate) struct BuildInput<'a> {
    pub length: CaptionLength,
    pub active: &'a BTreeSet<OptionKey>,
    pub name: Option<&'a str>,
}

impl BuildInput<'_> {
    fn has(&self, key: OptionKey) -> bool {
        self.active.contains(&key)
    }
}

pub(crate) type PromptBuilder = fn(&BuildInput) -> String;

#[derive(Default)]
struct Fragments(Vec<String>);

impl Fragments {
    fn new(opening: &[&str]) -> Self {
        Self(opening.iter().map(|s| s.to_string()).collect())
    }

    fn push(&mut self, fragment: impl Into<String>) {
        let fragment = fragment.into();
        if !fragment.is_empty() {
            self.0.push(fragment);
        }
    }

    fn push_list(&mut self, lead: &str, items: &[&str]) {
        if !items.is_empty() {
            self.push(format!("{} {}.", lead, items.join(", ")));
        }
    }

    fn push_rules(&mut self, input: &BuildInput, rules: &[(OptionKey, &str)]) {
        for (key, sentence) in rules {
            if input.has(*key) {
                self.push(*sentence);
            }
        }
    }

    fn finish(self) -> String {
        self.0.join(" ")
    }
}

fn pick<'a>(input: &BuildInput, extras: &[(OptionKey, &'a str)]) -> Vec<&'a str> {
    extras
        .iter()
        .filter(|(key, _)| input.has(*key))
        .map(|(_, phrase)| *phrase)
        .collect()
}

fn tag_hints(input: &BuildInput) -> Vec<&'static str> {
    input.active.iter().filter_map(|key| key.tag_hint()).collect()
}

fn tag_count(length: CaptionLength, long: &'static str) -> &'static str {
    match length {
        CaptionLength::Short => "Use 5-15 tags.",
        CaptionLength::Medium => "Use 15-30 tags.",
        CaptionLength::Long | CaptionLength::Descriptive => long,
    }
}

fn refer_as(name: &str) -> String {
    format!("Refer to any person/character as {}.", name)
}

const SD_RULES: &[(OptionKey, &str)] = &[
    (OptionKey::KeepPG, "Keep all tags SFW."),
    (
        OptionKey::ExcludeStaticAttributes,
        "Exclude permanent physical attributes of people.",
    ),
    (OptionKey::ExcludeText, "Do not tag any text in the image."),
    (OptionKey::ExcludeResolution, "Do not include resolution tags."),
    (OptionKey::NoAmbiguity, "Use precise, unambiguous tags."),
];

const PONY_RULES: &[(OptionKey, &str)] = &[
    (OptionKey::KeepPG, "Keep all tags SFW."),
    (
        OptionKey::ExcludeStaticAttributes,
        "Exclude permanent physical attributes of people.",
    ),
    (OptionKey::ExcludeText, "Do not tag any text in the image."),
    (OptionKey::NoAmbiguity, "Use precise, unambiguous tags."),
];

const PROSE_RULES: &[(OptionKey, &str)] = &[
    (OptionKey::KeepPG, "Keep the description PG and family-friendly."),
    (
        OptionKey::ExcludeStaticAttributes,
        "Do not describe unchangeable physical attributes of people.",
    ),
    (OptionKey::ExcludeText, "Do not mention any text visible in the image."),
    (OptionKey::ExcludeResolution, "Do not mention the image resolution."),
    (OptionKey::IncludeWatermark, "Note whether a watermark is present."),
    (OptionKey::IncludeArtifacts, "Note any compression artifacts."),
    (
        OptionKey::IncludeSafety,
        "Indicate whether the image is SFW, suggestive, or NSFW.",
    ),
    (OptionKey::NoAmbiguity, "Use precise, unambiguous language."),
];

const TERSE_PROSE_RULES: &[(OptionKey, &str)] = &[
    (OptionKey::KeepPG, "Keep it PG."),
    (
        OptionKey::ExcludeStaticAttributes,
        "Do not describe unchangeable physical attributes.",
    ),
    (OptionKey::ExcludeText, "Do not mention text in the image."),
    (OptionKey::ExcludeResolution, "Do not mention resolution."),
    (OptionKey::IncludeWatermark, "Note watermark presence."),
    (OptionKey::IncludeArtifacts, "Note compression artifacts."),
    (OptionKey::IncludeSafety, "Indicate content safety rating."),
    (OptionKey::NoAmbiguity, "Use precise language."),
];

const FLUX1_EXTRAS: &[(OptionKey, &str)] = &[
    (OptionKey::IncludeLighting, "lighting details"),
    (OptionKey::IncludeCameraAngle, "camera angle and perspective"),
    (
        OptionKey::IncludeTechnicalDetails,
        "camera and technical photography details",
    ),
    (
        OptionKey::IncludeComposition,
        "composition style (rule of thirds, leading lines, etc.)",
    ),
    (OptionKey::IncludeDOF, "depth of field"),
    (OptionKey::IncludeLightSource, "natural or artificial light sources"),
    (OptionKey::IncludeAestheticQuality, "aesthetic quality assessment"),
];

const FLUX2_EXTRAS: &[(OptionKey, &str)] = &[
    (OptionKey::IncludeLighting, "dramatic lighting"),
    (OptionKey::IncludeCameraAngle, "cinematic camera angle"),
    (OptionKey::IncludeComposition, "composition style"),
    (OptionKey::IncludeDOF, "depth of field and bokeh"),
    (OptionKey::IncludeLightSource, "light sources"),
    (OptionKey::IncludeAestheticQuality, "aesthetic quality"),
    (OptionKey::IncludeTechnicalDetails, "camera/lens details"),
];

const ZIMAGE_EXTRAS: &[(OptionKey, &str)] = &[
    (OptionKey::IncludeLighting, "lighting details"),
    (OptionKey::IncludeCameraAngle, "camera angle and perspective"),
    (
        OptionKey::IncludeTechnicalDetails,
        "camera and technical photography details",
    ),
    (OptionKey::IncludeComposition, "composition style"),
    (OptionKey::IncludeDOF, "depth of field"),
    (OptionKey::IncludeLightSource, "natural or artificial light sources"),
    (OptionKey::IncludeAestheticQuality, "aesthetic quality assessment"),
];

const CHROMA_EXTRAS: &[(OptionKey, &str)] = &[
    (OptionKey::IncludeLighting, "lighting details and color temperature"),
    (OptionKey::IncludeCameraAngle, "camera perspective"),
    (OptionKey::IncludeComposition, "composition"),
    (OptionKey::IncludeDOF, "depth of field"),
    (OptionKey::IncludeLightSource, "light sources and their color"),
    (OptionKey::IncludeAestheticQuality, "aesthetic quality"),
    (OptionKey::IncludeTechnicalDetails, "camera details"),
];

fn tags(
    input: &BuildInput,
    opening: &[&str],
    rules: &[(OptionKey, &str)],
    long: &'static str,
) -> String {
    let mut parts = Fragments::new(opening);
    parts.push_list("Include tags for:", &tag_hints(input));
    parts.push_rules(input, rules);
    if let Some(name) = input.name {
        parts.push(refer_as(name));
    }
    parts.push(tag_count(input.length, long));
    parts.finish()
}

fn prose(
    input: &BuildInput,
    opening: &[&str],
    extras_lead: &str,
    extras: &[(OptionKey, &str)],
    rules: &[(OptionKey, &str)],
) -> String {
    let mut parts = Fragments::new(opening);
    parts.push_list(extras_lead, &pick(input, extras));
    parts.push_rules(input, rules);
    if let Some(name) = input.name {
        parts.push(refer_as(name));
    }
    parts.push(input.length.instruction());
    parts.finish()
}

pub(crate) fn stable_diffusion(input: &BuildInput) -> String {
    tags(
        input,
        &[
            "Describe this image as a comma-separated list of booru-style tags suitable for Stable Diffusion training.",
            "Output ONLY tags separated by commas, no sentences.",
            "Start with the subject, then describe attributes, setting, and style.",
        ],
        SD_RULES,
        "Use 30-50+ tags covering every detail.",
    )
}

pub(crate) fn pony(input: &BuildInput) -> String {
    tags(
        input,
        &[
            "Describe this image as comma-separated booru-style tags for Pony Diffusion.",
            "Output ONLY tags separated by commas, no sentences.",
            "The caption will be automatically prefixed with quality score tags (score_9, score_8_up, etc.) and suffixed with a rating tag.",
            "Focus on subject, attributes, pose, expression, clothing, setting, art style.",
        ],
        PONY_RULES,
        "Use 30-50+ tags.",
    )
}

pub(crate) fn flux1(input: &BuildInput) -> String {
    prose(
        input,
        &[
            "Write a highly detailed natural language description of this image for Flux.1 model training.",
            "Use flowing, descriptive prose — NOT tags or bullet points.",
            "Describe the subject, environment, lighting, colors, textures, mood, and composition in complete sentences.",
        ],
        "Be sure to describe:",
        FLUX1_EXTRAS,
        PROSE_RULES,
    )
}

pub(crate) fn flux2(input: &BuildInput) -> String {
    prose(
        input,
        &[
            "Write a comprehensive aesthetic description of this image for Flux.2 model training.",
            "Use rich, cinematic natural language prose — NOT tags.",
            "Emphasize visual storytelling: mood, atmosphere, cinematic framing, color grading, and artistic intent.",
        ],
        "Include details about:",
        FLUX2_EXTRAS,
        TERSE_PROSE_RULES,
    )
}

pub(crate) fn zimage(input: &BuildInput) -> String {
    prose(
        input,
        &[
            "Write a detailed natural language description of this image for Z-Image model fine-tuning.",
            "Use clear, descriptive prose covering subject, environment, style, lighting, and mood.",
        ],
        "Be sure to describe:",
        ZIMAGE_EXTRAS,
        PROSE_RULES,
    )
}

pub(crate) fn chroma(input: &BuildInput) -> String {
    prose(
        input,
        &[
            "Write a detailed natural language description of this image for Chroma model training.",
            "Emphasize color palette, lighting quality, color temperature, and visual harmony.",
            "Use flowing prose — NOT tags.",
        ],
        "Include:",
        CHROMA_EXTRAS,
        TERSE_PROSE_RULES,
    )
}

pub(crate) fn qwen(input: &BuildInput) -> String {
    let mut parts = Fragments::new(&[
        "Provide a comprehensive, detailed description of this image for Qwen-based image generation training.",
        "Use complete sentences with rich detail about every visual element.",
    ]);
    for key in input.active.iter().filter(|k| **k != OptionKey::ReferAsName) {
        parts.push(key.instruction());
    }
    if let Some(name) = input.name {
        parts.push(name_sentence(name));
    }
    parts.push(input.length.instruction());
    parts.finish()
}

/// Used when no preset is active: the user's template, the length sentence,
/// then each enabled option's full sentence.
pub(crate) fn generic(input: &BuildInput, template: &str) -> String {
    let mut parts = Fragments::default();
    parts.push(template.trim());
    parts.push(input.length.instruction());
    for key in input.active.iter() {
        match key {
            OptionKey::ReferAsName => {
                if let Some(name) = input.name {
                    parts.push(name_sentence(name));
                }
            }
            _ => parts.push(key.instruction()),
        }
    }
    parts.finish()
}
