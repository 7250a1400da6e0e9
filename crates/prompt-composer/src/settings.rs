use crate::{
    builders::{self, BuildInput},
    find_preset, CaptionLength, ComposeError, OptionKey, PresetConfig, TrainingMode,
    DEFAULT_PROMPT_TEMPLATE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const DEFAULT_SUBJECT_NAME: &str = "the subject";

/// User-controlled inputs to prompt composition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationSettings {
    preset: Option<String>,
    length: CaptionLength,
    enabled: BTreeSet<OptionKey>,
    // toggles greyed out by the active preset
    disabled: BTreeSet<OptionKey>,
    training_mode: TrainingMode,
    exclusion: String,
    trigger_word: String,
    subject_name: String,
    custom_edit: bool,
    custom_prompt: String,
    prompt_template: String,
    prefix: String,
    suffix: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            preset: None,
            length: CaptionLength::default(),
            enabled: BTreeSet::new(),
            disabled: BTreeSet::new(),
            training_mode: TrainingMode::default(),
            exclusion: String::new(),
            trigger_word: String::new(),
            subject_name: String::new(),
            custom_edit: false,
            custom_prompt: String::new(),
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            prefix: String::new(),
            suffix: String::new(),
        }
    }
}

impl GenerationSettings {
    pub fn active_preset(&self) -> Option<&'static PresetConfig> {
        self.preset.as_deref().and_then(find_preset)
    }

    /// Activate a preset, or deactivate it when it is already active.
    pub fn select_preset(&mut self, id: &str) -> Result<(), ComposeError> {
        let preset = find_preset(id).ok_or_else(|| ComposeError::UnknownPreset(id.to_string()))?;

        if self.preset.as_deref() == Some(preset.id) {
            self.deselect_preset();
            return Ok(());
        }

        self.apply_preset(preset);
        Ok(())
    }

    fn apply_preset(&mut self, preset: &PresetConfig) {
        tracing::debug!("preset selected: {}", preset.id);

        self.preset = Some(preset.id.to_string());
        self.prefix = preset.prefix.to_string();
        self.suffix = preset.suffix.to_string();
        self.prompt_template = preset.template.to_string();
        self.custom_edit = false;

        self.disabled = OptionKey::ALL
            .iter()
            .copied()
            .filter(|key| !preset.supports(*key))
            .collect();
        self.enabled.retain(|key| preset.supports(*key));

        if !preset.allows(self.length) {
            self.length = preset.allowed_lengths.first().copied().unwrap_or_default();
        }
    }

    pub fn deselect_preset(&mut self) {
        if let Some(id) = self.preset.take() {
            tracing::debug!("preset deselected: {}", id);
        }
        self.disabled.clear();
        self.custom_edit = false;
    }

    pub fn allowed_lengths(&self) -> &'static [CaptionLength] {
        match self.active_preset() {
            Some(preset) => preset.allowed_lengths,
            None => &CaptionLength::ALL,
        }
    }

    pub fn length(&self) -> CaptionLength {
        self.length
    }

    pub fn set_length(&mut self, length: CaptionLength) -> Result<(), ComposeError> {
        if let Some(preset) = self.active_preset() {
            if !preset.allows(length) {
                return Err(ComposeError::LengthNotAllowed {
                    length,
                    preset: preset.id,
                });
            }
        }
        self.length = length;
        Ok(())
    }

    pub fn is_option_available(&self, key: OptionKey) -> bool {
        !self.disabled.contains(&key)
    }

    pub fn is_option_enabled(&self, key: OptionKey) -> bool {
        self.enabled.contains(&key)
    }

    /// Toggles greyed out by the active preset ignore this.
    pub fn set_option(&mut self, key: OptionKey, on: bool) {
        if !self.is_option_available(key) {
            tracing::debug!("option {} is unavailable for the active preset", key);
            return;
        }
        if on {
            self.enabled.insert(key);
        } else {
            self.enabled.remove(&key);
        }
    }

    pub fn training_mode(&self) -> TrainingMode {
        self.training_mode
    }

    pub fn set_training_mode(&mut self, mode: TrainingMode) {
        self.training_mode = mode;
    }

    pub fn training_hint(&self) -> &'static str {
        self.training_mode.hint()
    }

    pub fn set_exclusion(&mut self, text: impl Into<String>) {
        self.exclusion = text.into();
    }

    pub fn set_trigger_word(&mut self, trigger: impl Into<String>) {
        self.trigger_word = trigger.into();
    }

    pub fn set_subject_name(&mut self, name: impl Into<String>) {
        self.subject_name = name.into();
    }

    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.prefix = prefix.into();
    }

    pub fn set_suffix(&mut self, suffix: impl Into<String>) {
        self.suffix = suffix.into();
    }

    pub fn prompt_template(&self) -> &str {
        &self.prompt_template
    }

    pub fn set_prompt_template(&mut self, template: impl Into<String>) {
        self.prompt_template = template.into();
    }

    pub fn is_custom_edit(&self) -> bool {
        self.custom_edit
    }

    pub fn set_custom_prompt(&mut self, text: impl Into<String>) {
        self.custom_prompt = text.into();
    }

    /// Switch between the composed prompt and free editing. Entering custom
    /// edit with no text yet starts from what the composer would produce.
    pub fn toggle_custom_edit(&mut self) {
        self.custom_edit = !self.custom_edit;
        if self.custom_edit && self.custom_prompt.trim().is_empty() {
            self.custom_prompt = self.compose_base();
        }
    }

    fn active_options(&self) -> BTreeSet<OptionKey> {
        let preset = self.active_preset();
        self.enabled
            .iter()
            .copied()
            .filter(|key| !self.disabled.contains(key))
            .filter(|key| preset.map_or(true, |p| p.supports(*key)))
            .collect()
    }

    fn name_value(&self, active: &BTreeSet<OptionKey>) -> Option<String> {
        if !active.contains(&OptionKey::ReferAsName) {
            return None;
        }
        match self.subject_name.trim() {
            "" => Some(DEFAULT_SUBJECT_NAME.to_string()),
            name => Some(name.to_string()),
        }
    }

    fn compose_base(&self) -> String {
        let active = self.active_options();
        let name = self.name_value(&active);
        let input = BuildInput {
            length: self.length,
            active: &active,
            name: name.as_deref(),
        };

        match self.active_preset() {
            Some(preset) => preset.build(&input),
            None => builders::generic(&input, &self.prompt_template),
        }
    }

    /// The instruction text to send with each image.
    pub fn compose(&self) -> String {
        let base = if self.custom_edit {
            self.custom_prompt.trim().to_string()
        } else {
            self.compose_base()
        };

        match self.training_mode.exclusion_block(&self.exclusion) {
            Some(block) if base.is_empty() => block,
            Some(block) => format!("{} {}", base, block),
            None => base,
        }
    }

    pub fn effective_prefix(&self) -> String {
        let trigger = self.trigger_word.trim();
        let prefix = self.prefix.trim();
        match (trigger.is_empty(), prefix.is_empty()) {
            (false, false) => format!("{}, {}", trigger, prefix),
            (false, true) => format!("{},", trigger),
            _ => prefix.to_string(),
        }
    }

    pub fn effective_suffix(&self) -> String {
        self.suffix.clone()
    }
}
