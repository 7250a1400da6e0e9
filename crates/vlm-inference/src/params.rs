use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.6,
            top_p: 0.9,
            max_tokens: 1024,
        }
    }
}

impl SamplingParams {
    pub const TEMPERATURE_RANGE: (f32, f32) = (0.0, 2.0);
    pub const MAX_TOKENS_RANGE: (u32, u32) = (16, 1024);

    /// Clamp to the ranges offered to users.
    pub fn clamped(self) -> Self {
        Self {
            temperature: self
                .temperature
                .clamp(Self::TEMPERATURE_RANGE.0, Self::TEMPERATURE_RANGE.1),
            top_p: self.top_p.clamp(0.0, 1.0),
            max_tokens: self
                .max_tokens
                .clamp(Self::MAX_TOKENS_RANGE.0, Self::MAX_TOKENS_RANGE.1),
        }
    }

    /// Parameters as sent to the sampler. A non-positive temperature means
    /// greedy decoding.
    pub fn effective(self) -> Self {
        if self.temperature <= 0.0 {
            Self {
                temperature: 0.0,
                top_p: 1.0,
                ..self
            }
        } else {
            self
        }
    }
}
