use crate::CaptionLength;

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("unknown preset: {0}")]
    UnknownPreset(String),
    #[error("caption length {length} is not available for preset {preset}")]
    LengthNotAllowed {
        length: CaptionLength,
        preset: &'static str,
    },
}
