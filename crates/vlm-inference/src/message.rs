use serde_json::{json, Value};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that describes images accurately and in detail.";

#[derive(Clone, Debug, PartialEq)]
pub enum UserContent {
    ImageUrl(String),
    Text(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChatMessage {
    System(String),
    User(Vec<UserContent>),
    Assistant(String),
}

impl ChatMessage {
    /// OpenAI-compatible chat message object.
    pub fn to_value(&self) -> Value {
        match self {
            ChatMessage::System(text) => json!({ "role": "system", "content": text }),
            ChatMessage::Assistant(text) => json!({ "role": "assistant", "content": text }),
            ChatMessage::User(parts) => {
                let content = parts
                    .iter()
                    .map(|part| match part {
                        UserContent::ImageUrl(url) => {
                            json!({ "type": "image_url", "image_url": { "url": url } })
                        }
                        UserContent::Text(text) => json!({ "type": "text", "text": text }),
                    })
                    .collect::<Vec<_>>();
                json!({ "role": "user", "content": content })
            }
        }
    }
}

/// System prompt, then one user turn carrying the image followed by the instruction.
pub fn caption_messages(system_prompt: &str, image_uri: &str, prompt: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::System(system_prompt.to_string()),
        ChatMessage::User(vec![
            UserContent::ImageUrl(image_uri.to_string()),
            UserContent::Text(prompt.to_string()),
        ]),
    ]
}
