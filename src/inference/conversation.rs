//! Prompt splitting and the single-turn conversation

use super::image::ImageDims;
use serde::Serialize;
use serde::ser::Serializer;

/// Separates the user prompt from an inline system prompt
pub const SYSTEM_PROMPT_MARKER: &str = "<system_prompt>";

/// Split a raw prompt into `(user, system)`.
///
/// Text before the first marker is the user prompt, text between the first
/// and a second marker is the system prompt. Without a marker the default
/// system prompt applies; a missing prompt is an empty user prompt.
pub fn split_prompt<'a>(prompt: Option<&'a str>, default_system: &'a str) -> (&'a str, &'a str) {
    let Some(prompt) = prompt else {
        return ("", default_system);
    };
    let mut parts = prompt.split(SYSTEM_PROMPT_MARKER);
    let user = parts.next().unwrap_or("");
    let system = parts.next().unwrap_or(default_system);
    (user, system)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text { text: String },
    /// Placeholder for the request image; pixels travel separately
    Image { width: u32, height: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Content>,
}

/// Exactly one system turn followed by one user turn (image, then text).
///
/// Serializes as the two-message list chat templates expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    system: Message,
    user: Message,
}

impl Conversation {
    pub fn new(system_prompt: &str, user_prompt: &str, image: ImageDims) -> Self {
        Self {
            system: Message {
                role: Role::System,
                content: vec![Content::Text {
                    text: system_prompt.to_string(),
                }],
            },
            user: Message {
                role: Role::User,
                content: vec![
                    Content::Image {
                        width: image.width,
                        height: image.height,
                    },
                    Content::Text {
                        text: user_prompt.to_string(),
                    },
                ],
            },
        }
    }

    /// Build from a raw prompt using [`split_prompt`]
    pub fn from_prompt(prompt: Option<&str>, default_system: &str, image: ImageDims) -> Self {
        let (user, system) = split_prompt(prompt, default_system);
        Self::new(system, user, image)
    }

    pub fn messages(&self) -> [&Message; 2] {
        [&self.system, &self.user]
    }

    pub fn system_prompt(&self) -> &str {
        first_text(&self.system)
    }

    pub fn user_prompt(&self) -> &str {
        first_text(&self.user)
    }
}

fn first_text(message: &Message) -> &str {
    message
        .content
        .iter()
        .find_map(|c| match c {
            Content::Text { text } => Some(text.as_str()),
            Content::Image { .. } => None,
        })
        .unwrap_or("")
}

impl Serialize for Conversation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.messages())
    }
}
