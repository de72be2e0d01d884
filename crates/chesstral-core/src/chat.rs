//! Chat message types shared by the prompt encoder and the HTTP layer.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The author of a chat message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn role_round_trips_through_strum() {
        assert_eq!(Role::from_str("assistant").unwrap(), Role::Assistant);
        assert_eq!(Role::System.to_string(), "system");
        assert!(Role::from_str("narrator").is_err());
    }

    #[test]
    fn role_deserializes_lowercase() {
        let msg: ChatMessage =
            serde_json::from_str(r#"{"role":"user","content":"e4"}"#).unwrap();
        assert_eq!(msg, ChatMessage::user("e4"));
    }
}
