//! Conversation types shared by the session, prompt assembly, and the
//! transcript store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One conversation entry. Serialized as-is into persisted call
/// transcripts, so the shape here (lowercase role tags, RFC 3339
/// timestamps via chrono) is part of the stored format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), timestamp: Utc::now() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), timestamp: Utc::now() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), timestamp: Utc::now() }
    }
}

/// Who produced a conversation entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Label used when the conversation is linearized into the LLM
    /// prompt transcript (`User: …` / `Assistant: …` lines).
    pub fn transcript_label(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let entry = Message::user("hello");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["role"], "user");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.role, Role::User);
        assert_eq!(back.content, "hello");
    }

    #[test]
    fn test_transcript_labels() {
        assert_eq!(Role::User.transcript_label(), "User");
        assert_eq!(Role::Assistant.transcript_label(), "Assistant");
    }
}
