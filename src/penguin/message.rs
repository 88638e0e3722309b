//! Core message/session data model.
//!
//! Mirrors the tagged-variant discipline the rest of the crate expects: every
//! heterogeneous payload (role, category, message type) is a plain Rust enum so
//! that adding a new variant is a compile error everywhere it is matched, rather
//! than a silently-ignored string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Author role of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    SystemOutput,
}

/// Budget category a message is counted against by the Context Window Manager.
///
/// SYSTEM is never trimmed; the other three are trimmed in the priority order
/// SYSTEM_OUTPUT, DIALOG, CONTEXT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    System,
    Context,
    Dialog,
    SystemOutput,
}

/// A typed content part. Most messages are a single `Text` part; multimodal or
/// tool-result messages use the richer variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String, alt: Option<String> },
    ToolResult { action_id: String, output: String },
}

impl ContentPart {
    pub fn text(s: impl Into<String>) -> Self {
        ContentPart::Text { text: s.into() }
    }

    /// Best-effort plain-text rendering, used by the token counter and by
    /// trimming/truncation logic that operates on character counts.
    pub fn as_text(&self) -> &str {
        match self {
            ContentPart::Text { text } => text,
            ContentPart::Image { alt, .. } => alt.as_deref().unwrap_or(""),
            ContentPart::ToolResult { output, .. } => output,
        }
    }
}

/// Routing header attached to messages delivered via the multi-agent bus.
///
/// Invariant: every bus delivery preserves these fields verbatim; nothing along
/// the delivery path may rewrite `sender`, `recipient`, `message_type`, or
/// `correlation_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    pub recipient: Option<String>,
    pub message_type: MessageType,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Chat,
    Action,
    ActionResult,
    Control,
    Notice,
}

/// A single entry in a [`crate::penguin::session::Session`]'s append-only log.
///
/// Invariants (enforced by [`crate::penguin::session::Session::append`]):
/// identifiers are unique within a session; timestamps are non-decreasing within
/// a session; SYSTEM messages are never trimmed by the CWM; `ToolResult` content
/// parts reference the action that produced them via `action_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentPart>,
    pub category: Category,
    pub timestamp: DateTime<Utc>,
    pub author_agent_id: String,
    pub envelope: Option<Envelope>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    pub fn new(
        role: Role,
        text: impl Into<String>,
        category: Category,
        author_agent_id: impl Into<String>,
    ) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            role,
            content: vec![ContentPart::text(text)],
            category,
            timestamp: Utc::now(),
            author_agent_id: author_agent_id.into(),
            envelope: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = Some(envelope);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Concatenation of all text-bearing content parts, used by the token
    /// counter heuristic and by guard hashing in the iteration engine.
    pub fn as_text(&self) -> String {
        self.content
            .iter()
            .map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_new_assigns_unique_id_and_text_part() {
        let a = Message::new(Role::User, "hello", Category::Dialog, "agent-1");
        let b = Message::new(Role::User, "hello", Category::Dialog, "agent-1");
        assert_ne!(a.id, b.id);
        assert_eq!(a.as_text(), "hello");
    }

    #[test]
    fn envelope_round_trips_through_serde() {
        let env = Envelope {
            sender: "agent-1".into(),
            recipient: Some("agent-2".into()),
            message_type: MessageType::Action,
            correlation_id: Some("corr-1".into()),
        };
        let msg = Message::new(Role::Assistant, "do thing", Category::SystemOutput, "agent-1")
            .with_envelope(env);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.envelope.unwrap().correlation_id.as_deref(), Some("corr-1"));
    }
}
