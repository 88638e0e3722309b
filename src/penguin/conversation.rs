//! Conversation Manager (C4).
//!
//! Owns the active [`Session`] for an agent, mediates all writes, and
//! publishes every addition to the Message Bus asynchronously (fire-and-forget
//! is the one pattern the Design Notes explicitly carve out as acceptable:
//! bus fan-out for observers is not on the critical path of a single agent's
//! own loop).

use crate::penguin::bus::MessageBus;
use crate::penguin::context_window::ContextWindowManager;
use crate::penguin::error::PenguinError;
use crate::penguin::message::{Category, Envelope, Message, Role};
use crate::penguin::session::{Checkpoint, CheckpointType, Session, SessionStore};
use std::sync::Arc;

/// Categorization rules mapping a role to its default budget category.
pub fn categorize(role: Role) -> Category {
    match role {
        Role::System => Category::System,
        Role::User | Role::Assistant => Category::Dialog,
        Role::SystemOutput => Category::SystemOutput,
    }
}

pub struct ConversationManager {
    session: Session,
    store: Arc<SessionStore>,
    bus: Arc<MessageBus>,
}

impl ConversationManager {
    pub fn new(session: Session, store: Arc<SessionStore>, bus: Arc<MessageBus>) -> Self {
        ConversationManager { session, store, bus }
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.session.messages
    }

    /// `add_message(role, content, category, metadata, envelope?)`.
    pub fn add_message(
        &mut self,
        role: Role,
        content: impl Into<String>,
        category: Category,
        metadata: serde_json::Map<String, serde_json::Value>,
        envelope: Option<Envelope>,
    ) -> Message {
        let mut message = Message::new(role, content, category, self.session.owning_agent_id.clone());
        for (key, value) in metadata {
            message = message.with_metadata(key, value);
        }
        if let Some(envelope) = envelope {
            message = message.with_envelope(envelope);
        }
        self.session.append(message.clone());

        let bus = self.bus.clone();
        let to_publish = message.clone();
        tokio::spawn(async move {
            bus.publish_conversation_event(to_publish).await;
        });

        message
    }

    /// Appends a message that was constructed elsewhere (the streaming
    /// pipeline's finalized assistant message, an action result, a dropped-
    /// action notice) without re-deriving it from raw content. Bus publication
    /// follows the same fire-and-forget path as [`Self::add_message`].
    pub fn append_finalized(&mut self, message: Message) -> Message {
        self.session.append(message.clone());

        let bus = self.bus.clone();
        let to_publish = message.clone();
        tokio::spawn(async move {
            bus.publish_conversation_event(to_publish).await;
        });

        message
    }

    /// `get_formatted_messages()`: applies CWM trimming/assembly for model
    /// input.
    pub fn get_formatted_messages(&self, cwm: &ContextWindowManager) -> Result<Vec<Message>, PenguinError> {
        if let Some(overflow) = cwm.check_system_overflow(&self.session.messages) {
            return Err(PenguinError::Configuration(format!(
                "SYSTEM message {} ({} tokens) exceeds the SYSTEM budget ({} tokens)",
                overflow.message_id, overflow.tokens, overflow.system_max
            )));
        }
        Ok(cwm.trim(self.session.messages.clone()))
    }

    pub fn save(&self) -> Result<(), PenguinError> {
        self.store.save(&self.session)
    }

    pub fn create_checkpoint(&mut self, label: Option<String>) -> String {
        let id = self.session.create_checkpoint(CheckpointType::Manual, label);
        id
    }

    pub fn rollback_to_checkpoint(&mut self, id: &str) -> bool {
        self.session.rollback_to_checkpoint(id)
    }

    pub fn branch_from_checkpoint(&self, id: &str) -> Option<Session> {
        self.session.branch_from_checkpoint(id)
    }

    pub fn list_checkpoints(&self, limit: usize) -> Vec<Checkpoint> {
        self.session.checkpoints.iter().rev().take(limit).cloned().collect()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}
