//! Message Bus & Multi-Agent Coordinator (C9), bus half.
//!
//! Grounded in `multi_participant_session.rs`'s `Participant`/
//! `OrchestrationStrategy` naming (Broadcast/RoundRobin/ModeratorLed/
//! Hierarchical map onto the Coordinator policies below) combined with
//! `orchestration.rs`'s agent-dispatch bookkeeping. The per-agent inbox
//! registry uses `dashmap` rather than a single global `Mutex<HashMap<...>>`,
//! a dependency drawn from the wider pack's `mentisdb` dependency table, in
//! line with the Design Notes' instruction to avoid ad hoc global mutable
//! state guarded by one coarse lock.

use crate::penguin::message::{Envelope, Message, MessageType};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A control message that can pause/resume/cancel an agent's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Pause,
    Resume,
    Cancel,
}

/// What arrives in an agent's inbox: either a routed [`Message`] or a
/// [`Control`] directive.
#[derive(Debug, Clone)]
pub enum InboxItem {
    Routed(Message),
    Control(Control),
}

/// Receiving half of an agent's inbox. FIFO within the inbox; delivery order
/// across different agents' inboxes is not guaranteed.
pub struct Inbox {
    receiver: mpsc::UnboundedReceiver<InboxItem>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<InboxItem> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboxItem> {
        self.receiver.try_recv().ok()
    }
}

/// Single in-process dispatcher. Direct envelopes with a specific recipient
/// go to that agent's inbox; envelopes without a recipient fan out to the
/// `bus.message` topic for observers. Best-effort delivery only: nothing
/// persists across a process restart.
pub struct MessageBus {
    inboxes: DashMap<String, mpsc::UnboundedSender<InboxItem>>,
    topic_subscribers: DashMap<String, mpsc::UnboundedSender<Message>>,
}

impl MessageBus {
    pub fn new() -> Self {
        MessageBus { inboxes: DashMap::new(), topic_subscribers: DashMap::new() }
    }

    /// Registers a new inbox for `agent_id`, returning the receiving half.
    /// Re-registering replaces any prior inbox for the same id.
    pub fn register_inbox(&self, agent_id: impl Into<String>) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(agent_id.into(), tx);
        Inbox { receiver: rx }
    }

    pub fn unregister_inbox(&self, agent_id: &str) {
        self.inboxes.remove(agent_id);
    }

    /// Delivers an envelope-bearing message. With a recipient, it's routed
    /// directly (FIFO within that inbox). Without one, it fans out to the
    /// `bus.message` topic.
    pub async fn send(&self, message: Message) -> Result<(), String> {
        let Some(envelope) = message.envelope.clone() else {
            return Err("send() requires a message with an envelope".to_string());
        };
        match &envelope.recipient {
            Some(recipient) => {
                let sender = self
                    .inboxes
                    .get(recipient)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| format!("no inbox registered for agent {recipient}"))?;
                sender
                    .send(InboxItem::Routed(message))
                    .map_err(|_| format!("inbox for {recipient} is closed"))
            }
            None => {
                self.fan_out_to_topic(message);
                Ok(())
            }
        }
    }

    pub fn send_control(&self, agent_id: &str, control: Control) -> Result<(), String> {
        let sender = self
            .inboxes
            .get(agent_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| format!("no inbox registered for agent {agent_id}"))?;
        sender
            .send(InboxItem::Control(control))
            .map_err(|_| format!("inbox for {agent_id} is closed"))
    }

    fn fan_out_to_topic(&self, message: Message) {
        self.topic_subscribers.retain(|_, sender| sender.send(message.clone()).is_ok());
    }

    /// Subscribes an observer to `bus.message`-style fan-out; used by the
    /// Conversation Manager's fire-and-forget publication path and by any UI
    /// layer wanting a firehose of all conversation activity.
    pub fn subscribe_topic(&self, subscriber_id: impl Into<String>) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topic_subscribers.insert(subscriber_id.into(), tx);
        rx
    }

    /// Fire-and-forget publication used by [`crate::penguin::conversation::ConversationManager::add_message`].
    pub async fn publish_conversation_event(&self, message: Message) {
        self.fan_out_to_topic(message);
    }

    /// Convenience wrapper building a `chat`-typed envelope and delivering it.
    pub async fn send_chat(&self, sender: &str, recipient: &str, content: impl Into<String>, agent_id: &str) -> Result<(), String> {
        let message = Message::new(crate::penguin::message::Role::User, content, crate::penguin::message::Category::Dialog, agent_id)
            .with_envelope(Envelope {
                sender: sender.to_string(),
                recipient: Some(recipient.to_string()),
                message_type: MessageType::Chat,
                correlation_id: None,
            });
        self.send(message).await
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-agent resource caps; breach triggers a `cancel` control message.
#[derive(Debug, Clone, Copy)]
pub struct AgentCaps {
    pub wall_clock: Option<std::time::Duration>,
    pub max_tokens: Option<usize>,
    pub max_tool_calls: Option<usize>,
}

impl Default for AgentCaps {
    fn default() -> Self {
        AgentCaps { wall_clock: None, max_tokens: None, max_tool_calls: None }
    }
}

/// Tracks consumption against an [`AgentCaps`] and reports when a cap has been
/// breached so the coordinator can dispatch `cancel`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageTracker {
    pub tokens_used: usize,
    pub tool_calls: usize,
    pub started_at: Option<std::time::Instant>,
}

impl UsageTracker {
    pub fn breached(&self, caps: &AgentCaps) -> bool {
        if let Some(max_tokens) = caps.max_tokens {
            if self.tokens_used > max_tokens {
                return true;
            }
        }
        if let Some(max_tool_calls) = caps.max_tool_calls {
            if self.tool_calls > max_tool_calls {
                return true;
            }
        }
        if let (Some(limit), Some(started)) = (caps.wall_clock, self.started_at) {
            if started.elapsed() > limit {
                return true;
            }
        }
        false
    }
}

/// Pluggable coordinator selection policy: round-robin among agents sharing a
/// role, role-chain, or plan-driven subtask dispatch.
pub trait CoordinatorPolicy: Send + Sync {
    /// Given the current roster (in registration order) and the last agent
    /// selected (if any), returns the next agent id to dispatch, or `None` if
    /// the policy has nothing left to schedule.
    fn next(&mut self, roster: &[String], last: Option<&str>) -> Option<String>;
}

/// Cycles through `roster` in order, wrapping around.
pub struct RoundRobinPolicy;

impl CoordinatorPolicy for RoundRobinPolicy {
    fn next(&mut self, roster: &[String], last: Option<&str>) -> Option<String> {
        if roster.is_empty() {
            return None;
        }
        match last {
            None => Some(roster[0].clone()),
            Some(last_id) => {
                let position = roster.iter().position(|id| id == last_id).unwrap_or(0);
                Some(roster[(position + 1) % roster.len()].clone())
            }
        }
    }
}

/// Walks a fixed chain of roles in order (planner -> researcher ->
/// implementer, etc.) and stops once the chain is exhausted.
pub struct RoleChainPolicy {
    chain: Vec<String>,
    position: usize,
}

impl RoleChainPolicy {
    pub fn new(chain: Vec<String>) -> Self {
        RoleChainPolicy { chain, position: 0 }
    }
}

impl CoordinatorPolicy for RoleChainPolicy {
    fn next(&mut self, roster: &[String], _last: Option<&str>) -> Option<String> {
        while self.position < self.chain.len() {
            let candidate = self.chain[self.position].clone();
            self.position += 1;
            if roster.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Dispatches the next unclaimed subtask from an externally-maintained plan.
/// `assignments` maps agent id to subtask id once dispatched.
pub struct PlanDrivenPolicy {
    pending_subtasks: Vec<(String, String)>, // (agent_id, subtask_id)
}

impl PlanDrivenPolicy {
    pub fn new(pending_subtasks: Vec<(String, String)>) -> Self {
        PlanDrivenPolicy { pending_subtasks }
    }
}

impl CoordinatorPolicy for PlanDrivenPolicy {
    fn next(&mut self, _roster: &[String], _last: Option<&str>) -> Option<String> {
        self.pending_subtasks.pop().map(|(agent_id, _subtask_id)| agent_id)
    }
}

/// Shared handle to a bus, used throughout the orchestrator so it can be
/// cloned cheaply into spawned tasks.
pub type SharedBus = Arc<MessageBus>;
