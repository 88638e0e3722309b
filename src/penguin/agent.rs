//! Agent registry and sub-agent lifecycle (part of C9), plus the `Agent`
//! entity from the data model.
//!
//! Grounded in the teacher's `Agent` builder (`agent.rs`: `with_system_prompt`,
//! `with_tools`, construction wiring a `ToolRegistry` + `ThoughtChain` +
//! `LLMSession` together explicitly) and in `orchestration.rs`'s `fork`/
//! `fork_with_context` distinction, which is the closest existing analogue to
//! the spec's one-time partial context share on spawn.

use crate::penguin::bus::{AgentCaps, Control, Inbox, InboxItem, MessageBus, UsageTracker};
use crate::penguin::context_window::{CategoryShares, ContextWindowManager};
use crate::penguin::conversation::ConversationManager;
use crate::penguin::engine::TurnRunner;
use crate::penguin::event::{Event, EventSink};
use crate::penguin::message::{Category, Envelope, Message, MessageType, Role};
use crate::penguin::permission::{PermissionEngine, PermissionMode};
use crate::penguin::session::{Session, SessionStore};
use crate::penguin::token_counter::HeuristicTokenCounter;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A persona/role description driving an agent's system prompt and defaults.
#[derive(Debug, Clone)]
pub struct Persona {
    pub name: String,
    pub system_prompt: String,
    pub model: String,
    pub permission_mode: PermissionMode,
}

/// Everything the Coordinator tracks about one live agent.
pub struct AgentHandle {
    pub id: String,
    pub persona: Persona,
    pub parent_id: Option<String>,
    pub conversation: Arc<Mutex<ConversationManager>>,
    pub cwm: Arc<Mutex<ContextWindowManager>>,
    pub category_shares: CategoryShares,
    pub permissions: Arc<PermissionEngine>,
    pub caps: AgentCaps,
    pub usage: Arc<Mutex<UsageTracker>>,
}

/// Owns the agent registry and implements `register_agent`/`spawn_sub_agent`/
/// `destroy_agent`. Uses `dashmap` for the registry rather than a single
/// global lock, consistent with [`crate::penguin::bus::MessageBus`].
pub struct Coordinator {
    agents: DashMap<String, Arc<AgentHandle>>,
    bus: Arc<MessageBus>,
    store: Arc<SessionStore>,
    sink: EventSink,
    runner: Arc<TurnRunner>,
}

impl Coordinator {
    pub fn new(bus: Arc<MessageBus>, store: Arc<SessionStore>, sink: EventSink, runner: Arc<TurnRunner>) -> Self {
        Coordinator { agents: DashMap::new(), bus, store, sink, runner }
    }

    /// `register_agent(id, persona, model, permissions, parent?)`. `shares`
    /// is the CONTEXT/DIALOG/SYSTEM/SYSTEM_OUTPUT split this agent's CWM is
    /// built with; §4.2 calls the default split "overridable", so callers
    /// (the Orchestrator, or `spawn_sub_agent` inheriting the parent's split)
    /// decide it rather than it being hardcoded here.
    pub fn register_agent(
        &self,
        id: impl Into<String>,
        persona: Persona,
        permission_mode: PermissionMode,
        root: impl Into<std::path::PathBuf>,
        context_window_max_tokens: usize,
        shares: CategoryShares,
        parent_id: Option<String>,
    ) -> Arc<AgentHandle> {
        let id = id.into();
        let session = Session::new(id.clone());
        let conversation = Arc::new(Mutex::new(ConversationManager::new(session, self.store.clone(), self.bus.clone())));
        let cwm = Arc::new(Mutex::new(ContextWindowManager::new(
            context_window_max_tokens,
            shares,
            Box::new(HeuristicTokenCounter),
            persona.model.clone(),
        )));
        let permissions = Arc::new(PermissionEngine::new(permission_mode, root));

        let handle = Arc::new(AgentHandle {
            id: id.clone(),
            persona,
            parent_id,
            conversation,
            cwm,
            category_shares: shares,
            permissions,
            caps: AgentCaps::default(),
            usage: Arc::new(Mutex::new(UsageTracker::default())),
        });

        self.agents.insert(id.clone(), handle.clone());
        let inbox = self.bus.register_inbox(id.clone());
        self.spawn_inbox_task(handle.clone(), inbox);
        handle
    }

    /// §4.9's inbox handler: drains `inbox` for the lifetime of the agent,
    /// dispatching `chat`/`action` envelopes into a turn and replying with an
    /// `action_result` envelope, and interpreting `control` messages.
    /// `auto_process: false` on an inbound message's metadata (set on every
    /// reply this handler sends) prevents a reply from re-triggering a turn.
    fn spawn_inbox_task(&self, handle: Arc<AgentHandle>, mut inbox: Inbox) {
        let runner = self.runner.clone();
        let bus = self.bus.clone();
        let sink = self.sink.clone();
        let paused = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            let mut held_while_paused: Vec<Message> = Vec::new();

            while let Some(item) = inbox.recv().await {
                match item {
                    InboxItem::Control(Control::Pause) => paused.store(true, Ordering::SeqCst),
                    InboxItem::Control(Control::Resume) => {
                        paused.store(false, Ordering::SeqCst);
                        for message in held_while_paused.drain(..) {
                            Coordinator::process_inbox_message(&handle, &runner, &bus, &sink, message).await;
                        }
                    }
                    InboxItem::Control(Control::Cancel) => break,
                    InboxItem::Routed(message) => {
                        if paused.load(Ordering::SeqCst) {
                            held_while_paused.push(message);
                        } else {
                            Coordinator::process_inbox_message(&handle, &runner, &bus, &sink, message).await;
                        }
                    }
                }
            }
        });
    }

    /// Dispatches one `chat`/`action` envelope into a turn via `runner`, then
    /// replies to the sender with an `action_result` envelope. Messages with
    /// any other `message_type`, or carrying `auto_process: false`, are
    /// ignored by the handler (the latter is what stops a handler's own reply
    /// from re-triggering itself).
    async fn process_inbox_message(handle: &Arc<AgentHandle>, runner: &Arc<TurnRunner>, bus: &Arc<MessageBus>, sink: &EventSink, message: Message) {
        let Some(envelope) = message.envelope.clone() else { return };
        if !matches!(envelope.message_type, MessageType::Chat | MessageType::Action) {
            return;
        }
        if message.metadata.get("auto_process") == Some(&serde_json::json!(false)) {
            return;
        }

        let content = message.as_text();
        let outcome = match envelope.message_type {
            MessageType::Action => runner.run_task(handle, sink.clone(), content).await,
            _ => runner.run_response(handle, sink.clone(), content).await,
        };

        let (success, output) = match outcome {
            Ok(result) => (true, result.response),
            Err(err) => (false, err.to_string()),
        };

        let reply = Message::new(Role::Assistant, output, Category::Dialog, &handle.id)
            .with_envelope(Envelope {
                sender: handle.id.clone(),
                recipient: Some(envelope.sender.clone()),
                message_type: MessageType::ActionResult,
                correlation_id: Some(message.id.clone()),
            })
            .with_metadata("auto_process", serde_json::json!(false))
            .with_metadata("success", serde_json::json!(success));

        let _ = bus.send(reply).await;
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentHandle>> {
        self.agents.get(id).map(|entry| entry.value().clone())
    }

    /// `destroy_agent(id)`: closes the inbox and drops the registry entry. A
    /// sub-agent's inbox is implicitly closed the same way when its parent is
    /// destroyed is the Coordinator's responsibility at a higher layer
    /// (`destroy_subtree`), not automatic here.
    pub fn destroy_agent(&self, id: &str) {
        self.bus.unregister_inbox(id);
        self.agents.remove(id);
    }

    /// Destroys `id` and every agent whose `parent_id` transitively points at
    /// it, so a parent's inbox closing propagates to its children.
    pub fn destroy_subtree(&self, id: &str) {
        let children: Vec<String> = self
            .agents
            .iter()
            .filter(|entry| entry.value().parent_id.as_deref() == Some(id))
            .map(|entry| entry.key().clone())
            .collect();
        for child in children {
            self.destroy_subtree(&child);
        }
        self.destroy_agent(id);
    }

    pub fn roster(&self) -> Vec<String> {
        self.agents.iter().map(|entry| entry.key().clone()).collect()
    }

    /// `spawn_sub_agent(parent, persona, model_overrides,
    /// shared_context_window_max_tokens?, initial_prompt?)`.
    ///
    /// 1. New Session + CWM for the child (never shared with the parent).
    /// 2. One-time partial context share: copy the parent's current SYSTEM
    ///    and CONTEXT messages into the child; never DIALOG/SYSTEM_OUTPUT,
    ///    never copied again later.
    /// 3. Clamp `child.CWM.max` to `min(child_model_limit, requested_cap)`
    ///    when either is set; emit a parent notice on clamp.
    /// 4. Register under the Coordinator; effective permissions are
    ///    `parent ∩ child_profile`.
    /// 5. If `initial_prompt` is set, enqueue it via the bus.
    pub async fn spawn_sub_agent(
        &self,
        parent_id: &str,
        persona: Persona,
        child_model_limit: Option<usize>,
        shared_context_window_max_tokens: Option<usize>,
        initial_prompt: Option<String>,
    ) -> Result<Arc<AgentHandle>, String> {
        let parent = self.get(parent_id).ok_or_else(|| format!("unknown parent agent {parent_id}"))?;

        let child_id = format!("{parent_id}::{}", uuid::Uuid::new_v4());

        let requested_cap = shared_context_window_max_tokens.unwrap_or(usize::MAX);
        let limit = child_model_limit.unwrap_or(usize::MAX);
        let effective_max = requested_cap.min(limit);
        let parent_max = parent.cwm.lock().await.total_max();
        let clamped_max = effective_max.min(parent_max);

        let effective_permission_mode = parent.permissions.intersect_for_child(persona.permission_mode);

        let handle = self.register_agent(
            child_id.clone(),
            persona,
            effective_permission_mode,
            std::env::temp_dir(),
            if clamped_max == usize::MAX { parent_max } else { clamped_max },
            parent.category_shares,
            Some(parent_id.to_string()),
        );

        // One-time partial context share: SYSTEM + CONTEXT only.
        {
            let parent_conversation = parent.conversation.lock().await;
            let mut child_conversation = handle.conversation.lock().await;
            for message in parent_conversation.messages() {
                if message.category == Category::System || message.category == Category::Context {
                    child_conversation.session_mut().append(message.clone());
                }
            }
        }

        if clamped_max != usize::MAX && clamped_max < parent_max {
            self.sink.publish(Event::Status {
                agent_id: parent_id.to_string(),
                status: format!(
                    "spawned sub-agent {child_id} with CWM.max clamped to {clamped_max} (parent max {parent_max})"
                ),
            });
        }

        if let Some(prompt) = initial_prompt {
            self.bus
                .send_chat(parent_id, &child_id, prompt, parent_id)
                .await
                .map_err(|e| format!("failed to enqueue initial prompt: {e}"))?;
        }

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn coordinator(dir: &std::path::Path) -> Coordinator {
        let bus = Arc::new(MessageBus::new());
        let store = Arc::new(SessionStore::open(dir).unwrap());
        let (sink, _stream) = EventSink::channel();
        let provider = Arc::new(crate::penguin::provider::test_doubles::ScriptedProvider::new(vec![vec![
            crate::penguin::streaming::Chunk::Assistant("ok".to_string()),
        ]]));
        let runner = Arc::new(TurnRunner::new(provider, Box::new(crate::penguin::action::ToolRegistry::new), 50, true));
        Coordinator::new(bus, store, sink, runner)
    }

    fn persona(name: &str) -> Persona {
        Persona {
            name: name.to_string(),
            system_prompt: "you are a helpful agent".into(),
            model: "test-model".into(),
            permission_mode: PermissionMode::Workspace,
        }
    }

    #[tokio::test]
    async fn spawn_sub_agent_clamps_to_the_tighter_of_parent_max_and_requested_cap() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path());
        let parent = coordinator.register_agent("parent", persona("architect"), PermissionMode::Workspace, dir.path(), 200_000, CategoryShares::default(), None);
        let _ = parent;

        let child = coordinator
            .spawn_sub_agent("parent", persona("researcher"), Some(64_000), Some(50_000), None)
            .await
            .unwrap();

        assert_eq!(child.cwm.lock().await.total_max(), 50_000);
    }

    #[tokio::test]
    async fn spawn_sub_agent_copies_only_system_and_context_messages() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path());
        let parent = coordinator.register_agent("parent", persona("architect"), PermissionMode::Workspace, dir.path(), 200_000, CategoryShares::default(), None);

        {
            let mut conversation = parent.conversation.lock().await;
            conversation.add_message(Role::System, "system prompt", Category::System, serde_json::Map::new(), None);
            conversation.add_message(Role::User, "context doc", Category::Context, serde_json::Map::new(), None);
            conversation.add_message(Role::User, "dialog turn", Category::Dialog, serde_json::Map::new(), None);
        }

        let child = coordinator
            .spawn_sub_agent("parent", persona("researcher"), None, None, None)
            .await
            .unwrap();

        let child_conversation = child.conversation.lock().await;
        assert_eq!(child_conversation.messages().len(), 2);
        assert!(child_conversation.messages().iter().all(|m| m.category != Category::Dialog));
    }

    #[tokio::test]
    async fn child_permissions_never_exceed_parent_mode() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path());
        coordinator.register_agent("parent", persona("architect"), PermissionMode::ReadOnly, dir.path(), 200_000, CategoryShares::default(), None);

        let mut full_access_persona = persona("rogue");
        full_access_persona.permission_mode = PermissionMode::Full;

        let child = coordinator.spawn_sub_agent("parent", full_access_persona, None, None, None).await.unwrap();
        let (decision, _) = child.permissions.check("write", dir.path().to_str().unwrap(), &child.id);
        assert_ne!(decision, crate::penguin::permission::Decision::Allow);
    }

    #[tokio::test]
    async fn destroy_subtree_removes_parent_and_children() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path());
        coordinator.register_agent("parent", persona("architect"), PermissionMode::Workspace, dir.path(), 200_000, CategoryShares::default(), None);
        coordinator.spawn_sub_agent("parent", persona("child"), None, None, None).await.unwrap();

        assert_eq!(coordinator.roster().len(), 2);
        coordinator.destroy_subtree("parent");
        assert_eq!(coordinator.roster().len(), 0);
    }
}
