//! Integration coverage for the Message Bus's routing plus its inbox
//! handler: dispatching `chat`/`action` envelopes into a turn, replying with
//! `action_result`, honoring `control` messages, and guarding against
//! self-triggering via `auto_process: false`.

use async_trait::async_trait;
use penguin::penguin::agent::Persona;
use penguin::penguin::bus::{Control, InboxItem};
use penguin::penguin::message::{Category, Envelope, Message, MessageType, Role};
use penguin::penguin::permission::PermissionMode;
use penguin::penguin::provider::ModelProvider;
use penguin::penguin::streaming::Chunk;
use penguin::{Orchestrator, OrchestratorConfig};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

struct EchoingFinishProvider;

#[async_trait]
impl ModelProvider for EchoingFinishProvider {
    async fn stream(&self, messages: &[Message], _streaming: bool) -> Result<Vec<Chunk>, Box<dyn Error + Send + Sync>> {
        let last_user_text = messages.iter().rev().find(|m| m.role == Role::User).map(Message::as_text).unwrap_or_default();
        Ok(vec![Chunk::Assistant(format!(
            "handled: {last_user_text} <action name=\"{}\">{{}}</action>",
            penguin::penguin::action::FINISH_RESPONSE
        ))])
    }

    fn model_name(&self) -> &str {
        "echo-finish"
    }
}

fn config(dir: &std::path::Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.session_store_root = dir.to_path_buf();
    config.default_permission_mode = PermissionMode::Workspace;
    config.workspace_root = dir.to_path_buf();
    config
}

fn persona() -> Persona {
    Persona { name: "default".into(), system_prompt: "you are helpful".into(), model: "test-model".into(), permission_mode: PermissionMode::Workspace }
}

#[tokio::test]
async fn direct_chat_envelope_is_auto_processed_and_a_reply_arrives_tagged_action_result() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _events) =
        Orchestrator::new(config(dir.path()), Arc::new(EchoingFinishProvider), Box::new(penguin::penguin::action::ToolRegistry::new)).unwrap();
    orchestrator.register_agent("agent-1", persona());

    let bus = orchestrator.message_bus().clone();
    let mut tester_inbox = bus.register_inbox("tester");

    bus.send_chat("tester", "agent-1", "please say hi", "tester").await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), tester_inbox.recv()).await.unwrap().unwrap();
    let InboxItem::Routed(message) = reply else { panic!("expected a routed reply") };
    let envelope = message.envelope.expect("reply must carry an envelope");
    assert_eq!(envelope.message_type, MessageType::ActionResult);
    assert_eq!(envelope.sender, "agent-1");
    assert_eq!(envelope.recipient.as_deref(), Some("tester"));
    assert!(envelope.correlation_id.is_some());
    assert!(message.as_text().contains("please say hi"));
}

#[tokio::test]
async fn a_reply_tagged_auto_process_false_never_triggers_a_further_turn() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _events) =
        Orchestrator::new(config(dir.path()), Arc::new(EchoingFinishProvider), Box::new(penguin::penguin::action::ToolRegistry::new)).unwrap();
    orchestrator.register_agent("agent-1", persona());

    let bus = orchestrator.message_bus().clone();
    let mut tester_inbox = bus.register_inbox("tester");

    let self_triggering = Message::new(Role::User, "ignore me", Category::Dialog, "tester").with_envelope(Envelope {
        sender: "tester".to_string(),
        recipient: Some("agent-1".to_string()),
        message_type: MessageType::Chat,
        correlation_id: None,
    });
    let mut with_guard = self_triggering;
    with_guard.metadata.insert("auto_process".to_string(), serde_json::json!(false));
    bus.send(with_guard).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_millis(200), tester_inbox.recv()).await;
    assert!(outcome.is_err(), "a guarded message must not produce any reply");
}

#[tokio::test]
async fn pausing_an_agent_holds_incoming_chat_until_resume_is_sent() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _events) =
        Orchestrator::new(config(dir.path()), Arc::new(EchoingFinishProvider), Box::new(penguin::penguin::action::ToolRegistry::new)).unwrap();
    orchestrator.register_agent("agent-1", persona());

    let bus = orchestrator.message_bus().clone();
    let mut tester_inbox = bus.register_inbox("tester");

    bus.send_control("agent-1", Control::Pause).unwrap();
    bus.send_chat("tester", "agent-1", "while paused", "tester").await.unwrap();

    let nothing_yet = tokio::time::timeout(Duration::from_millis(150), tester_inbox.recv()).await;
    assert!(nothing_yet.is_err(), "no reply should arrive while the agent is paused");

    bus.send_control("agent-1", Control::Resume).unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), tester_inbox.recv()).await.unwrap().unwrap();
    let InboxItem::Routed(message) = reply else { panic!("expected a routed reply") };
    assert!(message.as_text().contains("while paused"));
}

#[tokio::test]
async fn recipient_less_envelope_fans_out_to_subscribed_observers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(penguin::penguin::session::SessionStore::open(dir.path()).unwrap());
    let _ = store;
    let bus = penguin::penguin::bus::MessageBus::new();
    let mut observer = bus.subscribe_topic("observer-1");

    let notice = Message::new(Role::Assistant, "broadcast notice", Category::Dialog, "agent-1").with_envelope(Envelope {
        sender: "agent-1".to_string(),
        recipient: None,
        message_type: MessageType::Notice,
        correlation_id: None,
    });
    bus.send(notice).await.unwrap();

    let received = observer.recv().await.unwrap();
    assert_eq!(received.as_text(), "broadcast notice");
}
