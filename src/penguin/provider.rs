//! Provider adapter boundary.
//!
//! Specific LLM provider wire formats are out of scope (§1); this trait is
//! the thin contract the Streaming Pipeline and Iteration Engine code against,
//! grounded in the teacher's `ClientWrapper` trait (`client_wrapper.rs`) but
//! narrowed to what C7/C8 actually need: a streaming call that yields
//! [`crate::penguin::streaming::Chunk`]s, and nothing about provider-specific
//! request shaping.

use crate::penguin::message::Message;
use crate::penguin::streaming::Chunk;
use async_trait::async_trait;
use std::error::Error;

/// A model call that may legitimately return no chunks at all (triggering the
/// empty-response retry in the iteration engine) or fail outright (a
/// retryable provider error per the error taxonomy).
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream(&self, messages: &[Message], streaming: bool) -> Result<Vec<Chunk>, Box<dyn Error + Send + Sync>>;

    fn model_name(&self) -> &str;
}

/// A dependency-free default provider: echoes the most recent user turn back
/// as a completed response. Real provider wire formats are out of scope for
/// this runtime (§1); this exists solely so the CLI front end has something
/// runnable to wire by default without requiring a live model endpoint.
pub struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    async fn stream(&self, messages: &[Message], _streaming: bool) -> Result<Vec<Chunk>, Box<dyn Error + Send + Sync>> {
        let last_user_text = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::penguin::message::Role::User)
            .map(|m| m.as_text())
            .unwrap_or_default();
        let reply = format!(
            "echo: {last_user_text}\n<action name=\"{}\">{{}}</action>",
            crate::penguin::action::FINISH_RESPONSE
        );
        Ok(vec![Chunk::Assistant(reply), Chunk::Done])
    }

    fn model_name(&self) -> &str {
        "echo"
    }
}

#[cfg(test)]
pub mod test_doubles {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A scripted provider that returns one canned response per call, in
    /// order, looping the last response if the script is exhausted. Grounded
    /// in the teacher's trait-object test doubles (`client_tests.rs`).
    pub struct ScriptedProvider {
        script: Mutex<Vec<Vec<Chunk>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        pub fn new(script: Vec<Vec<Chunk>>) -> Self {
            ScriptedProvider { script: Mutex::new(script), calls: AtomicUsize::new(0) }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn stream(&self, _messages: &[Message], _streaming: bool) -> Result<Vec<Chunk>, Box<dyn Error + Send + Sync>> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self.script.lock().unwrap();
            let response = script.get(index).or_else(|| script.last()).cloned().unwrap_or_default();
            Ok(response)
        }

        fn model_name(&self) -> &str {
            "scripted-test-model"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::penguin::message::{Category, Role};

    #[tokio::test]
    async fn echo_provider_wraps_the_last_user_turn_in_a_finish_response_action() {
        let provider = EchoProvider;
        let messages = vec![
            Message::new(Role::System, "you are helpful", Category::System, "agent-1"),
            Message::new(Role::User, "what is 2+2?", Category::Dialog, "agent-1"),
        ];
        let chunks = provider.stream(&messages, true).await.unwrap();
        let Chunk::Assistant(text) = &chunks[0] else { panic!("expected an assistant chunk") };
        assert!(text.contains("what is 2+2?"));
        assert!(text.contains(crate::penguin::action::FINISH_RESPONSE));
    }
}
