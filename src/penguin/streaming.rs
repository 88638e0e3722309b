//! Streaming Pipeline (C7).
//!
//! Generalizes the teacher's `MessageChunk`/`MessageChunkStream` shapes
//! (`client_wrapper.rs`) into the stateful per-stream accumulator the spec
//! requires. The teacher consumes chunks directly in a request/response loop
//! with no accumulator of its own; this module adds one, with the sticky
//! activation and idempotent-finalization guarantees the spec demands.

use crate::penguin::event::{Event, EventSink};
use crate::penguin::message::{Category, Message, Role};
use std::time::{Duration, Instant};

/// A chunk a provider adapter yields during a streaming call.
#[derive(Debug, Clone)]
pub enum Chunk {
    Assistant(String),
    Reasoning(String),
    Usage { input_tokens: usize, output_tokens: usize },
    Done,
}

const EMPTY_RESPONSE_PLACEHOLDER: &str = "[Empty response from model]";
const COALESCE_INTERVAL: Duration = Duration::from_millis(40); // ~25 Hz
const COALESCE_CHAR_THRESHOLD: usize = 12;

/// Per-stream accumulator state. Activation is sticky: the first chunk of any
/// kind (including empty/whitespace) marks the stream active, so finalization
/// is guaranteed to run even for a stream that never produces real content.
pub struct StreamAccumulator {
    stream_id: String,
    agent_id: String,
    active: bool,
    content: String,
    reasoning_content: String,
    finalized: bool,
    emit_buffer: String,
    last_emit: Instant,
}

impl StreamAccumulator {
    pub fn new(stream_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        StreamAccumulator {
            stream_id: stream_id.into(),
            agent_id: agent_id.into(),
            active: false,
            content: String::new(),
            reasoning_content: String::new(),
            finalized: false,
            emit_buffer: String::new(),
            last_emit: Instant::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feeds one chunk, coalescing UI-facing deltas at ~25 Hz or a 12-char
    /// threshold, whichever comes first, and publishing a `token`/`reasoning`
    /// event onto `sink` when the threshold fires.
    pub fn ingest(&mut self, chunk: Chunk, sink: &EventSink) {
        self.active = true;
        match chunk {
            Chunk::Assistant(delta) => {
                self.content.push_str(&delta);
                self.emit_buffer.push_str(&delta);
                self.maybe_flush(sink);
            }
            Chunk::Reasoning(delta) => {
                self.reasoning_content.push_str(&delta);
                sink.publish(Event::Reasoning {
                    agent_id: self.agent_id.clone(),
                    stream_id: self.stream_id.clone(),
                    delta,
                });
            }
            Chunk::Usage { .. } => {
                // Usage chunks are preferred over client-side counting by the
                // caller; the accumulator itself only tracks text content.
            }
            Chunk::Done => {
                self.flush(sink);
            }
        }
    }

    fn maybe_flush(&mut self, sink: &EventSink) {
        let elapsed = self.last_emit.elapsed() >= COALESCE_INTERVAL;
        let big_enough = self.emit_buffer.chars().count() >= COALESCE_CHAR_THRESHOLD;
        if elapsed || big_enough {
            self.flush(sink);
        }
    }

    fn flush(&mut self, sink: &EventSink) {
        if self.emit_buffer.is_empty() {
            return;
        }
        sink.publish(Event::Token {
            agent_id: self.agent_id.clone(),
            stream_id: self.stream_id.clone(),
            delta: std::mem::take(&mut self.emit_buffer),
            is_final: false,
        });
        self.last_emit = Instant::now();
    }

    /// Exactly one finalization per stream: on first call, substitutes the
    /// empty-response placeholder if needed, returns the assistant message to
    /// append under DIALOG (reasoning content travels in metadata, not body),
    /// and emits the final UI event. Repeated calls are no-ops that return
    /// `None`.
    pub fn finalize(&mut self, agent_id: &str, sink: &EventSink) -> Option<Message> {
        if self.finalized {
            return None;
        }
        self.finalized = true;
        self.flush(sink);

        let was_empty = self.content.trim().is_empty();
        let final_content = if was_empty {
            EMPTY_RESPONSE_PLACEHOLDER.to_string()
        } else {
            self.content.clone()
        };

        let mut message = Message::new(Role::Assistant, final_content.clone(), Category::Dialog, agent_id);
        message = message.with_metadata("was_empty", serde_json::json!(was_empty));
        if !self.reasoning_content.is_empty() {
            message = message.with_metadata("reasoning", serde_json::json!(self.reasoning_content));
        }

        // The one `is_final=true` event per stream id (§4.7, §8): an empty
        // trailing delta since any real content was already flushed above.
        sink.publish(Event::Token {
            agent_id: agent_id.to_string(),
            stream_id: self.stream_id.clone(),
            delta: String::new(),
            is_final: true,
        });
        sink.publish(Event::Message { agent_id: agent_id.to_string(), content: final_content });

        self.active = false;
        Some(message)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Resets the accumulator for reuse by the next iteration's stream.
    pub fn reset(&mut self, new_stream_id: impl Into<String>) {
        self.stream_id = new_stream_id.into();
        self.active = false;
        self.content.clear();
        self.reasoning_content.clear();
        self.finalized = false;
        self.emit_buffer.clear();
        self.last_emit = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_stream_finalizes_with_placeholder() {
        let (sink, _stream) = EventSink::channel();
        let mut acc = StreamAccumulator::new("s1", "agent-1");
        acc.ingest(Chunk::Assistant(String::new()), &sink);
        let message = acc.finalize("agent-1", &sink).unwrap();
        assert_eq!(message.as_text(), EMPTY_RESPONSE_PLACEHOLDER);
        assert_eq!(message.metadata["was_empty"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let (sink, _stream) = EventSink::channel();
        let mut acc = StreamAccumulator::new("s1", "agent-1");
        acc.ingest(Chunk::Assistant("hello".into()), &sink);
        assert!(acc.finalize("agent-1", &sink).is_some());
        assert!(acc.finalize("agent-1", &sink).is_none());
    }

    #[tokio::test]
    async fn activation_is_sticky_even_for_whitespace_only_chunks() {
        let (sink, _stream) = EventSink::channel();
        let mut acc = StreamAccumulator::new("s1", "agent-1");
        acc.ingest(Chunk::Assistant("   ".into()), &sink);
        assert!(acc.is_active());
    }

    #[tokio::test]
    async fn finalize_emits_exactly_one_is_final_token_event() {
        let (sink, mut stream) = EventSink::channel();
        let mut acc = StreamAccumulator::new("s1", "agent-1");
        acc.ingest(Chunk::Assistant("hello".into()), &sink);
        acc.finalize("agent-1", &sink).unwrap();

        let events = stream.drain();
        let final_tokens: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, Event::Token { is_final, .. } if *is_final))
            .collect();
        assert_eq!(final_tokens.len(), 1);
    }

    #[tokio::test]
    async fn reasoning_content_lands_in_metadata_not_body() {
        let (sink, _stream) = EventSink::channel();
        let mut acc = StreamAccumulator::new("s1", "agent-1");
        acc.ingest(Chunk::Reasoning("thinking...".into()), &sink);
        acc.ingest(Chunk::Assistant("final answer".into()), &sink);
        let message = acc.finalize("agent-1", &sink).unwrap();
        assert_eq!(message.as_text(), "final answer");
        assert_eq!(message.metadata["reasoning"], serde_json::json!("thinking..."));
    }
}
