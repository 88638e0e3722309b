//! Iteration Engine (C8).
//!
//! Generalizes the teacher's `execute_ralph` loop (`orchestration.rs`) — an
//! iteration counter, a per-round model call, and a task-completion check —
//! from RALPH's task-checklist-specific termination condition into the
//! spec's full guard set: explicit termination actions, empty-response and
//! repeat-content guards, a stale-context guard, and an optional no-action
//! completion heuristic. Counters are reified fresh in a [`LoopState`] built
//! inside each `run_*` call rather than stored on [`IterationEngine`] itself,
//! so concurrent runs (and successive runs of the same agent) never bleed
//! counters into one another.

use crate::penguin::action::{Action, ActionExecutor, ActionResult, FINISH_RESPONSE, FINISH_TASK, ToolRegistry, parse_actions};
use crate::penguin::agent::AgentHandle;
use crate::penguin::conversation::ConversationManager;
use crate::penguin::context_window::ContextWindowManager;
use crate::penguin::error::PenguinError;
use crate::penguin::event::{Event, EventSink};
use crate::penguin::message::{Category, Role};
use crate::penguin::permission::{PermissionEngine, PermissionStatus};
use crate::penguin::provider::ModelProvider;
use crate::penguin::streaming::{Chunk, StreamAccumulator};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How many characters of the finalized response feed the repeat-content
/// hash. Large enough to distinguish genuinely different short replies,
/// small enough that a long shared preamble doesn't mask a changed ending.
const REPEAT_HASH_PREFIX_CHARS: usize = 200;

/// Consecutive empty/placeholder responses before the empty-response guard
/// fires.
const MAX_CONSECUTIVE_EMPTY: usize = 3;
/// Total empty/placeholder responses (not necessarily consecutive) across a
/// single run before the guard fires regardless of spacing.
const MAX_TOTAL_EMPTY: usize = 10;
/// Consecutive identical-hash responses before the repeat guard fires.
const MAX_CONSECUTIVE_REPEATS: usize = 2;
/// Default hard iteration cap, applied unless a run supplies a tighter one.
const DEFAULT_MAX_ITERATIONS: usize = 5000;
/// One retry is granted per iteration when a model call yields zero chunks
/// outright (a transport-level empty stream, distinct from a placeholder
/// response that did stream something).
const EMPTY_STREAM_RETRIES: usize = 1;
/// Poll interval while a loop is suspended on a pending permission request.
const APPROVAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why a `run_*` call stopped iterating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The model invoked `finish_response` or `finish_task`.
    ExplicitFinish(String),
    /// `MAX_CONSECUTIVE_EMPTY` or `MAX_TOTAL_EMPTY` empty/placeholder responses.
    EmptyResponseGuard,
    /// The same response content repeated `MAX_CONSECUTIVE_REPEATS` times running.
    RepeatGuard,
    /// The assembled context's token count was unchanged across two iterations.
    StaleContextGuard,
    /// Non-empty content with zero parsed actions, and the persona treats that
    /// as an implicit final answer.
    NoActionCompletion,
    /// The hard iteration cap was reached.
    IterationCap,
    /// An optional cost/token cap was reached.
    CostCap,
    /// A single-turn run always stops after exactly one iteration.
    SingleTurnComplete,
}

/// Counters reified fresh per `run_*` call. Never stored on [`IterationEngine`].
#[derive(Debug, Clone, Default)]
struct LoopState {
    iteration: usize,
    consecutive_empty: usize,
    total_empty: usize,
    last_content_hash: Option<u64>,
    consecutive_repeats: usize,
    last_token_count: Option<usize>,
    stale_observations: usize,
    tokens_spent: usize,
}

fn prefix_hash(content: &str) -> u64 {
    let prefix: String = content.chars().take(REPEAT_HASH_PREFIX_CHARS).collect();
    let digest = Sha256::digest(prefix.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Outcome of a completed `run_*` call.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub response: String,
    pub reasoning: Option<String>,
    pub action_results: Vec<ActionResult>,
    pub iterations: usize,
    pub reason: TerminationReason,
}

/// Drives the model-call / parse / execute / guard-check loop for one agent.
/// Holds only cross-run collaborators; nothing about a specific run's
/// progress lives here.
pub struct IterationEngine {
    provider: Arc<dyn ModelProvider>,
    executor: ActionExecutor,
    permissions: Arc<PermissionEngine>,
    sink: EventSink,
    /// Resolution of the "no-action completion" open question: whether an
    /// iteration with non-empty content and zero parsed actions should be
    /// treated as a completed response. Persona-level default `true`.
    no_action_completion: bool,
    max_iterations: usize,
    cost_cap_tokens: Option<usize>,
}

impl IterationEngine {
    pub fn new(provider: Arc<dyn ModelProvider>, executor: ActionExecutor, permissions: Arc<PermissionEngine>, sink: EventSink) -> Self {
        IterationEngine {
            provider,
            executor,
            permissions,
            sink,
            no_action_completion: true,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            cost_cap_tokens: None,
        }
    }

    pub fn with_no_action_completion(mut self, enabled: bool) -> Self {
        self.no_action_completion = enabled;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_cost_cap_tokens(mut self, cap: Option<usize>) -> Self {
        self.cost_cap_tokens = cap;
        self
    }

    /// Exactly one model call plus at most one action; no guard loop runs.
    pub async fn run_single_turn(&self, conversation: &mut ConversationManager, cwm: &mut ContextWindowManager, agent_id: &str) -> RunResult {
        let step = self.step(conversation, cwm, agent_id, 1).await;
        RunResult {
            response: step.content,
            reasoning: step.reasoning,
            action_results: step.action_result.into_iter().collect(),
            iterations: 1,
            reason: TerminationReason::SingleTurnComplete,
        }
    }

    /// Loops until a termination guard fires or `finish_response` is invoked.
    /// Intended for a single conversational turn that may need several tool
    /// round-trips.
    pub async fn run_response(&self, conversation: &mut ConversationManager, cwm: &mut ContextWindowManager, agent_id: &str) -> RunResult {
        self.run_loop(conversation, cwm, agent_id, Some(FINISH_RESPONSE)).await
    }

    /// Loops until a termination guard fires or `finish_task` is invoked.
    /// Intended for an open-ended, potentially long-running task.
    pub async fn run_task(&self, conversation: &mut ConversationManager, cwm: &mut ContextWindowManager, agent_id: &str) -> RunResult {
        self.run_loop(conversation, cwm, agent_id, Some(FINISH_TASK)).await
    }

    async fn run_loop(
        &self,
        conversation: &mut ConversationManager,
        cwm: &mut ContextWindowManager,
        agent_id: &str,
        _expected_termination: Option<&str>,
    ) -> RunResult {
        let mut state = LoopState::default();
        let mut last_content = String::new();
        let mut last_reasoning = None;
        let mut action_results = Vec::new();

        self.sink.publish(Event::Start { agent_id: agent_id.to_string() });

        loop {
            state.iteration += 1;
            self.sink.publish(Event::Progress {
                agent_id: agent_id.to_string(),
                iteration: state.iteration,
                max_iterations: self.max_iterations,
            });

            if state.iteration > self.max_iterations {
                state.iteration -= 1;
                return self.finish(conversation, agent_id, last_content, last_reasoning, action_results, state.iteration, TerminationReason::IterationCap);
            }

            // Stale-context guard: compare this iteration's formatted-input
            // token count against the previous iteration's before calling the
            // model (an unchanging context is evidence the loop is spinning
            // without making progress, e.g. a denied action repeated verbatim).
            if let Ok(formatted) = conversation.get_formatted_messages(cwm) {
                let analysis = cwm.analyze(&formatted);
                match state.last_token_count {
                    Some(previous) if previous == analysis.total => {
                        state.stale_observations += 1;
                    }
                    _ => state.stale_observations = 0,
                }
                state.last_token_count = Some(analysis.total);
                if state.stale_observations >= 1 {
                    return self.finish(conversation, agent_id, last_content, last_reasoning, action_results, state.iteration, TerminationReason::StaleContextGuard);
                }
            }

            let step = self.step(conversation, cwm, agent_id, state.iteration).await;
            last_content = step.content.clone();
            last_reasoning = step.reasoning.clone();
            if let Some(usage) = step.usage_tokens {
                state.tokens_spent += usage;
            }

            // Explicit termination takes priority over every other guard,
            // including the cost cap, per §4.8's guard ordering.
            if let Some(termination) = step.termination_action {
                if let Some(result) = step.action_result {
                    action_results.push(result);
                }
                return self.finish(conversation, agent_id, last_content, last_reasoning, action_results, state.iteration, TerminationReason::ExplicitFinish(termination));
            }

            if let Some(cap) = self.cost_cap_tokens {
                if state.tokens_spent >= cap {
                    if let Some(result) = step.action_result.clone() {
                        action_results.push(result);
                    }
                    return self.finish(conversation, agent_id, last_content, last_reasoning, action_results, state.iteration, TerminationReason::CostCap);
                }
            }

            // Permission denial (including an ASK resolving to denied/expired)
            // surfaces as a failed action_result and the loop continues per
            // §4.6 ("suspends that agent's loop but not others") and §7 item 5.
            if let Some(result) = step.action_result {
                action_results.push(result);
            }

            // Empty-response guard.
            if step.was_empty {
                state.consecutive_empty += 1;
                state.total_empty += 1;
            } else {
                state.consecutive_empty = 0;
            }
            if state.consecutive_empty >= MAX_CONSECUTIVE_EMPTY || state.total_empty >= MAX_TOTAL_EMPTY {
                return self.finish(conversation, agent_id, last_content, last_reasoning, action_results, state.iteration, TerminationReason::EmptyResponseGuard);
            }

            // Repeat-content guard.
            let hash = prefix_hash(&step.content);
            if state.last_content_hash == Some(hash) {
                state.consecutive_repeats += 1;
            } else {
                state.consecutive_repeats = 0;
            }
            state.last_content_hash = Some(hash);
            if state.consecutive_repeats >= MAX_CONSECUTIVE_REPEATS {
                return self.finish(conversation, agent_id, last_content, last_reasoning, action_results, state.iteration, TerminationReason::RepeatGuard);
            }

            // No-action completion: non-empty content, zero parsed actions.
            if self.no_action_completion && !step.was_empty && step.had_no_actions {
                return self.finish(conversation, agent_id, last_content, last_reasoning, action_results, state.iteration, TerminationReason::NoActionCompletion);
            }

            if let Err(e) = conversation.save() {
                log::warn!("iteration_engine: failed to persist session after iteration {}: {e}", state.iteration);
            }
        }
    }

    fn finish(
        &self,
        _conversation: &mut ConversationManager,
        agent_id: &str,
        response: String,
        reasoning: Option<String>,
        action_results: Vec<ActionResult>,
        iterations: usize,
        reason: TerminationReason,
    ) -> RunResult {
        self.sink.publish(Event::Complete {
            agent_id: agent_id.to_string(),
            response: response.clone(),
            action_result_count: action_results.len(),
            iterations,
            reasoning: reasoning.clone(),
        });
        RunResult { response, reasoning, action_results, iterations, reason }
    }

    /// One full iteration body: reset the stream, call the model (with one
    /// empty-stream retry), finalize, parse at most one action, execute it
    /// (suspending on ASK until resolved), and append the results.
    async fn step(&self, conversation: &mut ConversationManager, cwm: &mut ContextWindowManager, agent_id: &str, iteration: usize) -> StepOutcome {
        let formatted = match conversation.get_formatted_messages(cwm) {
            Ok(messages) => messages,
            Err(e) => {
                self.sink.publish(Event::Error { agent_id: agent_id.to_string(), message: e.to_string() });
                return StepOutcome {
                    content: String::new(),
                    reasoning: None,
                    was_empty: true,
                    had_no_actions: true,
                    termination_action: None,
                    action_result: None,
                    usage_tokens: None,
                };
            }
        };

        let stream_id = format!("{agent_id}-{iteration}-{}", Uuid::new_v4());
        let mut accumulator = StreamAccumulator::new(stream_id, agent_id);

        let mut chunks = self.call_model(&formatted).await;
        if chunks.is_empty() {
            // One retry, non-streaming, for a transport-level empty stream.
            chunks = self.call_model_retry(&formatted).await;
        }

        let mut usage_tokens = None;
        for chunk in chunks {
            if let Chunk::Usage { input_tokens, output_tokens } = &chunk {
                usage_tokens = Some(usage_tokens.unwrap_or(0) + input_tokens + output_tokens);
            }
            accumulator.ingest(chunk, &self.sink);
        }

        let finalized = accumulator.finalize(agent_id, &self.sink).unwrap_or_else(|| {
            // finalize() only returns None if already finalized, which cannot
            // happen for a freshly-constructed accumulator; this branch exists
            // purely so `step` never panics on that invariant's violation.
            crate::penguin::message::Message::new(Role::Assistant, "", Category::Dialog, agent_id)
        });

        let was_empty = finalized.metadata.get("was_empty").and_then(|v| v.as_bool()).unwrap_or(false);
        let reasoning = finalized.metadata.get("reasoning").and_then(|v| v.as_str()).map(|s| s.to_string());
        let content = finalized.as_text();

        conversation.append_finalized(finalized);

        let actions = parse_actions(&content);
        let had_no_actions = actions.is_empty();

        let (termination_action, action_result) = self.execute_and_record(conversation, agent_id, &actions).await;

        StepOutcome { content, reasoning, was_empty, had_no_actions, termination_action, action_result, usage_tokens }
    }

    async fn call_model(&self, messages: &[crate::penguin::message::Message]) -> Vec<Chunk> {
        match self.provider.stream(messages, true).await {
            Ok(chunks) => chunks,
            Err(e) => {
                log::error!("iteration_engine: provider call failed: {e}");
                Vec::new()
            }
        }
    }

    async fn call_model_retry(&self, messages: &[crate::penguin::message::Message]) -> Vec<Chunk> {
        for _ in 0..EMPTY_STREAM_RETRIES {
            match self.provider.stream(messages, false).await {
                Ok(chunks) if !chunks.is_empty() => return chunks,
                Ok(_) => continue,
                Err(e) => {
                    log::error!("iteration_engine: empty-response retry failed: {e}");
                }
            }
        }
        Vec::new()
    }

    /// Executes the parsed actions (at most one runs; extras are dropped with
    /// a notice), appending the action result and any dropped-action notices
    /// under SYSTEM_OUTPUT. Suspends on an ASK decision until it resolves.
    ///
    /// A denied or expired ASK resolves the same way an immediate DENY does:
    /// a failed `action_result` is recorded and the run's own loop continues
    /// (§4.6, §7 item 5, §8 Scenario 4) — it never ends the run.
    async fn execute_and_record(
        &self,
        conversation: &mut ConversationManager,
        agent_id: &str,
        actions: &[Action],
    ) -> (Option<String>, Option<ActionResult>) {
        let outcome = self.executor.execute(actions, &self.permissions, agent_id).await;

        for notice in &outcome.dropped_notices {
            conversation.add_message(Role::SystemOutput, notice.clone(), Category::SystemOutput, serde_json::Map::new(), None);
        }

        if let (Some(request_id), Some(pending_action)) = (outcome.pending_approval_id.clone(), outcome.pending_action.clone()) {
            self.sink.publish(Event::ApprovalRequired {
                agent_id: agent_id.to_string(),
                request_id: request_id.clone(),
                operation: pending_action.name.clone(),
                resource: pending_action
                    .parameters
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or(pending_action.name.as_str())
                    .to_string(),
            });

            let status = self.permissions.wait_for_resolution(&request_id, APPROVAL_POLL_INTERVAL).await;
            self.sink.publish(Event::ApprovalResolved {
                agent_id: agent_id.to_string(),
                request_id: request_id.clone(),
                approved: status == PermissionStatus::Approved,
            });

            return match status {
                PermissionStatus::Approved => {
                    let result = self.executor.invoke_now(&pending_action).await;
                    conversation.add_message(Role::SystemOutput, result.result.clone(), Category::SystemOutput, serde_json::Map::new(), None);
                    (None, Some(result))
                }
                _ => {
                    let denial = ActionResult {
                        action_name: pending_action.name.clone(),
                        success: false,
                        result: "permission request was denied or expired".to_string(),
                        duration_ms: 0,
                        correlation_id: pending_action.correlation_id.clone(),
                    };
                    conversation.add_message(Role::SystemOutput, denial.result.clone(), Category::SystemOutput, serde_json::Map::new(), None);
                    (None, Some(denial))
                }
            };
        }

        if let Some(result) = outcome.primary_result.clone() {
            conversation.add_message(Role::SystemOutput, result.result.clone(), Category::SystemOutput, serde_json::Map::new(), None);
        }

        (outcome.termination_action, outcome.primary_result)
    }
}

struct StepOutcome {
    content: String,
    reasoning: Option<String>,
    was_empty: bool,
    had_no_actions: bool,
    termination_action: Option<String>,
    action_result: Option<ActionResult>,
    usage_tokens: Option<usize>,
}

/// Builds an [`IterationEngine`] per call against a shared provider and tool
/// registry factory, and drives the three `run_*` entry points against an
/// [`AgentHandle`]'s own conversation/CWM/permissions. The single place both
/// the Core Orchestrator's public API (§4.10) and the Message Bus's inbox
/// handler (§4.9) go through, so a sub-agent triggered by an inbox message
/// runs a turn exactly the way a directly-invoked `process()` call would.
pub struct TurnRunner {
    provider: Arc<dyn ModelProvider>,
    registry_factory: Box<dyn Fn() -> ToolRegistry + Send + Sync>,
    max_iterations: usize,
    no_action_completion: bool,
}

impl TurnRunner {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry_factory: Box<dyn Fn() -> ToolRegistry + Send + Sync>,
        max_iterations: usize,
        no_action_completion: bool,
    ) -> Self {
        TurnRunner { provider, registry_factory, max_iterations, no_action_completion }
    }

    fn engine_for(&self, permissions: Arc<PermissionEngine>, sink: EventSink) -> IterationEngine {
        let registry = (self.registry_factory)();
        let executor = ActionExecutor::new(registry);
        IterationEngine::new(self.provider.clone(), executor, permissions, sink)
            .with_max_iterations(self.max_iterations)
            .with_no_action_completion(self.no_action_completion)
    }

    pub async fn run_single_turn(&self, handle: &AgentHandle, sink: EventSink, user_input: impl Into<String>) -> Result<RunResult, PenguinError> {
        let engine = self.engine_for(handle.permissions.clone(), sink);
        let mut conversation = handle.conversation.lock().await;
        let mut cwm = handle.cwm.lock().await;
        conversation.add_message(Role::User, user_input, Category::Dialog, serde_json::Map::new(), None);
        let result = engine.run_single_turn(&mut conversation, &mut cwm, &handle.id).await;
        conversation.save()?;
        Ok(result)
    }

    pub async fn run_response(&self, handle: &AgentHandle, sink: EventSink, user_input: impl Into<String>) -> Result<RunResult, PenguinError> {
        let engine = self.engine_for(handle.permissions.clone(), sink);
        let mut conversation = handle.conversation.lock().await;
        let mut cwm = handle.cwm.lock().await;
        conversation.add_message(Role::User, user_input, Category::Dialog, serde_json::Map::new(), None);
        let result = engine.run_response(&mut conversation, &mut cwm, &handle.id).await;
        conversation.save()?;
        Ok(result)
    }

    pub async fn run_task(&self, handle: &AgentHandle, sink: EventSink, task_description: impl Into<String>) -> Result<RunResult, PenguinError> {
        let engine = self.engine_for(handle.permissions.clone(), sink);
        let mut conversation = handle.conversation.lock().await;
        let mut cwm = handle.cwm.lock().await;
        conversation.add_message(Role::User, task_description, Category::Dialog, serde_json::Map::new(), None);
        let result = engine.run_task(&mut conversation, &mut cwm, &handle.id).await;
        conversation.save()?;
        Ok(result)
    }
}
