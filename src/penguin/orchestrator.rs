//! Core Orchestrator (C10): the composition root.
//!
//! Grounded in how the teacher's `Agent::new` wires a `ToolRegistry` +
//! `ThoughtChain` + `LLMSession` together explicitly rather than through a
//! global singleton (`agent.rs`); generalized here to wire every component
//! (C1-C9) the runtime needs, plus the agent registry from C9's
//! `Coordinator`. `Orchestrator::new` is the one place in the crate that
//! constructs all of these collaborators; everywhere else takes them as
//! arguments.

use crate::penguin::action::ToolRegistry;
use crate::penguin::agent::{AgentHandle, Coordinator, Persona};
use crate::penguin::bus::MessageBus;
use crate::penguin::context_window::CategoryShares;
use crate::penguin::engine::{RunResult, TurnRunner};
use crate::penguin::error::PenguinError;
use crate::penguin::event::{EventSink, EventStream};
use crate::penguin::permission::PermissionMode;
use crate::penguin::provider::ModelProvider;
use crate::penguin::session::SessionStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Default total context window when a caller doesn't specify one. Matches
/// a conservative mid-size model's context limit so `Orchestrator::new`
/// never silently picks something the active model can't honor; callers with
/// a known model limit should override it via [`OrchestratorConfig`].
const DEFAULT_CONTEXT_WINDOW_TOKENS: usize = 128_000;

/// Construction-time configuration the composition root needs. Mirrors the
/// subset of [`crate::penguin::config::PenguinConfig`] that actually varies
/// per orchestrator instance (model/provider selection lives one layer up,
/// in the CLI front end, since it decides which [`ModelProvider`] impl to
/// construct).
pub struct OrchestratorConfig {
    pub session_store_root: PathBuf,
    pub default_permission_mode: PermissionMode,
    pub workspace_root: PathBuf,
    pub context_window_tokens: usize,
    pub category_shares: CategoryShares,
    pub max_iterations: usize,
    pub no_action_completion: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            session_store_root: std::env::temp_dir().join("penguin-sessions"),
            default_permission_mode: PermissionMode::Workspace,
            workspace_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            context_window_tokens: DEFAULT_CONTEXT_WINDOW_TOKENS,
            category_shares: CategoryShares::default(),
            max_iterations: 5000,
            no_action_completion: true,
        }
    }
}

/// Wires the Token Counter, Context Window Manager, Session Store,
/// Permission Engine, Message Bus, and Event Sink together, and exposes the
/// `process`/`run_single_turn`/`run_response`/`run_task` entry points the CLI
/// front end (and any future API layer) calls against.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<SessionStore>,
    bus: Arc<MessageBus>,
    sink: EventSink,
    coordinator: Coordinator,
    runner: Arc<TurnRunner>,
}

impl Orchestrator {
    /// Constructs every collaborator the runtime needs from `config` and a
    /// chosen `provider`. `registry_factory` builds a fresh [`ToolRegistry`]
    /// per agent (registries are not shared across agents, matching the
    /// per-agent permission-gated capability model). The same [`TurnRunner`]
    /// built here is handed to the [`Coordinator`] so the bus's inbox handler
    /// (§4.9) drives a turn exactly the way `process()` does.
    pub fn new(
        config: OrchestratorConfig,
        provider: Arc<dyn ModelProvider>,
        registry_factory: Box<dyn Fn() -> ToolRegistry + Send + Sync>,
    ) -> Result<(Self, EventStream), PenguinError> {
        let store = Arc::new(SessionStore::open(&config.session_store_root)?);
        let bus = Arc::new(MessageBus::new());
        let (sink, stream) = EventSink::channel();
        let runner = Arc::new(TurnRunner::new(provider, registry_factory, config.max_iterations, config.no_action_completion));
        let coordinator = Coordinator::new(bus.clone(), store.clone(), sink.clone(), runner.clone());

        Ok((Orchestrator { config, store, bus, sink, coordinator, runner }, stream))
    }

    /// Registers the root agent for a session, returning its handle. Callers
    /// use the handle's id with `run_single_turn`/`run_response`/`run_task`.
    /// Threads `config.category_shares` through to the agent's Context Window
    /// Manager — §4.2's default SYSTEM/CONTEXT/DIALOG/SYSTEM_OUTPUT split is
    /// "overridable", so a caller-configured split must actually reach the CWM.
    pub fn register_agent(&self, agent_id: impl Into<String>, persona: Persona) -> Arc<AgentHandle> {
        self.coordinator.register_agent(
            agent_id,
            persona,
            self.config.default_permission_mode,
            self.config.workspace_root.clone(),
            self.config.context_window_tokens,
            self.config.category_shares,
            None,
        )
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn event_sink(&self) -> &EventSink {
        &self.sink
    }

    pub fn session_store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn message_bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Appends `user_input` as a DIALOG turn, then runs exactly one model
    /// call plus at most one action for `agent_id`.
    pub async fn run_single_turn(&self, agent_id: &str, user_input: impl Into<String>) -> Result<RunResult, PenguinError> {
        let handle = self.agent_handle(agent_id)?;
        self.runner.run_single_turn(&handle, self.sink.clone(), user_input).await
    }

    /// Appends `user_input`, then loops until `finish_response` or a guard
    /// fires.
    pub async fn run_response(&self, agent_id: &str, user_input: impl Into<String>) -> Result<RunResult, PenguinError> {
        let handle = self.agent_handle(agent_id)?;
        self.runner.run_response(&handle, self.sink.clone(), user_input).await
    }

    /// Appends `task_description`, then loops until `finish_task` or a guard
    /// fires. Intended for open-ended work spanning many tool round-trips.
    pub async fn run_task(&self, agent_id: &str, task_description: impl Into<String>) -> Result<RunResult, PenguinError> {
        let handle = self.agent_handle(agent_id)?;
        self.runner.run_task(&handle, self.sink.clone(), task_description).await
    }

    /// Generic entry point dispatching on a caller-supplied mode string
    /// (`"single_turn"`, `"response"`, `"task"`), matching the external
    /// interface's single `process()` verb while keeping the typed methods
    /// above for in-process callers.
    pub async fn process(&self, agent_id: &str, mode: &str, input: impl Into<String>) -> Result<RunResult, PenguinError> {
        match mode {
            "single_turn" => self.run_single_turn(agent_id, input).await,
            "response" => self.run_response(agent_id, input).await,
            "task" => self.run_task(agent_id, input).await,
            other => Err(PenguinError::Configuration(format!("unknown run mode '{other}'"))),
        }
    }

    fn agent_handle(&self, agent_id: &str) -> Result<Arc<AgentHandle>, PenguinError> {
        self.coordinator
            .get(agent_id)
            .ok_or_else(|| PenguinError::Configuration(format!("unknown agent '{agent_id}'; call register_agent first")))
    }
}

/// Convenience constructor mirroring the default-counter fallback used
/// throughout the crate when no model-specific tokenizer is available:
/// builds an [`OrchestratorConfig`] pointed at a fresh temp directory,
/// suitable for demos and tests that don't care about exact paths.
pub fn ephemeral_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.session_store_root = std::env::temp_dir().join(format!("penguin-session-{}", uuid::Uuid::new_v4()));
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::penguin::action::{ToolHandler, ToolResult};
    use crate::penguin::provider::test_doubles::ScriptedProvider;
    use crate::penguin::streaming::Chunk;
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn invoke(&self, parameters: &serde_json::Value) -> ToolResult {
            ToolResult::ok(parameters.to_string())
        }
        fn operation(&self) -> &str {
            "read"
        }
    }

    #[tokio::test]
    async fn process_dispatches_run_single_turn_by_mode_string() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![Chunk::Assistant("hello there".to_string())]]));
        let (orchestrator, _stream) =
            Orchestrator::new(ephemeral_config(), provider, Box::new(|| ToolRegistry::new().register("read_file", Arc::new(EchoTool)))).unwrap();

        orchestrator.register_agent(
            "agent-1",
            Persona { name: "default".into(), system_prompt: "you are helpful".into(), model: "test-model".into(), permission_mode: PermissionMode::Workspace },
        );

        let result = orchestrator.process("agent-1", "single_turn", "hi").await.unwrap();
        assert_eq!(result.response, "hello there");
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn process_rejects_unknown_mode() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![Chunk::Assistant("x".to_string())]]));
        let (orchestrator, _stream) = Orchestrator::new(ephemeral_config(), provider, Box::new(ToolRegistry::new)).unwrap();
        orchestrator.register_agent(
            "agent-1",
            Persona { name: "default".into(), system_prompt: "you are helpful".into(), model: "test-model".into(), permission_mode: PermissionMode::Workspace },
        );

        let err = orchestrator.process("agent-1", "bogus", "hi").await.unwrap_err();
        assert_eq!(err.exit_code(), crate::penguin::error::exit_code::CONFIGURATION_ERROR);
    }

    #[tokio::test]
    async fn unknown_agent_id_surfaces_a_configuration_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![Chunk::Assistant("x".to_string())]]));
        let (orchestrator, _stream) = Orchestrator::new(ephemeral_config(), provider, Box::new(ToolRegistry::new)).unwrap();
        let err = orchestrator.run_single_turn("ghost", "hi").await.unwrap_err();
        assert!(matches!(err, PenguinError::Configuration(_)));
    }
}
