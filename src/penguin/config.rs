//! Runtime configuration (§6 External Interfaces).
//!
//! Parsed via `serde` + `toml`, with the section layout following the spec's
//! enumeration 1:1 as Rust structs. Environment variable overrides run as a
//! thin post-deserialize pass (`PENGUIN_<SECTION>_<FIELD>`). Grounded in the
//! teacher's `CloudLLMConfig` convention of a small, explicitly-constructed
//! struct with a `Default` impl (`config.rs`), widened considerably since the
//! teacher's own struct only ever modeled a single thought-chain directory
//! path.

use crate::penguin::error::PenguinError;
use crate::penguin::permission::PermissionMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub provider: String,
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,
    #[serde(default)]
    pub temperature: f64,
    pub context_window: usize,
    pub max_output_tokens: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub client_preference: Option<String>,
}

/// Mirrors [`PermissionMode`] in the configuration vocabulary; kept as a
/// distinct type (rather than deriving (De)serialize directly on
/// `PermissionMode`) so the permission module has no serde dependency of its
/// own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    ReadOnly,
    Workspace,
    Project,
    Full,
}

impl From<SecurityMode> for PermissionMode {
    fn from(mode: SecurityMode) -> Self {
        match mode {
            SecurityMode::ReadOnly => PermissionMode::ReadOnly,
            SecurityMode::Workspace => PermissionMode::Workspace,
            SecurityMode::Project => PermissionMode::Project,
            SecurityMode::Full => PermissionMode::Full,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub mode: SecurityMode,
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    #[serde(default)]
    pub denied_paths: Vec<PathBuf>,
    #[serde(default)]
    pub require_approval: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig { mode: SecurityMode::Workspace, allowed_paths: Vec::new(), denied_paths: Vec::new(), require_approval: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaPermissions {
    pub mode: SecurityMode,
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default)]
    pub denied_paths: Vec<PathBuf>,
}

/// One persona's settings: system prompt, per-persona context window caps
/// (used by [`crate::penguin::agent::Coordinator::spawn_sub_agent`] when this
/// persona is spawned as a sub-agent), and the resolution of the
/// "no-action-completion" open question at persona granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub description: String,
    pub system_prompt: String,
    pub shared_context_window_max_tokens: Option<usize>,
    pub model_output_max_tokens: Option<usize>,
    pub permissions: PersonaPermissions,
    #[serde(default)]
    pub default_tools: Vec<String>,
    /// Whether an iteration with non-empty content and zero parsed actions
    /// should be treated as a completed response. Default `true`; CodeAct-
    /// style personas that always emit an action (even to signal "done") set
    /// this `false`.
    #[serde(default = "default_true")]
    pub no_action_completion: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenguinConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub personas: HashMap<String, PersonaConfig>,
}

impl PenguinConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, PenguinError> {
        toml::from_str(input).map_err(|e| PenguinError::Configuration(format!("invalid configuration: {e}")))
    }

    pub fn load(path: &std::path::Path) -> Result<Self, PenguinError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| PenguinError::Configuration(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `PENGUIN_<SECTION>_<FIELD>` overrides over the fields that are
    /// commonly changed at deploy time without editing the file: model
    /// name/provider and the security mode. Broader per-field coverage is
    /// deliberately out of scope for this pass (see DESIGN.md).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("PENGUIN_MODEL_NAME") {
            self.model.name = name;
        }
        if let Ok(provider) = std::env::var("PENGUIN_MODEL_PROVIDER") {
            self.model.provider = provider;
        }
        if let Ok(mode) = std::env::var("PENGUIN_SECURITY_MODE") {
            if let Some(parsed) = parse_security_mode(&mode) {
                self.security.mode = parsed;
            } else {
                log::warn!("config: ignoring unrecognized PENGUIN_SECURITY_MODE value '{mode}'");
            }
        }
    }
}

fn parse_security_mode(value: &str) -> Option<SecurityMode> {
    match value {
        "read_only" => Some(SecurityMode::ReadOnly),
        "workspace" => Some(SecurityMode::Workspace),
        "project" => Some(SecurityMode::Project),
        "full" => Some(SecurityMode::Full),
        _ => None,
    }
}

/// Publishes a `Status` notice onto the shared event sink when runtime
/// configuration mutates (security mode or workspace/project root changes),
/// per the external interfaces contract that such changes notify subscribed
/// components rather than applying silently.
pub struct ConfigWatcher {
    sink: crate::penguin::event::EventSink,
}

impl ConfigWatcher {
    pub fn new(sink: crate::penguin::event::EventSink) -> Self {
        ConfigWatcher { sink }
    }

    pub fn notify_security_mode_change(&self, agent_id: &str, new_mode: SecurityMode) {
        self.sink.publish(crate::penguin::event::Event::Status {
            agent_id: agent_id.to_string(),
            status: format!("security mode changed to {new_mode:?}"),
        });
    }

    pub fn notify_workspace_root_change(&self, agent_id: &str, new_root: &std::path::Path) {
        self.sink.publish(crate::penguin::event::Event::Status {
            agent_id: agent_id.to_string(),
            status: format!("workspace root changed to {}", new_root.display()),
        });
    }
}
