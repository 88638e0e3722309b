//! Action Parser / Executor (C5).
//!
//! The parser recognizes a fixed, line/tag-based grammar:
//!
//! ```text
//! <action name="read_file">
//! {"path": "data.txt"}
//! </action>
//! ```
//!
//! Malformed tags are logged and skipped rather than aborting the whole parse,
//! matching the spec's recoverable-parse-error category. The handler registry
//! is grounded in `tool_protocol.rs`'s `Tool`/`ToolMetadata`/`ToolRegistry`
//! (builder pattern, named capability records), generalized per the Design
//! Notes so that registering a handler needs only a name, a parameter schema,
//! and an async closure-like trait object.

use crate::penguin::permission::{Decision, PermissionEngine};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const FINISH_RESPONSE: &str = "finish_response";
pub const FINISH_TASK: &str = "finish_task";

/// A single tagged action extracted from assistant text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub parameters: serde_json::Value,
    pub invocation_text: String,
    pub correlation_id: String,
}

/// Parses at most the action tags present; malformed tags are dropped with a
/// log line and do not interrupt extraction of well-formed ones that follow.
pub fn parse_actions(text: &str) -> Vec<Action> {
    let mut actions = Vec::new();
    let mut cursor = text;

    while let Some(open_start) = cursor.find("<action") {
        let after_open = &cursor[open_start..];
        let Some(tag_end) = after_open.find('>') else {
            log::warn!("action_parser: unterminated <action tag, skipping remainder");
            break;
        };
        let opening_tag = &after_open[..=tag_end];
        let name = extract_name_attr(opening_tag);

        let Some(close_rel) = after_open.find("</action>") else {
            log::warn!("action_parser: missing closing </action> tag, skipping");
            cursor = &after_open[tag_end + 1..];
            continue;
        };

        let body = after_open[tag_end + 1..close_rel].trim();
        let rest_start = close_rel + "</action>".len();

        match name {
            Some(name) => match serde_json::from_str::<serde_json::Value>(body) {
                Ok(parameters) => actions.push(Action {
                    name,
                    parameters,
                    invocation_text: after_open[..rest_start].to_string(),
                    correlation_id: Uuid::new_v4().to_string(),
                }),
                Err(e) => {
                    log::warn!("action_parser: malformed JSON body for action, skipping: {e}");
                }
            },
            None => {
                log::warn!("action_parser: <action> tag missing name attribute, skipping");
            }
        }

        cursor = &after_open[rest_start..];
    }

    actions
}

fn extract_name_attr(opening_tag: &str) -> Option<String> {
    let marker = "name=\"";
    let start = opening_tag.find(marker)? + marker.len();
    let end = opening_tag[start..].find('"')? + start;
    Some(opening_tag[start..end].to_string())
}

/// Outcome of executing a single tool handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        ToolResult { success: true, output: output.into(), error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        ToolResult { success: false, output: String::new(), error: Some(error.into()) }
    }
}

/// A registered capability: a name, a JSON parameter schema, and a handler.
/// Permission checks operate on `name`, never on handler identity, per the
/// Design Notes' "dynamic tool registry" guidance.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, parameters: &serde_json::Value) -> ToolResult;

    /// Permission-check operation class for this tool (e.g. `"read"`,
    /// `"write"`, `"shell"`, `"file_delete"`). Defaults to the tool's own
    /// name, but distinct tools may share an operation class.
    fn operation(&self) -> &str;
}

pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry { handlers: HashMap::new() }
    }

    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Message emitted into the Conversation Manager under SYSTEM_OUTPUT after an
/// action completes (or is denied, or is dropped by the single-action policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_name: String,
    pub success: bool,
    pub result: String,
    pub duration_ms: u64,
    pub correlation_id: String,
}

/// Outcome of running the executor for one iteration: at most one action ran;
/// any others emitted a dropped-action notice instead.
pub struct ExecutionOutcome {
    pub primary_result: Option<ActionResult>,
    pub dropped_notices: Vec<String>,
    /// Set when the executed action was `finish_response`/`finish_task`.
    pub termination_action: Option<String>,
    /// Set when the primary action's decision was ASK: the loop must suspend
    /// until this permission request resolves.
    pub pending_approval_id: Option<String>,
    /// The action awaiting approval, preserved so the engine can invoke it
    /// directly via [`ActionExecutor::invoke_now`] once resolved, without
    /// re-running the permission check.
    pub pending_action: Option<Action>,
}

/// Executes at most one action per call, per the single-action-per-iteration
/// policy. Extra actions are dropped with a notice the model sees next turn.
pub struct ActionExecutor {
    registry: ToolRegistry,
}

impl ActionExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        ActionExecutor { registry }
    }

    pub async fn execute(
        &self,
        actions: &[Action],
        permissions: &PermissionEngine,
        agent_id: &str,
    ) -> ExecutionOutcome {
        let mut dropped_notices = Vec::new();
        if actions.len() > 1 {
            for extra in &actions[1..] {
                dropped_notices.push(format!(
                    "action '{}' (correlation_id={}) was dropped: only one action executes per iteration; resubmit it next turn",
                    extra.name, extra.correlation_id
                ));
                log::info!("action_executor: dropping extra action '{}' this iteration", extra.name);
            }
        }

        let Some(primary) = actions.first() else {
            return ExecutionOutcome {
                primary_result: None,
                dropped_notices,
                termination_action: None,
                pending_approval_id: None,
                pending_action: None,
            };
        };

        if primary.name == FINISH_RESPONSE || primary.name == FINISH_TASK {
            return ExecutionOutcome {
                primary_result: Some(ActionResult {
                    action_name: primary.name.clone(),
                    success: true,
                    result: String::new(),
                    duration_ms: 0,
                    correlation_id: primary.correlation_id.clone(),
                }),
                dropped_notices,
                termination_action: Some(primary.name.clone()),
                pending_approval_id: None,
                pending_action: None,
            };
        }

        let Some(handler) = self.registry.get(&primary.name) else {
            return ExecutionOutcome {
                primary_result: Some(ActionResult {
                    action_name: primary.name.clone(),
                    success: false,
                    result: format!("no handler registered for action '{}'", primary.name),
                    duration_ms: 0,
                    correlation_id: primary.correlation_id.clone(),
                }),
                dropped_notices,
                termination_action: None,
                pending_approval_id: None,
                pending_action: None,
            };
        };

        let resource = primary
            .parameters
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(primary.name.as_str());

        let (decision, rationale) = permissions.check(handler.operation(), resource, agent_id);

        match decision {
            Decision::Deny => ExecutionOutcome {
                primary_result: Some(ActionResult {
                    action_name: primary.name.clone(),
                    success: false,
                    result: format!("permission denied: {rationale}"),
                    duration_ms: 0,
                    correlation_id: primary.correlation_id.clone(),
                }),
                dropped_notices,
                termination_action: None,
                pending_approval_id: None,
                pending_action: None,
            },
            Decision::Ask => {
                let request_id = permissions.request_approval(
                    handler.operation(),
                    resource,
                    agent_id,
                    crate::penguin::permission::PermissionScope::Once,
                );
                ExecutionOutcome {
                    primary_result: None,
                    dropped_notices,
                    termination_action: None,
                    pending_approval_id: Some(request_id),
                    pending_action: Some(primary.clone()),
                }
            }
            Decision::Allow => {
                let result = self.invoke_now(primary).await;
                ExecutionOutcome {
                    primary_result: Some(result),
                    dropped_notices,
                    termination_action: None,
                    pending_approval_id: None,
                    pending_action: None,
                }
            }
        }
    }

    /// Invokes `action`'s handler directly, with no permission check. Used
    /// both by the `Allow` branch of [`Self::execute`] and by the Iteration
    /// Engine once a suspended `Ask` decision resolves to approved.
    pub async fn invoke_now(&self, action: &Action) -> ActionResult {
        let Some(handler) = self.registry.get(&action.name) else {
            return ActionResult {
                action_name: action.name.clone(),
                success: false,
                result: format!("no handler registered for action '{}'", action.name),
                duration_ms: 0,
                correlation_id: action.correlation_id.clone(),
            };
        };
        let started = Instant::now();
        let result = handler.invoke(&action.parameters).await;
        let duration = started.elapsed();
        ActionResult {
            action_name: action.name.clone(),
            success: result.success,
            result: if result.success { result.output } else { result.error.unwrap_or_default() },
            duration_ms: duration_ms(duration),
            correlation_id: action.correlation_id.clone(),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}
