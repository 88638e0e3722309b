//! Demonstration tool handlers (C5 supplement): `read_file`/`write_file`.
//!
//! Specific tool implementations are out of scope for the action parser/
//! executor proper (§1); these exist only so the executor is exercised
//! against a non-trivial registry and so a CLI front end has something to
//! register by default. Both are thin wrappers over `tokio::fs`, gated
//! entirely by whatever the Permission Engine decides for their `operation()`
//! class — neither performs its own access control.

use crate::penguin::action::{ToolHandler, ToolResult};
use async_trait::async_trait;

pub struct ReadFileTool;

#[async_trait]
impl ToolHandler for ReadFileTool {
    async fn invoke(&self, parameters: &serde_json::Value) -> ToolResult {
        let Some(path) = parameters.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::failure("missing required 'path' parameter");
        };
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => ToolResult::ok(contents),
            Err(e) => ToolResult::failure(format!("failed to read {path}: {e}")),
        }
    }

    fn operation(&self) -> &str {
        "read"
    }
}

pub struct WriteFileTool;

#[async_trait]
impl ToolHandler for WriteFileTool {
    async fn invoke(&self, parameters: &serde_json::Value) -> ToolResult {
        let Some(path) = parameters.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::failure("missing required 'path' parameter");
        };
        let Some(content) = parameters.get("content").and_then(|v| v.as_str()) else {
            return ToolResult::failure("missing required 'content' parameter");
        };
        match tokio::fs::write(path, content).await {
            Ok(()) => ToolResult::ok(format!("wrote {} bytes to {path}", content.len())),
            Err(e) => ToolResult::failure(format!("failed to write {path}: {e}")),
        }
    }

    fn operation(&self) -> &str {
        "write"
    }
}
