//! Permission Engine (C6).
//!
//! The teacher crate has no permission system of its own; this module is
//! built fresh, grounded in the Codex CLI's `AskForApproval`/`SandboxPolicy`
//! protocol types (the closest real-world analogue in the retrieval pack: a
//! mode enum controlling when approval is required, plus a policy enum
//! controlling what paths are writable). Naming is renamed onto the spec's own
//! vocabulary rather than copied from Codex.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Permission mode, analogous to Codex's `SandboxPolicy` variants but scoped
/// to the spec's four-mode vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    ReadOnly,
    Workspace,
    Project,
    /// Only usable via an explicit "yolo" override; never the default.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Ask,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionScope {
    Once,
    Session,
    Pattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub id: String,
    pub operation: String,
    pub resource: String,
    pub agent_id: String,
    pub scope: PermissionScope,
    pub status: PermissionStatus,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl PermissionRequest {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > self.ttl
    }
}

/// Read-class operations that READ_ONLY mode always allows.
const READ_CLASS_OPERATIONS: [&str; 4] = ["read", "list", "search", "memory.read"];

fn is_read_class(operation: &str) -> bool {
    READ_CLASS_OPERATIONS.contains(&operation)
}

/// Normalizes `resource` against `root`, rejecting any path that escapes it
/// via `..` traversal or a symlink resolving outside the root.
///
/// Returns `None` if the resource escapes the root.
fn normalize_within_root(root: &Path, resource: &Path) -> Option<PathBuf> {
    let candidate = if resource.is_absolute() {
        resource.to_path_buf()
    } else {
        root.join(resource)
    };

    // Resolve lexically first (the path may not exist on disk yet, e.g. a
    // file about to be created), then canonicalize what does exist.
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            std::path::Component::ParentDir => {
                normalized.pop();
            }
            std::path::Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let resolved = normalized
        .canonicalize()
        .unwrap_or(normalized);

    if resolved.starts_with(&canonical_root) {
        Some(resolved)
    } else {
        None
    }
}

/// Allow/Ask/Deny decisions per operation, an approval queue, and
/// session/pattern pre-approvals.
pub struct PermissionEngine {
    mode: PermissionMode,
    /// Active root for WORKSPACE/PROJECT mode path checks.
    root: PathBuf,
    /// Operations that require approval even when the mode would otherwise
    /// ALLOW (the `security.require_approval` configuration set).
    require_approval: HashSet<String>,
    /// Read-only shell commands allowed in READ_ONLY mode.
    read_only_allowlist: HashSet<String>,
    pending: Mutex<HashMap<String, PermissionRequest>>,
    /// `(agent_id, operation, resource)` pairs approved for the rest of the
    /// session, or glob patterns approved for the rest of the session.
    session_approvals: Mutex<HashSet<(String, String, String)>>,
    pattern_approvals: Mutex<HashSet<(String, String)>>,
    /// Deny decisions are monotonic per session; tracks operations that have
    /// already been denied so a later ASK cannot be silently re-allowed
    /// without an explicit config reload.
    session_denials: Mutex<HashSet<(String, String, String)>>,
    default_ttl: Duration,
}

impl PermissionEngine {
    pub fn new(mode: PermissionMode, root: impl Into<PathBuf>) -> Self {
        PermissionEngine {
            mode,
            root: root.into(),
            require_approval: HashSet::new(),
            read_only_allowlist: HashSet::new(),
            pending: Mutex::new(HashMap::new()),
            session_approvals: Mutex::new(HashSet::new()),
            pattern_approvals: Mutex::new(HashSet::new()),
            session_denials: Mutex::new(HashSet::new()),
            default_ttl: Duration::minutes(5),
        }
    }

    pub fn with_require_approval(mut self, operations: impl IntoIterator<Item = String>) -> Self {
        self.require_approval.extend(operations);
        self
    }

    pub fn with_read_only_allowlist(mut self, commands: impl IntoIterator<Item = String>) -> Self {
        self.read_only_allowlist.extend(commands);
        self
    }

    /// `check(operation, resource, agent_id) -> ALLOW | ASK | DENY` with a
    /// human-readable rationale.
    pub fn check(&self, operation: &str, resource: &str, agent_id: &str) -> (Decision, String) {
        let key = (agent_id.to_string(), operation.to_string(), resource.to_string());

        if self.session_denials.lock().unwrap().contains(&key) {
            return (Decision::Deny, "operation previously denied this session".into());
        }
        if self.session_approvals.lock().unwrap().contains(&key) {
            return (Decision::Allow, "pre-approved for this session".into());
        }
        if self.matches_pattern_approval(agent_id, resource) {
            return (Decision::Allow, "matches a pre-approved pattern".into());
        }

        let resource_path = Path::new(resource);
        let within_root = normalize_within_root(&self.root, resource_path).is_some();

        match self.mode {
            PermissionMode::ReadOnly => {
                if is_read_class(operation) {
                    (Decision::Allow, "read-class operation in READ_ONLY mode".into())
                } else if operation == "shell" && self.read_only_allowlist.contains(resource) {
                    (Decision::Allow, "allowlisted read-only shell command".into())
                } else {
                    (Decision::Deny, "READ_ONLY mode permits only read-class operations".into())
                }
            }
            PermissionMode::Workspace | PermissionMode::Project => {
                if !within_root {
                    return (Decision::Deny, "resource escapes the active root".into());
                }
                if self.require_approval.contains(operation) {
                    (Decision::Ask, "operation requires explicit approval".into())
                } else if is_read_class(operation) || operation.starts_with("write") {
                    (Decision::Allow, "operation within the active root".into())
                } else {
                    (Decision::Ask, "operation not classified as read or write".into())
                }
            }
            PermissionMode::Full => (Decision::Allow, "FULL mode (yolo override)".into()),
        }
    }

    fn matches_pattern_approval(&self, agent_id: &str, resource: &str) -> bool {
        self.pattern_approvals
            .lock()
            .unwrap()
            .iter()
            .any(|(a, pattern)| a == agent_id && glob_match(pattern, resource))
    }

    /// Creates a PermissionRequest for an ASK decision, with a TTL default of
    /// 5 minutes. Returns the request id.
    pub fn request_approval(&self, operation: &str, resource: &str, agent_id: &str, scope: PermissionScope) -> String {
        let request = PermissionRequest {
            id: Uuid::new_v4().to_string(),
            operation: operation.to_string(),
            resource: resource.to_string(),
            agent_id: agent_id.to_string(),
            scope,
            status: PermissionStatus::Pending,
            created_at: Utc::now(),
            ttl: self.default_ttl,
        };
        let id = request.id.clone();
        self.pending.lock().unwrap().insert(id.clone(), request);
        id
    }

    pub fn get_pending(&self, id: &str) -> Option<PermissionRequest> {
        let mut pending = self.pending.lock().unwrap();
        if let Some(request) = pending.get_mut(id) {
            if request.status == PermissionStatus::Pending && request.is_expired(Utc::now()) {
                request.status = PermissionStatus::Expired;
            }
            Some(request.clone())
        } else {
            None
        }
    }

    pub fn list_pending(&self) -> Vec<PermissionRequest> {
        self.pending.lock().unwrap().values().cloned().collect()
    }

    /// Resolves a pending request. A request in `pending` transitions to
    /// exactly one terminal state; expired requests resolve as DENY
    /// regardless of what the caller asks for.
    pub fn approve(&self, id: &str, scope: PermissionScope) -> bool {
        self.resolve(id, PermissionStatus::Approved, Some(scope))
    }

    pub fn deny(&self, id: &str) -> bool {
        self.resolve(id, PermissionStatus::Denied, None)
    }

    fn resolve(&self, id: &str, outcome: PermissionStatus, scope_override: Option<PermissionScope>) -> bool {
        let mut pending = self.pending.lock().unwrap();
        let Some(request) = pending.get_mut(id) else { return false };

        if request.status != PermissionStatus::Pending {
            return false;
        }
        if request.is_expired(Utc::now()) {
            request.status = PermissionStatus::Expired;
            self.session_denials.lock().unwrap().insert((
                request.agent_id.clone(),
                request.operation.clone(),
                request.resource.clone(),
            ));
            return false;
        }

        let scope = scope_override.unwrap_or(request.scope);
        request.status = outcome;

        match outcome {
            PermissionStatus::Approved => match scope {
                PermissionScope::Once => {}
                PermissionScope::Session => {
                    self.session_approvals.lock().unwrap().insert((
                        request.agent_id.clone(),
                        request.operation.clone(),
                        request.resource.clone(),
                    ));
                }
                PermissionScope::Pattern => {
                    self.pattern_approvals
                        .lock()
                        .unwrap()
                        .insert((request.agent_id.clone(), request.resource.clone()));
                }
            },
            PermissionStatus::Denied => {
                self.session_denials.lock().unwrap().insert((
                    request.agent_id.clone(),
                    request.operation.clone(),
                    request.resource.clone(),
                ));
            }
            _ => {}
        }
        true
    }

    /// Polls `id` until it leaves the `Pending` state, then returns the
    /// terminal status. Used by the Iteration Engine to suspend an agent's own
    /// loop on an ASK decision without blocking any other agent's task.
    pub async fn wait_for_resolution(&self, id: &str, poll_interval: std::time::Duration) -> PermissionStatus {
        loop {
            match self.get_pending(id) {
                Some(request) if request.status == PermissionStatus::Pending => {
                    tokio::time::sleep(poll_interval).await;
                }
                Some(request) => return request.status,
                None => return PermissionStatus::Denied,
            }
        }
    }

    /// Pre-approves a glob pattern for `agent_id` ahead of any request.
    pub fn pre_approve_pattern(&self, agent_id: &str, pattern: &str) {
        self.pattern_approvals
            .lock()
            .unwrap()
            .insert((agent_id.to_string(), pattern.to_string()));
    }

    /// `parent ∩ child_profile`: intersects this engine's mode/require-approval
    /// set with a child's requested profile. The narrower mode always wins;
    /// escalation past the parent's mode is impossible.
    pub fn intersect_for_child(&self, child_mode: PermissionMode) -> PermissionMode {
        narrower_mode(self.mode, child_mode)
    }
}

fn narrower_mode(a: PermissionMode, b: PermissionMode) -> PermissionMode {
    fn rank(m: PermissionMode) -> u8 {
        match m {
            PermissionMode::ReadOnly => 0,
            PermissionMode::Workspace => 1,
            PermissionMode::Project => 1,
            PermissionMode::Full => 2,
        }
    }
    if rank(a) <= rank(b) { a } else { b }
}

/// Minimal glob matcher supporting a single trailing `*` wildcard, sufficient
/// for pattern-scoped pre-approvals like `build/**` or `*.log`.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        candidate.starts_with(prefix)
    } else {
        pattern == candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_mode_allows_read_class_operations() {
        let engine = PermissionEngine::new(PermissionMode::ReadOnly, "/workspace");
        let (decision, _) = engine.check("read", "/workspace/file.txt", "agent-1");
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn read_only_mode_denies_writes() {
        let engine = PermissionEngine::new(PermissionMode::ReadOnly, "/workspace");
        let (decision, _) = engine.check("write", "/workspace/file.txt", "agent-1");
        assert_eq!(decision, Decision::Deny);
    }

    #[test]
    fn workspace_mode_asks_for_required_approval_operations() {
        let engine = PermissionEngine::new(PermissionMode::Workspace, std::env::temp_dir())
            .with_require_approval(["file_delete".to_string()]);
        let (decision, _) = engine.check("file_delete", std::env::temp_dir().to_str().unwrap(), "agent-1");
        assert_eq!(decision, Decision::Ask);
    }

    #[test]
    fn approval_flow_allows_once_then_requires_new_request() {
        let engine = PermissionEngine::new(PermissionMode::Workspace, "/workspace");
        let id = engine.request_approval("file_delete", "/workspace/build", "agent-1", PermissionScope::Once);
        assert!(engine.approve(&id, PermissionScope::Once));
        // A second resolve attempt on the same id fails: pending -> terminal exactly once.
        assert!(!engine.approve(&id, PermissionScope::Once));
    }

    #[test]
    fn session_scoped_approval_is_remembered() {
        let engine = PermissionEngine::new(PermissionMode::Workspace, "/workspace");
        let id = engine.request_approval("file_delete", "/workspace/build", "agent-1", PermissionScope::Session);
        engine.approve(&id, PermissionScope::Session);
        let (decision, _) = engine.check("file_delete", "/workspace/build", "agent-1");
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn expired_request_resolves_deny() {
        let mut engine = PermissionEngine::new(PermissionMode::Workspace, "/workspace");
        engine.default_ttl = Duration::seconds(-1); // already expired
        let id = engine.request_approval("file_delete", "/workspace/build", "agent-1", PermissionScope::Once);
        assert!(!engine.approve(&id, PermissionScope::Once));
        let request = engine.get_pending(&id).unwrap();
        assert_eq!(request.status, PermissionStatus::Expired);
    }

    #[test]
    fn child_permissions_never_escalate_past_parent() {
        let engine = PermissionEngine::new(PermissionMode::ReadOnly, "/workspace");
        let effective = engine.intersect_for_child(PermissionMode::Full);
        assert_eq!(effective, PermissionMode::ReadOnly);
    }

    #[test]
    fn path_traversal_outside_root_is_denied() {
        let engine = PermissionEngine::new(PermissionMode::Workspace, "/workspace");
        let (decision, _) = engine.check("write", "/workspace/../../etc/passwd", "agent-1");
        assert_eq!(decision, Decision::Deny);
    }

    #[tokio::test]
    async fn wait_for_resolution_returns_once_approved() {
        let engine = std::sync::Arc::new(PermissionEngine::new(PermissionMode::Workspace, "/workspace"));
        let id = engine.request_approval("file_delete", "/workspace/build", "agent-1", PermissionScope::Once);

        let waiter_engine = engine.clone();
        let waiter_id = id.clone();
        let waiter = tokio::spawn(async move {
            waiter_engine.wait_for_resolution(&waiter_id, std::time::Duration::from_millis(5)).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        engine.approve(&id, PermissionScope::Once);

        assert_eq!(waiter.await.unwrap(), PermissionStatus::Approved);
    }
}
