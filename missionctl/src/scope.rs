//! Scoped capability guard.
//!
//! A worker reaches the system of record through a [`ScopedToolbox`]. While a
//! task's repository is bound to the worker's [`RepoScope`], every destructive
//! tool call targeting another `owner/repo` is refused with a structured
//! message instead of executing. With no scope bound, calls pass through.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::io::github::SystemOfRecord;
use crate::io::pr_check::split_repo;

/// Tools that mutate a specific `owner/repo`.
pub const DESTRUCTIVE_TOOLS: [&str; 5] = [
    "create_pull_request",
    "push_files",
    "create_or_update_file",
    "create_branch",
    "create_repository",
];

pub fn is_destructive(tool: &str) -> bool {
    DESTRUCTIVE_TOOLS.contains(&tool)
}

/// Lower-cased `owner/repo` pair a scope is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoTarget {
    pub owner: String,
    pub repo: String,
}

impl RepoTarget {
    /// Parse `owner/repo`; anything else means "no scope".
    pub fn parse(raw: &str) -> Option<Self> {
        let (owner, repo) = split_repo(raw.trim())?;
        Some(Self {
            owner: owner.to_lowercase(),
            repo: repo.to_lowercase(),
        })
    }

    fn matches(&self, owner: &str, repo: &str) -> bool {
        self.owner == owner.to_lowercase() && self.repo == repo.to_lowercase()
    }
}

#[derive(Debug, Default)]
struct ScopeState {
    /// Scope set without a guard; visible when no binding is live.
    base: Option<RepoTarget>,
    /// Live bindings, innermost last.
    bindings: Vec<(u64, Option<RepoTarget>)>,
    next_id: u64,
}

impl ScopeState {
    fn target(&self) -> Option<&RepoTarget> {
        match self.bindings.last() {
            Some((_, target)) => target.as_ref(),
            None => self.base.as_ref(),
        }
    }
}

/// Per-worker scope slot shared between the execution loop and the toolbox.
#[derive(Debug, Clone, Default)]
pub struct RepoScope {
    state: Arc<Mutex<ScopeState>>,
}

impl RepoScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        // Scope state stays consistent across a panicking holder.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set or clear the scope without a release guard. Live bindings are
    /// discarded; their later release is a no-op.
    pub fn set_scope(&self, target: Option<RepoTarget>) {
        let mut state = self.lock();
        if let Some(t) = &target {
            info!(owner = %t.owner, repo = %t.repo, "repo scope set");
        }
        state.bindings.clear();
        state.base = target;
    }

    pub fn current(&self) -> Option<RepoTarget> {
        self.lock().target().cloned()
    }

    /// Bind `target` until the returned binding drops. Bindings may be
    /// released in any order; the innermost live one decides the scope.
    pub fn bind(&self, target: Option<RepoTarget>) -> ScopeBinding {
        let mut state = self.lock();
        if let Some(t) = &target {
            info!(owner = %t.owner, repo = %t.repo, "repo scope bound");
        }
        state.next_id += 1;
        let id = state.next_id;
        state.bindings.push((id, target));
        ScopeBinding {
            scope: self.clone(),
            id,
        }
    }
}

/// Release guard returned by [`RepoScope::bind`].
#[must_use = "the scope is released when the binding drops"]
pub struct ScopeBinding {
    scope: RepoScope,
    id: u64,
}

impl Drop for ScopeBinding {
    fn drop(&mut self) {
        let mut state = self.scope.lock();
        if let Some(pos) = state.bindings.iter().position(|(id, _)| *id == self.id) {
            state.bindings.remove(pos);
            debug!("repo scope released");
        }
    }
}

/// One tool invocation requested by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    pub owner: String,
    pub repo: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(tool: &str, owner: &str, repo: &str, args: Value) -> Self {
        Self {
            tool: tool.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Done(Value),
    /// The call was not executed; the message is returned to the worker.
    Refused(String),
}

#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, call: &ToolCall) -> Result<Value>;
}

pub fn refusal_message(tool: &str, owner: &str, repo: &str, allowed: &RepoTarget) -> String {
    format!(
        "BLOCKED: {tool} targeted {}/{} but this task's allowed repository is {}/{}. \
         Re-run the tool with owner='{}' and repo='{}'.",
        owner.to_lowercase(),
        repo.to_lowercase(),
        allowed.owner,
        allowed.repo,
        allowed.owner,
        allowed.repo,
    )
}

/// Tools handed to a worker, with destructive ones checked against the scope.
#[derive(Clone)]
pub struct ScopedToolbox {
    scope: RepoScope,
    tools: BTreeMap<String, Arc<dyn Capability>>,
}

impl ScopedToolbox {
    pub fn new(scope: RepoScope) -> Self {
        Self {
            scope,
            tools: BTreeMap::new(),
        }
    }

    /// Toolbox exposing the system-of-record tools.
    pub fn with_system_of_record(scope: RepoScope, sor: Arc<dyn SystemOfRecord>) -> Self {
        let mut toolbox = Self::new(scope);
        for kind in RecordTool::ALL {
            toolbox.register(
                kind.name(),
                Arc::new(RecordCapability {
                    sor: sor.clone(),
                    kind,
                }),
            );
        }
        toolbox
    }

    pub fn register(&mut self, name: &str, capability: Arc<dyn Capability>) {
        self.tools.insert(name.to_string(), capability);
    }

    pub fn scope(&self) -> &RepoScope {
        &self.scope
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Execute `call` unless it targets a repository outside the active scope.
    pub async fn call(&self, call: &ToolCall) -> Result<ToolOutcome> {
        let capability = self
            .tools
            .get(&call.tool)
            .ok_or_else(|| anyhow!("unknown tool '{}'", call.tool))?;
        if is_destructive(&call.tool)
            && !call.owner.is_empty()
            && !call.repo.is_empty()
            && let Some(allowed) = self.scope.current()
            && !allowed.matches(&call.owner, &call.repo)
        {
            let message = refusal_message(&call.tool, &call.owner, &call.repo, &allowed);
            warn!(tool = %call.tool, "{message}");
            return Ok(ToolOutcome::Refused(message));
        }
        let value = capability
            .invoke(call)
            .await
            .with_context(|| format!("tool {}", call.tool))?;
        Ok(ToolOutcome::Done(value))
    }
}

#[derive(Debug, Clone, Copy)]
enum RecordTool {
    CreatePullRequest,
    PushFiles,
    CreateOrUpdateFile,
    CreateBranch,
    CreateRepository,
    GetFileContents,
}

impl RecordTool {
    const ALL: [RecordTool; 6] = [
        RecordTool::CreatePullRequest,
        RecordTool::PushFiles,
        RecordTool::CreateOrUpdateFile,
        RecordTool::CreateBranch,
        RecordTool::CreateRepository,
        RecordTool::GetFileContents,
    ];

    fn name(self) -> &'static str {
        match self {
            RecordTool::CreatePullRequest => "create_pull_request",
            RecordTool::PushFiles => "push_files",
            RecordTool::CreateOrUpdateFile => "create_or_update_file",
            RecordTool::CreateBranch => "create_branch",
            RecordTool::CreateRepository => "create_repository",
            RecordTool::GetFileContents => "get_file_contents",
        }
    }
}

#[derive(Deserialize)]
struct PullArgs {
    head: String,
    #[serde(default = "default_base")]
    base: String,
    title: String,
}

#[derive(Deserialize)]
struct FileArgs {
    path: String,
    content: String,
    branch: String,
    message: String,
}

#[derive(Deserialize)]
struct PushedFile {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct PushArgs {
    branch: String,
    message: String,
    files: Vec<PushedFile>,
}

#[derive(Deserialize)]
struct BranchArgs {
    branch: String,
    #[serde(default = "default_base")]
    from_branch: String,
}

#[derive(Deserialize)]
struct ReadArgs {
    path: String,
    #[serde(default = "default_base", rename = "ref")]
    git_ref: String,
}

fn default_base() -> String {
    "main".to_string()
}

fn parse_args<T: for<'de> Deserialize<'de>>(call: &ToolCall) -> Result<T> {
    serde_json::from_value(call.args.clone())
        .with_context(|| format!("invalid arguments for {}", call.tool))
}

struct RecordCapability {
    sor: Arc<dyn SystemOfRecord>,
    kind: RecordTool,
}

#[async_trait]
impl Capability for RecordCapability {
    async fn invoke(&self, call: &ToolCall) -> Result<Value> {
        let repo = format!("{}/{}", call.owner, call.repo);
        match self.kind {
            RecordTool::CreatePullRequest => {
                let args: PullArgs = parse_args(call)?;
                let url = self
                    .sor
                    .create_change_request(&repo, &args.head, &args.base, &args.title)
                    .await?;
                Ok(json!({ "created": url.is_some(), "url": url }))
            }
            RecordTool::PushFiles => {
                let args: PushArgs = parse_args(call)?;
                let mut written = 0;
                for file in &args.files {
                    if self
                        .sor
                        .put_file(&repo, &file.path, &args.branch, &file.content, &args.message)
                        .await?
                    {
                        written += 1;
                    }
                }
                Ok(json!({ "written": written }))
            }
            RecordTool::CreateOrUpdateFile => {
                let args: FileArgs = parse_args(call)?;
                let ok = self
                    .sor
                    .put_file(&repo, &args.path, &args.branch, &args.content, &args.message)
                    .await?;
                Ok(json!({ "committed": ok }))
            }
            RecordTool::CreateBranch => {
                let args: BranchArgs = parse_args(call)?;
                let ok = self
                    .sor
                    .create_branch(&repo, &args.branch, &args.from_branch)
                    .await?;
                Ok(json!({ "created": ok }))
            }
            RecordTool::CreateRepository => {
                if call.owner.is_empty() || call.repo.is_empty() {
                    bail!("create_repository needs owner and repo");
                }
                let ok = self.sor.create_repository(&call.owner, &call.repo).await?;
                Ok(json!({ "created": ok }))
            }
            RecordTool::GetFileContents => {
                let args: ReadArgs = parse_args(call)?;
                let content = self.sor.read_file(&repo, &args.path, &args.git_ref).await?;
                Ok(json!({ "content": content }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRecord;

    fn toolbox(sor: Arc<FakeRecord>) -> ScopedToolbox {
        ScopedToolbox::with_system_of_record(RepoScope::new(), sor)
    }

    fn file_call(owner: &str, repo: &str) -> ToolCall {
        ToolCall::new(
            "create_or_update_file",
            owner,
            repo,
            json!({"path": "a.md", "content": "x", "branch": "main", "message": "m"}),
        )
    }

    #[tokio::test]
    async fn mismatched_destructive_call_is_refused_without_executing() {
        let sor = Arc::new(FakeRecord::new());
        let tools = toolbox(sor.clone());
        let _binding = tools.scope().bind(RepoTarget::parse("acme/app"));
        let outcome = tools.call(&file_call("evil", "app")).await.expect("call");
        let message = match outcome {
            ToolOutcome::Refused(message) => message,
            other => panic!("expected refusal, got {other:?}"),
        };
        assert!(message.starts_with("BLOCKED: create_or_update_file targeted evil/app"));
        assert!(message.contains("owner='acme' and repo='app'"));
        assert_eq!(sor.file_writes(), 0);
    }

    #[tokio::test]
    async fn matching_call_is_case_insensitive() {
        let sor = Arc::new(FakeRecord::new());
        let tools = toolbox(sor.clone());
        let _binding = tools.scope().bind(RepoTarget::parse("Acme/App"));
        let outcome = tools.call(&file_call("ACME", "app")).await.expect("call");
        assert!(matches!(outcome, ToolOutcome::Done(_)));
        assert_eq!(sor.file_writes(), 1);
    }

    #[tokio::test]
    async fn no_scope_passes_through() {
        let sor = Arc::new(FakeRecord::new());
        let tools = toolbox(sor.clone());
        let outcome = tools.call(&file_call("evil", "app")).await.expect("call");
        assert!(matches!(outcome, ToolOutcome::Done(_)));
        assert_eq!(sor.file_writes(), 1);
    }

    #[tokio::test]
    async fn read_only_tools_ignore_scope() {
        let sor = Arc::new(FakeRecord::new());
        sor.add_file("other/lib", "README.md", "hello");
        let tools = toolbox(sor);
        let _binding = tools.scope().bind(RepoTarget::parse("acme/app"));
        let call = ToolCall::new("get_file_contents", "other", "lib", json!({"path": "README.md"}));
        let outcome = tools.call(&call).await.expect("call");
        assert_eq!(outcome, ToolOutcome::Done(json!({"content": "hello"})));
    }

    #[test]
    fn binding_releases_on_drop_and_restores_outer_scope() {
        let scope = RepoScope::new();
        {
            let _outer = scope.bind(RepoTarget::parse("acme/app"));
            {
                let _inner = scope.bind(RepoTarget::parse("acme/other"));
                assert_eq!(scope.current().map(|t| t.repo), Some("other".to_string()));
            }
            assert_eq!(scope.current().map(|t| t.repo), Some("app".to_string()));
        }
        assert_eq!(scope.current(), None);
    }

    #[test]
    fn bindings_released_out_of_order_leave_no_scope() {
        let scope = RepoScope::new();
        let outer = scope.bind(RepoTarget::parse("acme/app"));
        let inner = scope.bind(RepoTarget::parse("acme/other"));
        drop(outer);
        assert_eq!(scope.current().map(|t| t.repo), Some("other".to_string()));
        drop(inner);
        assert_eq!(scope.current(), None);
    }

    #[test]
    fn set_scope_supersedes_live_bindings() {
        let scope = RepoScope::new();
        let binding = scope.bind(RepoTarget::parse("acme/app"));
        scope.set_scope(RepoTarget::parse("acme/site"));
        drop(binding);
        assert_eq!(scope.current().map(|t| t.repo), Some("site".to_string()));
        scope.set_scope(None);
        assert_eq!(scope.current(), None);
    }

    #[test]
    fn binding_releases_when_holder_panics() {
        let scope = RepoScope::new();
        let inner = scope.clone();
        let result = std::panic::catch_unwind(move || {
            let _binding = inner.bind(RepoTarget::parse("acme/app"));
            panic!("worker crashed");
        });
        assert!(result.is_err());
        assert_eq!(scope.current(), None);
    }

    #[test]
    fn scopes_are_independent_per_worker() {
        let a = RepoScope::new();
        let b = RepoScope::new();
        let _binding = a.bind(RepoTarget::parse("acme/app"));
        assert!(a.current().is_some());
        assert_eq!(b.current(), None);
    }

    #[test]
    fn malformed_repository_means_no_scope() {
        assert_eq!(RepoTarget::parse("acme"), None);
        assert_eq!(
            RepoTarget::parse(" Acme/App "),
            Some(RepoTarget {
                owner: "acme".to_string(),
                repo: "app".to_string()
            })
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let tools = toolbox(Arc::new(FakeRecord::new()));
        let call = ToolCall::new("delete_everything", "acme", "app", json!({}));
        assert!(tools.call(&call).await.is_err());
    }
}
