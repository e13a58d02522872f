//! Fakes and fixtures shared by unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::core::types::{ActivityKind, AgentBinding, Task, TaskId};
use crate::core::validate::KnownNames;
use crate::io::actions::ActionRegistry;
use crate::io::alerts::AlertSink;
use crate::io::config::{MonitorConfig, SearchConfig};
use crate::io::github::{ChangeRequest, SystemOfRecord};
use crate::io::guards::{Guard, GuardContext, GuardRegistry};
use crate::io::learning::{Learning, LearningSink, TransitionEvent};
use crate::io::prompt::PromptLibrary;
use crate::io::store::{MemoryStore, TaskStore};
use crate::io::worker::{Worker, WorkerReply};
use crate::io::workflow::{WorkflowLoader, Workflows};
use crate::monitor::GuardBlockMonitor;
use crate::scope::{RepoScope, RepoTarget, ScopedToolbox};
use crate::step::{ExecuteOutcome, MissionRunner, WorkerHandle};

/// The pipeline document shipped with the crate.
pub const SAMPLE_WORKFLOWS: &str = include_str!("../workflows.toml");

/// Guard and action names registered by the built-in registries.
pub fn known_names() -> KnownNames {
    let sor: Arc<dyn SystemOfRecord> = Arc::new(FakeRecord::new());
    KnownNames {
        guards: GuardRegistry::with_builtins(sor.clone()).names(),
        actions: ActionRegistry::with_builtins(sor, SearchConfig::default())
            .expect("action registry")
            .names(),
    }
}

#[derive(Debug, Clone)]
struct FakePull {
    number: u64,
    repo: String,
    branch: String,
    url: String,
    changed_files: u64,
}

#[derive(Default)]
struct RecordState {
    fail_listing: bool,
    accept_pulls: bool,
    pulls: Vec<FakePull>,
    branches: BTreeSet<(String, String)>,
    files: BTreeMap<(String, String), String>,
    commit_messages: BTreeMap<(String, String), String>,
    list_calls: usize,
    file_writes: usize,
    created_branches: Vec<(String, String)>,
    created_pulls: Vec<(String, String)>,
    created_repos: Vec<String>,
}

/// In-memory system of record. Files ignore branches.
pub struct FakeRecord {
    credential: bool,
    state: Mutex<RecordState>,
}

impl FakeRecord {
    pub fn new() -> Self {
        Self {
            credential: true,
            state: Mutex::new(RecordState::default()),
        }
    }

    pub fn without_credential() -> Self {
        Self {
            credential: false,
            ..Self::new()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RecordState> {
        self.state.lock().expect("fake record lock")
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state().fail_listing = fail;
    }

    /// Whether `create_change_request` succeeds; rejected by default.
    pub fn accept_pull_creation(&self, accept: bool) {
        self.state().accept_pulls = accept;
    }

    pub fn add_pull(&self, repo: &str, branch: &str) -> u64 {
        let mut state = self.state();
        let number = state.pulls.len() as u64 + 1;
        state.pulls.push(FakePull {
            number,
            repo: repo.to_string(),
            branch: branch.to_string(),
            url: format!("https://example.test/{repo}/pull/{number}"),
            changed_files: 0,
        });
        number
    }

    pub fn set_changed_files(&self, number: u64, changed: u64) {
        if let Some(pull) = self.state().pulls.iter_mut().find(|p| p.number == number) {
            pull.changed_files = changed;
        }
    }

    pub fn add_branch(&self, repo: &str, branch: &str) {
        self.state()
            .branches
            .insert((repo.to_string(), branch.to_string()));
    }

    pub fn add_file(&self, repo: &str, path: &str, content: &str) {
        self.state()
            .files
            .insert((repo.to_string(), path.to_string()), content.to_string());
    }

    pub fn set_commit_message(&self, repo: &str, path: &str, message: &str) {
        self.state()
            .commit_messages
            .insert((repo.to_string(), path.to_string()), message.to_string());
    }

    pub fn file(&self, repo: &str, path: &str) -> Option<String> {
        self.state()
            .files
            .get(&(repo.to_string(), path.to_string()))
            .cloned()
    }

    pub fn file_writes(&self) -> usize {
        self.state().file_writes
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub fn created_branches(&self) -> Vec<(String, String)> {
        self.state().created_branches.clone()
    }

    /// `(repo, head)` of every change request opened through the API.
    pub fn created_pulls(&self) -> Vec<(String, String)> {
        self.state().created_pulls.clone()
    }

    pub fn created_repos(&self) -> Vec<String> {
        self.state().created_repos.clone()
    }
}

impl Default for FakeRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemOfRecord for FakeRecord {
    fn has_credential(&self) -> bool {
        self.credential
    }

    async fn list_open_change_requests(&self, repo: &str) -> Result<Vec<ChangeRequest>> {
        let mut state = self.state();
        state.list_calls += 1;
        if state.fail_listing {
            bail!("listing unavailable");
        }
        Ok(state
            .pulls
            .iter()
            .filter(|p| p.repo == repo)
            .map(|p| ChangeRequest {
                number: p.number,
                source_branch: p.branch.clone(),
                url: Some(p.url.clone()),
            })
            .collect())
    }

    async fn create_change_request(
        &self,
        repo: &str,
        head: &str,
        _base: &str,
        _title: &str,
    ) -> Result<Option<String>> {
        if !self.state().accept_pulls {
            return Ok(None);
        }
        let number = self.add_pull(repo, head);
        let mut state = self.state();
        state
            .created_pulls
            .push((repo.to_string(), head.to_string()));
        Ok(Some(format!("https://example.test/{repo}/pull/{number}")))
    }

    async fn changed_files(&self, repo: &str, number: u64) -> Result<u64> {
        self.state()
            .pulls
            .iter()
            .find(|p| p.repo == repo && p.number == number)
            .map(|p| p.changed_files)
            .ok_or_else(|| anyhow!("no pull #{number} in {repo}"))
    }

    async fn branch_exists(&self, repo: &str, branch: &str) -> Result<bool> {
        Ok(self
            .state()
            .branches
            .contains(&(repo.to_string(), branch.to_string())))
    }

    async fn create_branch(&self, repo: &str, branch: &str, base: &str) -> Result<bool> {
        let mut state = self.state();
        if !state
            .branches
            .contains(&(repo.to_string(), base.to_string()))
        {
            return Ok(false);
        }
        state
            .branches
            .insert((repo.to_string(), branch.to_string()));
        state
            .created_branches
            .push((repo.to_string(), branch.to_string()));
        Ok(true)
    }

    async fn read_file(&self, repo: &str, path: &str, _git_ref: &str) -> Result<Option<String>> {
        Ok(self.file(repo, path))
    }

    async fn put_file(
        &self,
        repo: &str,
        path: &str,
        _branch: &str,
        content: &str,
        message: &str,
    ) -> Result<bool> {
        let mut state = self.state();
        let key = (repo.to_string(), path.to_string());
        state.files.insert(key.clone(), content.to_string());
        state.commit_messages.insert(key, message.to_string());
        state.file_writes += 1;
        Ok(true)
    }

    async fn list_directory(&self, repo: &str, path: &str) -> Result<Vec<String>> {
        let folder = path.trim_end_matches('/');
        Ok(self
            .state()
            .files
            .keys()
            .filter(|(r, _)| r == repo)
            .filter_map(|(_, p)| {
                let (parent, name) = p.rsplit_once('/')?;
                (parent == folder).then(|| name.to_string())
            })
            .collect())
    }

    async fn latest_commit_message(&self, repo: &str, path: &str) -> Result<Option<String>> {
        Ok(self
            .state()
            .commit_messages
            .get(&(repo.to_string(), path.to_string()))
            .cloned())
    }

    async fn create_repository(&self, owner: &str, name: &str) -> Result<bool> {
        self.state().created_repos.push(format!("{owner}/{name}"));
        Ok(true)
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Reply(WorkerReply),
    Fail(String),
}

/// Worker that plays back queued replies, then a fallback forever.
pub struct ScriptedWorker {
    queue: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
    scopes: Mutex<Vec<Option<RepoTarget>>>,
}

impl ScriptedWorker {
    fn with_fallback(fallback: Scripted) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            prompts: Mutex::new(Vec::new()),
            scopes: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::with_fallback(Scripted::Reply(WorkerReply::ok(text)))
    }

    pub fn failing(message: &str) -> Self {
        Self::with_fallback(Scripted::Fail(message.to_string()))
    }

    /// Queue one reply ahead of the fallback.
    pub fn then_reply(self, text: &str) -> Self {
        self.queue
            .lock()
            .expect("script lock")
            .push_back(Scripted::Reply(WorkerReply::ok(text)));
        self
    }

    pub fn then_fail(self, message: &str) -> Self {
        self.queue
            .lock()
            .expect("script lock")
            .push_back(Scripted::Fail(message.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    /// Scope bound on the toolbox while each call ran.
    pub fn scopes(&self) -> Vec<Option<RepoTarget>> {
        self.scopes.lock().expect("scopes lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().expect("prompts lock").len()
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn run(
        &self,
        prompt: &str,
        _identity: &str,
        tools: &ScopedToolbox,
    ) -> Result<WorkerReply> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        self.scopes
            .lock()
            .expect("scopes lock")
            .push(tools.scope().current());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .queue
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match next {
            Scripted::Reply(reply) => Ok(reply),
            Scripted::Fail(message) => Err(anyhow!(message)),
        }
    }
}

/// Alert sink that keeps every notification.
#[derive(Default)]
pub struct RecordingAlerts {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingAlerts {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("alerts lock").clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn notify(&self, title: &str, body: &str) -> Result<()> {
        self.sent
            .lock()
            .expect("alerts lock")
            .push((title.to_string(), body.to_string()));
        Ok(())
    }
}

/// Learning sink that keeps transition and error events.
#[derive(Default)]
pub struct RecordingLearning {
    transitions: Mutex<Vec<TransitionEvent>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingLearning {
    pub fn transitions(&self) -> Vec<TransitionEvent> {
        self.transitions.lock().expect("learning lock").clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().expect("learning lock").clone()
    }
}

#[async_trait]
impl LearningSink for RecordingLearning {
    async fn capture_transition(&self, event: &TransitionEvent) -> Result<()> {
        self.transitions
            .lock()
            .expect("learning lock")
            .push(event.clone());
        Ok(())
    }

    async fn capture_error(
        &self,
        _worker: &str,
        _mission_type: &str,
        _task_id: &TaskId,
        error: &str,
    ) -> Result<()> {
        self.errors
            .lock()
            .expect("learning lock")
            .push(error.to_string());
        Ok(())
    }

    async fn learned_context(&self, _mission_type: &str, _query: &str) -> Result<String> {
        Ok(String::new())
    }
}

/// Guard with a fixed answer that counts its evaluations.
struct CountingGuard {
    name: String,
    pass: bool,
    calls: Arc<Mutex<BTreeMap<String, usize>>>,
}

#[async_trait]
impl Guard for CountingGuard {
    async fn check(&self, _ctx: &GuardContext) -> Result<bool> {
        *self
            .calls
            .lock()
            .expect("guard calls lock")
            .entry(self.name.clone())
            .or_default() += 1;
        Ok(self.pass)
    }
}

/// A complete execution loop over in-memory collaborators.
pub struct Harness {
    pub sor: Arc<FakeRecord>,
    pub store: Arc<MemoryStore>,
    pub alerts: Arc<RecordingAlerts>,
    pub learning: Arc<RecordingLearning>,
    pub loader: Arc<WorkflowLoader>,
    pub runner: Arc<MissionRunner>,
    guard_calls: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl Harness {
    pub fn new(workflows: &str) -> Self {
        Self::build(workflows, FakeRecord::new(), &[])
    }

    pub fn without_credential(workflows: &str) -> Self {
        Self::build(workflows, FakeRecord::without_credential(), &[])
    }

    /// Built-in guards plus fixed-answer guards that count their calls.
    pub fn with_counting_guards(workflows: &str, guards: &[(&str, bool)]) -> Self {
        Self::build(workflows, FakeRecord::new(), guards)
    }

    fn build(workflows: &str, record: FakeRecord, extra_guards: &[(&str, bool)]) -> Self {
        let sor = Arc::new(record);
        let dyn_sor: Arc<dyn SystemOfRecord> = sor.clone();
        let guard_calls = Arc::new(Mutex::new(BTreeMap::new()));
        let mut guards = GuardRegistry::with_builtins(dyn_sor.clone());
        for (name, pass) in extra_guards {
            guards.register(
                name,
                Arc::new(CountingGuard {
                    name: (*name).to_string(),
                    pass: *pass,
                    calls: guard_calls.clone(),
                }),
            );
        }
        let actions = ActionRegistry::with_builtins(dyn_sor.clone(), SearchConfig::default())
            .expect("action registry");
        let known = KnownNames {
            guards: guards.names(),
            actions: actions.names(),
        };
        let origin = Path::new("workflows.toml");
        let compiled = Workflows::compile(workflows, origin, &known, 15).expect("workflows compile");
        let loader = Arc::new(WorkflowLoader::from_workflows(origin, compiled, known, 15));

        let store = Arc::new(MemoryStore::new());
        let alerts = Arc::new(RecordingAlerts::default());
        let learning = Arc::new(RecordingLearning::default());
        let monitor = Arc::new(GuardBlockMonitor::new(
            &MonitorConfig::default(),
            store.clone(),
            alerts.clone(),
        ));
        let runner = Arc::new(MissionRunner {
            workflows: loader.clone(),
            store: store.clone(),
            guards: Arc::new(guards),
            actions: Arc::new(actions),
            prompts: Arc::new(PromptLibrary::builtin()),
            sor: dyn_sor,
            monitor,
            learning: Learning::new(learning.clone()),
        });
        Self {
            sor,
            store,
            alerts,
            learning,
            loader,
            runner,
            guard_calls,
        }
    }

    pub fn agent(&self, id: &str) -> AgentBinding {
        self.loader
            .snapshot()
            .agent(id)
            .cloned()
            .unwrap_or_else(|| panic!("agent '{id}' is not declared"))
    }

    /// Handle for a declared agent with its own scope and tools.
    pub fn handle(&self, id: &str, worker: Arc<dyn Worker>) -> WorkerHandle {
        WorkerHandle {
            agent: self.agent(id),
            worker,
            tools: ScopedToolbox::with_system_of_record(RepoScope::new(), self.sor.clone()),
        }
    }

    /// Insert a task for `mission` in `status`, assigned to `assignee`.
    pub async fn submit(&self, mission: &str, status: &str, assignee: &str, repo: &str) -> Task {
        let now = Utc::now();
        let mut task = Task::new("Fix login", "Users cannot log in", mission, status, now);
        task.mission_config
            .insert("repository".to_string(), Value::String(repo.to_string()));
        self.store.insert_task(task.clone()).await.expect("insert task");
        self.store
            .assign(&task.id, assignee, now)
            .await
            .expect("assign task");
        task
    }

    pub async fn execute(&self, handle: &WorkerHandle, id: &TaskId) -> ExecuteOutcome {
        self.runner
            .execute(handle, id, None)
            .await
            .expect("execute")
    }

    pub async fn status(&self, id: &TaskId) -> String {
        self.store
            .get_task(id)
            .await
            .expect("get task")
            .expect("task exists")
            .status
    }

    pub async fn activity_kinds(&self, id: &TaskId) -> Vec<ActivityKind> {
        self.store
            .activities(id)
            .await
            .expect("activities")
            .into_iter()
            .map(|a| a.kind)
            .collect()
    }

    pub async fn assignees(&self, id: &TaskId) -> Vec<String> {
        self.store
            .assignments(id)
            .await
            .expect("assignments")
            .into_iter()
            .map(|a| a.worker)
            .collect()
    }

    pub fn guard_calls(&self, name: &str) -> usize {
        self.guard_calls
            .lock()
            .expect("guard calls lock")
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}
