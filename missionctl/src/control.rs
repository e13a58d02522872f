//! Control-plane wiring.
//!
//! Builds every collaborator from a [`ControlConfig`] and exposes the
//! operator commands: run, one-off wake-up, reload, submit and status.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::core::states::{INBOX_STATE, PLACEHOLDER_STATE};
use crate::core::types::{HeartbeatRecord, Task, TaskId};
use crate::core::validate::{Finding, KnownNames};
use crate::heartbeat::WorkerHeartbeat;
use crate::io::actions::ActionRegistry;
use crate::io::alerts::{AlertSink, sink_from_config};
use crate::io::config::ControlConfig;
use crate::io::github::{GitHubClient, SystemOfRecord};
use crate::io::guards::GuardRegistry;
use crate::io::learning::Learning;
use crate::io::prompt::PromptLibrary;
use crate::io::store::{MemoryStore, TaskStore};
use crate::io::worker::{CommandWorker, Worker};
use crate::io::workflow::{LoadError, WorkflowLoader, Workflows};
use crate::monitor::GuardBlockMonitor;
use crate::scheduler::HeartbeatScheduler;
use crate::scope::{RepoScope, ScopedToolbox};
use crate::step::{MissionRunner, WorkerHandle};
use crate::watchdog::Watchdog;

/// A name given on the command line that the workflow document does not declare.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnknownName {
    #[error("unknown mission '{0}'")]
    Mission(String),
    #[error("unknown agent '{0}'")]
    Agent(String),
}

/// Operator request to create a task.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub mission: String,
    pub title: String,
    pub description: String,
    pub status: Option<String>,
    pub assignee: Option<String>,
    /// Raw `key=value` pairs; values that parse as JSON are stored as JSON.
    pub config: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskLine {
    pub id: TaskId,
    pub mission: String,
    pub status: String,
    pub assignee: Option<String>,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub tasks: Vec<TaskLine>,
    pub heartbeats: Vec<HeartbeatRecord>,
    pub next_runs: Vec<(String, DateTime<Utc>)>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "tasks:")?;
        if self.tasks.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for t in &self.tasks {
            writeln!(
                f,
                "  {}  {:<10} {:<14} {:<8} {}",
                t.id.short(),
                t.mission,
                t.status,
                t.assignee.as_deref().unwrap_or("-"),
                t.title
            )?;
        }
        writeln!(f, "heartbeats:")?;
        if self.heartbeats.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for beat in &self.heartbeats {
            writeln!(f, "  {:<8} {}", beat.worker, beat.last_fired_at.to_rfc3339())?;
        }
        writeln!(f, "next runs:")?;
        for (agent, at) in &self.next_runs {
            writeln!(f, "  {agent:<8} {}", at.to_rfc3339())?;
        }
        Ok(())
    }
}

pub struct ControlPlane {
    cfg: ControlConfig,
    runner: Arc<MissionRunner>,
    alerts: Arc<dyn AlertSink>,
    worker: Arc<dyn Worker>,
}

impl ControlPlane {
    pub fn new(
        cfg: ControlConfig,
        runner: Arc<MissionRunner>,
        alerts: Arc<dyn AlertSink>,
        worker: Arc<dyn Worker>,
    ) -> Self {
        Self {
            cfg,
            runner,
            alerts,
            worker,
        }
    }

    /// Wire production collaborators from `cfg`.
    pub fn build(cfg: ControlConfig) -> Result<Self> {
        let token = cfg.github.token();
        if token.is_none() {
            warn!(
                env = %cfg.github.token_env,
                "no system-of-record credential; PR checks fail open and content guards fail closed"
            );
        }
        let sor: Arc<dyn SystemOfRecord> = Arc::new(
            GitHubClient::new(&cfg.github.api_base, token).context("build system-of-record client")?,
        );
        let (guards, actions) = registries(&cfg, sor.clone())?;
        let known = KnownNames {
            guards: guards.names(),
            actions: actions.names(),
        };
        let prompts = PromptLibrary::load(&cfg.prompts_dir)?;
        let loader = WorkflowLoader::load(
            &cfg.workflows_path,
            known,
            cfg.scheduler.default_cycle_minutes,
        )
        .context("load workflow document")?;
        let store: Arc<dyn TaskStore> = match &cfg.state_path {
            Some(path) => Arc::new(MemoryStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let alerts = sink_from_config(&cfg.alerts)?;
        let worker: Arc<dyn Worker> = Arc::new(CommandWorker::from_config(&cfg.worker)?);
        let monitor = Arc::new(GuardBlockMonitor::new(
            &cfg.monitor,
            store.clone(),
            alerts.clone(),
        ));
        let runner = Arc::new(MissionRunner {
            workflows: Arc::new(loader),
            store,
            guards: Arc::new(guards),
            actions: Arc::new(actions),
            prompts: Arc::new(prompts),
            sor,
            monitor,
            learning: Learning::noop(),
        });
        Ok(Self::new(cfg, runner, alerts, worker))
    }

    pub fn runner(&self) -> &Arc<MissionRunner> {
        &self.runner
    }

    /// Wake-up callback for a declared agent, with its own repository scope.
    pub fn heartbeat_for(&self, agent_id: &str) -> Option<WorkerHeartbeat> {
        let agent = self.runner.workflows.snapshot().agent(agent_id)?.clone();
        let tools = ScopedToolbox::with_system_of_record(RepoScope::new(), self.runner.sor.clone());
        let handle = WorkerHandle {
            agent,
            worker: self.worker.clone(),
            tools,
        };
        Some(WorkerHeartbeat::new(self.runner.clone(), handle))
    }

    pub fn scheduler(&self) -> HeartbeatScheduler {
        let mut scheduler = HeartbeatScheduler::new(
            self.cfg.scheduler.default_cycle_minutes,
            self.cfg.heartbeat_timeout(),
        );
        for agent in self.runner.workflows.snapshot().agents() {
            if let Some(beat) = self.heartbeat_for(&agent.id) {
                scheduler.register(Arc::new(beat));
            }
        }
        scheduler
    }

    pub fn watchdog(&self) -> Watchdog {
        Watchdog::new(
            self.runner.workflows.clone(),
            self.runner.store.clone(),
            self.alerts.clone(),
            self.cfg.watchdog.clone(),
            self.cfg.scheduler.default_cycle_minutes,
        )
    }

    /// Run the scheduler and the watchdog until `shutdown` is cancelled.
    /// On unix a `SIGHUP` reloads the workflow document.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let scheduler = self.scheduler();
        if scheduler.is_empty() {
            warn!("no agents declared; only the watchdog will run");
        }
        let watchdog = self.watchdog();
        info!(agents = scheduler.len(), "control plane started");
        let (_, _, reload) = tokio::join!(
            scheduler.run(shutdown.clone()),
            watchdog.run(shutdown.clone()),
            self.reload_on_hangup(shutdown.clone()),
        );
        reload
    }

    #[cfg(unix)]
    async fn reload_on_hangup(&self, shutdown: CancellationToken) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut hangup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                received = hangup.recv() => {
                    if received.is_none() {
                        return Ok(());
                    }
                    // Rejected documents are logged by the loader.
                    let _ = self.reload();
                }
            }
        }
    }

    #[cfg(not(unix))]
    async fn reload_on_hangup(&self, shutdown: CancellationToken) -> Result<()> {
        shutdown.cancelled().await;
        Ok(())
    }

    /// Re-read the workflow document; the previous definitions stay live on error.
    ///
    /// Agents are registered with the scheduler at start, so a changed roster
    /// only takes effect after a restart.
    pub fn reload(&self) -> Result<()> {
        let before = agent_ids(&self.runner.workflows.snapshot());
        self.runner.workflows.reload()?;
        let after = agent_ids(&self.runner.workflows.snapshot());
        if before != after {
            warn!(
                before = ?before,
                after = ?after,
                "agent roster changed; restart to reschedule heartbeats"
            );
        }
        Ok(())
    }

    /// Create a task. Without an explicit assignee the agent holding the
    /// role of the mission's initial state takes it.
    #[instrument(skip_all, fields(mission = %request.mission))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Task> {
        let workflows = self.runner.workflows.snapshot();
        let def = workflows
            .get_mission_def(&request.mission)
            .ok_or_else(|| UnknownName::Mission(request.mission.clone()))?;

        let assignee = match &request.assignee {
            Some(id) => {
                if workflows.agent(id).is_none() {
                    return Err(UnknownName::Agent(id.clone()).into());
                }
                Some(id.clone())
            }
            None => def
                .role_for(&def.initial_state)
                .and_then(|role| workflows.find_worker_for_role(role))
                .map(|agent| agent.id.clone()),
        };
        let status = match (&request.status, &assignee) {
            (Some(status), _) => status.clone(),
            (None, Some(_)) => PLACEHOLDER_STATE.to_string(),
            (None, None) => INBOX_STATE.to_string(),
        };
        if !workflows.accepts_status(&request.mission, &status) {
            bail!("status '{status}' is not a state of mission '{}'", request.mission);
        }

        let now = Utc::now();
        let mut task = Task::new(
            request.title,
            request.description,
            &request.mission,
            status,
            now,
        );
        task.mission_config = parse_config(&request.config)?;
        self.runner
            .store
            .insert_task(task.clone())
            .await
            .context("insert task")?;
        if let Some(worker) = &assignee {
            self.runner
                .store
                .assign(&task.id, worker, now)
                .await
                .context("assign task")?;
        }
        info!(
            task = %task.id,
            status = %task.status,
            assignee = assignee.as_deref().unwrap_or("-"),
            "task submitted"
        );
        Ok(task)
    }

    pub async fn status_report(&self, now: DateTime<Utc>) -> Result<StatusReport> {
        let mut tasks = Vec::new();
        for task in self.runner.store.all_tasks().await? {
            let assignee = self
                .runner
                .store
                .assignments(&task.id)
                .await?
                .into_iter()
                .next()
                .map(|a| a.worker);
            tasks.push(TaskLine {
                id: task.id,
                mission: task.mission_type,
                status: task.status,
                assignee,
                title: task.title,
            });
        }
        Ok(StatusReport {
            tasks,
            heartbeats: self.runner.store.heartbeats().await?,
            next_runs: self.scheduler().next_runs(now),
        })
    }
}

fn registries(
    cfg: &ControlConfig,
    sor: Arc<dyn SystemOfRecord>,
) -> Result<(GuardRegistry, ActionRegistry)> {
    let guards = GuardRegistry::with_builtins(sor.clone());
    let actions =
        ActionRegistry::with_builtins(sor, cfg.search.clone()).context("build action registry")?;
    Ok((guards, actions))
}

/// Compile the workflow document named by `cfg` and return every finding,
/// hard errors included. Unreadable or unparsable documents are errors.
pub fn validate_workflows(cfg: &ControlConfig) -> Result<Vec<Finding>> {
    let sor: Arc<dyn SystemOfRecord> = Arc::new(GitHubClient::new(&cfg.github.api_base, None)?);
    let (guards, actions) = registries(cfg, sor)?;
    let known = KnownNames {
        guards: guards.names(),
        actions: actions.names(),
    };
    let path = &cfg.workflows_path;
    let source =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    match Workflows::compile(&source, path, &known, cfg.scheduler.default_cycle_minutes) {
        Ok(workflows) => Ok(workflows.warnings().to_vec()),
        Err(LoadError::Invalid { findings }) => Ok(findings),
        Err(err) => Err(err.into()),
    }
}

fn agent_ids(workflows: &Workflows) -> BTreeSet<String> {
    workflows.agents().iter().map(|a| a.id.clone()).collect()
}

/// Parse `key=value` pairs into a task config.
pub fn parse_config(pairs: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut config = BTreeMap::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("config entry '{pair}' is not key=value"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("config entry '{pair}' has an empty key");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        config.insert(key.to_string(), value);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;
    use crate::heartbeat::WakeUp;
    use crate::test_support::{Harness, SAMPLE_WORKFLOWS, ScriptedWorker};

    fn plane(harness: &Harness, worker: Arc<ScriptedWorker>) -> ControlPlane {
        ControlPlane::new(
            ControlConfig::default(),
            harness.runner.clone(),
            harness.alerts.clone(),
            worker,
        )
    }

    fn request(mission: &str) -> SubmitRequest {
        SubmitRequest {
            mission: mission.to_string(),
            title: "Fix login".to_string(),
            description: "Users cannot log in".to_string(),
            config: vec!["repository=acme/app".to_string()],
            ..SubmitRequest::default()
        }
    }

    #[test]
    fn config_values_parse_as_json_when_possible() {
        let config = parse_config(&[
            "repository=acme/app".to_string(),
            "max_files=20".to_string(),
            "flags=[\"a\"]".to_string(),
        ])
        .expect("config");
        assert_eq!(config["repository"], json!("acme/app"));
        assert_eq!(config["max_files"], json!(20));
        assert_eq!(config["flags"], json!(["a"]));
        assert!(parse_config(&["novalue".to_string()]).is_err());
        assert!(parse_config(&["=x".to_string()]).is_err());
    }

    #[test]
    fn validate_reports_hard_errors_as_findings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = ControlConfig::default();
        cfg.workflows_path = dir.path().join("workflows.toml");

        fs::write(&cfg.workflows_path, SAMPLE_WORKFLOWS).expect("write sample");
        let findings = validate_workflows(&cfg).expect("sample compiles");
        assert!(!findings.iter().any(Finding::is_error));

        let broken = SAMPLE_WORKFLOWS.replace("guard = \"has_open_pr\"", "guard = \"has_opne_pr\"");
        fs::write(&cfg.workflows_path, broken).expect("write broken");
        let findings = validate_workflows(&cfg).expect("findings");
        assert!(findings.iter().any(|f| f.is_error() && f.message.contains("has_opne_pr")));

        fs::write(&cfg.workflows_path, "missions = [").expect("write garbage");
        assert!(validate_workflows(&cfg).is_err());
    }

    #[tokio::test]
    async fn submit_defaults_to_initial_role_holder() {
        let harness = Harness::new(SAMPLE_WORKFLOWS);
        let plane = plane(&harness, Arc::new(ScriptedWorker::replying("ok")));
        let task = plane.submit(request("build")).await.expect("submit");
        assert_eq!(task.status, PLACEHOLDER_STATE);
        assert_eq!(task.mission_config["repository"], json!("acme/app"));
        assert_eq!(harness.assignees(&task.id).await, vec!["dev".to_string()]);
    }

    #[tokio::test]
    async fn submit_rejects_unknown_names_and_foreign_states() {
        let harness = Harness::new(SAMPLE_WORKFLOWS);
        let plane = plane(&harness, Arc::new(ScriptedWorker::replying("ok")));

        let err = plane.submit(request("deploy")).await.expect_err("unknown mission");
        assert_eq!(
            err.downcast_ref::<UnknownName>(),
            Some(&UnknownName::Mission("deploy".to_string()))
        );

        let mut ghost = request("build");
        ghost.assignee = Some("ghost".to_string());
        let err = plane.submit(ghost).await.expect_err("unknown agent");
        assert!(matches!(err.downcast_ref::<UnknownName>(), Some(UnknownName::Agent(_))));

        let mut foreign = request("build");
        foreign.status = Some("NOT_A_STATE".to_string());
        assert!(plane.submit(foreign).await.is_err());
        assert!(harness.store.all_tasks().await.expect("tasks").is_empty());
    }

    #[tokio::test]
    async fn submitted_task_is_picked_up_by_its_worker() {
        let harness = Harness::new(SAMPLE_WORKFLOWS);
        let plane = plane(&harness, Arc::new(ScriptedWorker::replying("done")));
        let task = plane.submit(request("build")).await.expect("submit");
        let beat = plane.heartbeat_for("dev").expect("dev is declared");
        let report = beat.wake().await.expect("wake");
        assert_eq!(report.executed.len(), 1);
        assert_eq!(report.executed[0].0, task.id);
        assert!(plane.heartbeat_for("ghost").is_none());
    }

    #[tokio::test]
    async fn status_lists_tasks_heartbeats_and_every_agent() {
        let harness = Harness::new(SAMPLE_WORKFLOWS);
        let plane = plane(&harness, Arc::new(ScriptedWorker::replying("ok")));
        let task = plane.submit(request("build")).await.expect("submit");
        let now: DateTime<Utc> = "2026-03-01T10:20:00Z".parse().expect("timestamp");
        harness
            .store
            .record_heartbeat("dev", now - ChronoDuration::minutes(5))
            .await
            .expect("heartbeat");

        let report = plane.status_report(now).await.expect("status");
        assert_eq!(report.tasks.len(), 1);
        assert_eq!(report.tasks[0].id, task.id);
        assert_eq!(report.tasks[0].assignee.as_deref(), Some("dev"));
        assert_eq!(report.heartbeats.len(), 1);
        assert_eq!(report.next_runs.len(), 5);

        let text = report.to_string();
        assert!(text.contains(&task.id.short()));
        assert!(text.contains("next runs:"));
    }
}
