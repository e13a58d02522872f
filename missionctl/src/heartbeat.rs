//! Worker wake-up: record the heartbeat, run the agent's standing prompt,
//! then find and advance the agent's work.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::render::truncate_chars;
use crate::core::states::PLACEHOLDER_STATE;
use crate::core::types::{AgentBinding, AgentLevel, Task, TaskId};
use crate::io::workflow::Workflows;
use crate::step::{ExecuteOutcome, MissionRunner, WorkerHandle};

/// Delegated tasks reviewed per wake-up.
pub const REVIEW_BATCH: usize = 5;

/// Callback fired by the scheduler for one agent.
#[async_trait]
pub trait WakeUp: Send + Sync {
    fn agent(&self) -> &AgentBinding;

    async fn wake(&self) -> Result<WakeReport>;
}

/// One task picked by work discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub task_id: TaskId,
    /// Pipeline to run instead of the task's own (verify delegation).
    pub mission: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WakeReport {
    pub executed: Vec<(TaskId, ExecuteOutcome)>,
    /// Tasks whose execution returned an error; the rest of the batch still ran.
    pub errors: Vec<(TaskId, String)>,
}

impl WakeReport {
    pub fn is_idle(&self) -> bool {
        self.executed.is_empty() && self.errors.is_empty()
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        if self.is_idle() {
            return "HEARTBEAT_OK".to_string();
        }
        self.executed
            .iter()
            .map(|(id, outcome)| format!("{}: {}", id.short(), describe(outcome)))
            .chain(
                self.errors
                    .iter()
                    .map(|(id, err)| format!("{}: error ({err})", id.short())),
            )
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn describe(outcome: &ExecuteOutcome) -> String {
    match outcome {
        ExecuteOutcome::NotFound => "not found".to_string(),
        ExecuteOutcome::Terminal { state } => format!("terminal at {state}"),
        ExecuteOutcome::Skipped { state, reason } => format!("skipped {state} ({reason})"),
        ExecuteOutcome::Advanced { from, to, .. } => format!("{from} → {to}"),
        ExecuteOutcome::Failed { from, to, .. } => match to {
            Some(to) => format!("failed {from}, back to {to}"),
            None => format!("failed {from}"),
        },
    }
}

/// Wake-up for a worker bound to the shared execution loop.
pub struct WorkerHeartbeat {
    runner: Arc<MissionRunner>,
    handle: WorkerHandle,
}

impl WorkerHeartbeat {
    pub fn new(runner: Arc<MissionRunner>, handle: WorkerHandle) -> Self {
        Self { runner, handle }
    }

    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Tasks to advance on this wake-up, in execution order.
    pub async fn check_for_work(&self) -> Result<Vec<WorkItem>> {
        let workflows = self.runner.workflows.snapshot();
        let mut mine = self.runner.store.tasks_for_worker(self.handle.id()).await?;
        mine.sort_by_key(|t| t.created_at);

        if let Some(task) = mine.iter().find(|t| in_flight(&workflows, t)) {
            return Ok(vec![WorkItem {
                task_id: task.id.clone(),
                mission: None,
            }]);
        }
        if let Some(task) = mine.iter().find(|t| awaiting_promotion(&workflows, t)) {
            return Ok(vec![WorkItem {
                task_id: task.id.clone(),
                mission: None,
            }]);
        }
        self.delegated_reviews(&workflows).await
    }

    /// Tasks parked at the start of the pipeline this lead verifies for others.
    async fn delegated_reviews(&self, workflows: &Workflows) -> Result<Vec<WorkItem>> {
        let agent = &self.handle.agent;
        if agent.level != AgentLevel::Lead {
            return Ok(Vec::new());
        }
        let Some(mission) = agent.mission.as_deref() else {
            return Ok(Vec::new());
        };
        let Some(delegate) = workflows.get_mission_def(mission) else {
            return Ok(Vec::new());
        };
        let delegators = workflows.delegators_of(mission);
        if delegators.is_empty() {
            return Ok(Vec::new());
        }
        let mut waiting = self
            .runner
            .store
            .tasks_in_status(&delegate.initial_state)
            .await?;
        waiting.sort_by_key(|t| t.created_at);
        Ok(waiting
            .into_iter()
            .filter(|t| delegators.iter().any(|d| d.name == t.mission_type))
            .take(REVIEW_BATCH)
            .map(|t| WorkItem {
                task_id: t.id,
                mission: Some(mission.to_string()),
            })
            .collect())
    }

    async fn always_run(&self) {
        let Some(standing) = &self.handle.agent.always_run else {
            return;
        };
        let limit = Duration::from_secs(standing.timeout_secs);
        let call = self
            .handle
            .worker
            .run(&standing.prompt, self.handle.id(), &self.handle.tools);
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(reply)) => info!(
                success = reply.success,
                output = %truncate_chars(&reply.text, 200),
                "always_run completed"
            ),
            Ok(Err(err)) => {
                let detail = format!("{err:#}");
                warn!(error = %detail, "always_run failed");
            }
            Err(_) => warn!(timeout_secs = standing.timeout_secs, "always_run timed out"),
        }
    }
}

/// Assigned task sitting in a working state of its own pipeline.
fn in_flight(workflows: &Workflows, task: &Task) -> bool {
    let Some(def) = workflows.get_mission_def(&task.mission_type) else {
        return false;
    };
    task.status != PLACEHOLDER_STATE
        && def.pipeline_states().contains(task.status.as_str())
        && !def.is_terminal(&task.status)
}

/// Assigned task that has not entered its pipeline yet.
fn awaiting_promotion(workflows: &Workflows, task: &Task) -> bool {
    let Some(def) = workflows.get_mission_def(&task.mission_type) else {
        return false;
    };
    task.status == PLACEHOLDER_STATE || !def.pipeline_states().contains(task.status.as_str())
}

#[async_trait]
impl WakeUp for WorkerHeartbeat {
    fn agent(&self) -> &AgentBinding {
        &self.handle.agent
    }

    #[instrument(skip_all, fields(worker = %self.handle.id()))]
    async fn wake(&self) -> Result<WakeReport> {
        self.runner
            .store
            .record_heartbeat(self.handle.id(), Utc::now())
            .await?;
        self.always_run().await;

        let work = self.check_for_work().await?;
        if work.is_empty() {
            debug!("no work");
            return Ok(WakeReport::default());
        }
        let mut report = WakeReport::default();
        for item in work {
            match self
                .runner
                .execute(&self.handle, &item.task_id, item.mission.as_deref())
                .await
            {
                Ok(outcome) => report.executed.push((item.task_id, outcome)),
                Err(err) => {
                    let detail = format!("{err:#}");
                    error!(task = %item.task_id, error = %detail, "task execution failed");
                    report.errors.push((item.task_id, detail));
                }
            }
        }
        info!(summary = %report.summary(), "wake-up finished");
        Ok(report)
    }
}
