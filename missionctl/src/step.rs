//! Mission execution loop: one stage transition attempt for one task.
//!
//! `execute` runs the generic five steps for whatever pipeline governs the
//! task:
//!
//! 1. promote the task into the pipeline if it is not in a pipeline state yet;
//! 2. pick the first non-error edge out of the current state (none: terminal);
//! 3. run the stage's pre-actions and build the prompt;
//! 4. invoke the worker with its repository scope bound for the call;
//! 5. run the post-check, then the post-actions, then the guard of the
//!    selected edge, and commit the transition or the failure path.
//!
//! Worker errors never propagate; they become a failed reply and follow the
//! stage's failure path. Only task-store errors are returned.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::core::block_log::BlockEvent;
use crate::core::graph::{MissionDef, PostCheck, StageConfig};
use crate::core::render::truncate_chars;
use crate::core::review::{APPROVED_MARKER, ReviewVerdict, review_verdict};
use crate::core::states::{PLACEHOLDER_STATE, TERMINAL_STATE};
use crate::core::types::{Activity, ActivityKind, AgentBinding, StageCommit, Task, TaskId};
use crate::io::actions::{ActionRegistry, ActionRunner, Vars, result_text};
use crate::io::github::SystemOfRecord;
use crate::io::guards::{DEFAULT_MAX_FILES, DEFAULT_STALE_MINUTES, GuardContext, GuardRegistry};
use crate::io::learning::{Learning, TransitionEvent};
use crate::io::pr_check::{extract_target_repo, has_open_pr, split_repo};
use crate::io::prompt::PromptLibrary;
use crate::io::store::TaskStore;
use crate::io::worker::{Worker, WorkerReply};
use crate::io::workflow::{WorkflowLoader, Workflows};
use crate::monitor::GuardBlockMonitor;
use crate::scope::{RepoTarget, ScopedToolbox};

const DEFAULT_SOURCE_BRANCH: &str = "main";
const REASON_CHARS: usize = 300;
const NOTE_REASON_CHARS: usize = 200;

/// A worker identity together with its backend and its scoped tools.
#[derive(Clone)]
pub struct WorkerHandle {
    pub agent: AgentBinding,
    pub worker: Arc<dyn Worker>,
    pub tools: ScopedToolbox,
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        &self.agent.id
    }

    /// Prefix of every branch this worker creates.
    pub fn head_prefix(&self) -> String {
        format!("{}/", self.agent.id.to_lowercase())
    }

    pub fn branch_for(&self, task_id: &TaskId) -> String {
        format!("{}{}", self.head_prefix(), task_id.short())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    NotFound,
    /// No success edge leaves the current state; nothing ran.
    Terminal { state: String },
    /// The stage produced no prompt; nothing was committed.
    Skipped { state: String, reason: String },
    Advanced {
        from: String,
        to: String,
        /// Routed to the revision state by a review verdict.
        revision: bool,
    },
    Failed {
        from: String,
        /// Error-edge target, when the state has one.
        to: Option<String>,
        reason: String,
    },
}

/// Shared collaborators of the execution loop.
pub struct MissionRunner {
    pub workflows: Arc<WorkflowLoader>,
    pub store: Arc<dyn TaskStore>,
    pub guards: Arc<GuardRegistry>,
    pub actions: Arc<ActionRegistry>,
    pub prompts: Arc<PromptLibrary>,
    pub sor: Arc<dyn SystemOfRecord>,
    pub monitor: Arc<GuardBlockMonitor>,
    pub learning: Learning,
}

/// Per-execution facts derived from the task and its merged config.
struct TaskFacts {
    repository: String,
    source_branch: String,
    branch_name: String,
    merged: BTreeMap<String, Value>,
}

impl MissionRunner {
    /// Advance `task_id` by one stage of its own pipeline, or of `mission`
    /// when a verify delegate executes it.
    #[instrument(skip_all, fields(worker = %worker.id(), task = %task_id))]
    pub async fn execute(
        &self,
        worker: &WorkerHandle,
        task_id: &TaskId,
        mission: Option<&str>,
    ) -> Result<ExecuteOutcome> {
        let workflows = self.workflows.snapshot();
        let Some(mut task) = self.store.get_task(task_id).await? else {
            warn!("task not found");
            return Ok(ExecuteOutcome::NotFound);
        };
        let mission_name = mission.unwrap_or(&task.mission_type).to_string();
        let def = workflows
            .get_mission_def(&mission_name)
            .ok_or_else(|| anyhow!("unknown mission '{mission_name}'"))?;
        let started = Instant::now();

        // 1. Promote into the pipeline.
        let pipeline = def.pipeline_states();
        let needs_promotion = (task.status == PLACEHOLDER_STATE
            && def.initial_state != PLACEHOLDER_STATE)
            || !pipeline.contains(task.status.as_str());
        if needs_promotion && task.status != def.initial_state {
            self.promote(&workflows, worker, &mut task, def).await?;
        }
        let current = task.status.clone();

        // 2. Success candidate.
        let candidate = match def.success_candidate(&current) {
            Some(t) if current != TERMINAL_STATE => t.to.clone(),
            _ => {
                debug!(state = %current, "task is terminal");
                return Ok(ExecuteOutcome::Terminal { state: current });
            }
        };
        let stage = def.stage(&current).cloned().unwrap_or_default();
        let facts = self.task_facts(worker, &task, def);

        // 3. Pre-actions and prompt.
        let mut runner = ActionRunner::new(
            self.actions.clone(),
            base_vars(&task, &mission_name, &current, &candidate, &facts),
        );
        let pre = runner.run_all(&stage.pre_actions, &Vars::new()).await;
        let context: Vec<String> = pre
            .iter()
            .filter_map(|(_, v)| v.as_ref().and_then(result_text))
            .collect();
        let context_data = if context.is_empty() {
            task.description.clone()
        } else {
            context.join("\n\n")
        };
        runner.set_var("context_data", context_data);
        runner.set_var("context_files_section", context_files_section(&facts.merged));
        let learned = self
            .learning
            .context(&mission_name, &format!("{} {}", task.title, task.description))
            .await;
        runner.set_var("learned_context", learned);

        // 4. Worker.
        let reply = if stage.worker {
            let prompt = match self.build_prompt(&stage, &task, runner.vars()) {
                Ok(prompt) => prompt,
                Err(err) => {
                    let reason = format!("{err:#}");
                    error!(state = %current, error = %reason, "prompt rendering failed");
                    return Ok(ExecuteOutcome::Skipped {
                        state: current,
                        reason,
                    });
                }
            };
            if prompt.trim().is_empty() {
                warn!(state = %current, "empty prompt, skipping stage");
                return Ok(ExecuteOutcome::Skipped {
                    state: current,
                    reason: "empty prompt".to_string(),
                });
            }
            self.invoke(worker, &prompt, &facts.repository).await
        } else {
            WorkerReply::ok("")
        };

        // 5. Post-check.
        let mut next = candidate;
        let mut revision = false;
        let post_check = stage.post_check();
        let post_ok = match post_check {
            None => true,
            Some(PostCheck::PrExists) => {
                self.verify_pull_request(worker, &task, &facts, reply.success)
                    .await
            }
            Some(PostCheck::ReviewApproved) => match review_verdict(&reply.text) {
                ReviewVerdict::Approved => true,
                ReviewVerdict::Revision => {
                    next = stage.revision_state().to_string();
                    revision = true;
                    true
                }
                ReviewVerdict::Undecided => false,
            },
        };
        let produced = reply.success && post_ok;

        // 6. Post-actions. Deliverable guards read what these commit.
        if produced && !stage.post_actions.is_empty() {
            let mut extra = Vars::new();
            if post_check == Some(PostCheck::ReviewApproved) {
                let verdict = if revision { "revision" } else { "approved" };
                extra.insert("verdict".to_string(), verdict.to_string());
                let cleaned = reply.text.replace(APPROVED_MARKER, "");
                extra.insert("llm_output".to_string(), cleaned.trim().to_string());
            } else {
                extra.insert("llm_output".to_string(), reply.text.clone());
            }
            runner.run_all(&stage.post_actions, &extra).await;
        }

        let guard = def.edge_guard(&current, &next).map(str::to_string);
        let mut blocked_by = None;
        if produced && let Some(name) = &guard {
            let ctx = self.guard_context(worker, &task, &facts, &reply).await?;
            if !self.guards.evaluate(name, &ctx).await {
                blocked_by = Some(name.clone());
            }
        }
        let ok = produced && blocked_by.is_none();

        // 7. Commit.
        let now = Utc::now();
        if ok {
            ensure_status(&workflows, &task, &next)?;
            let reassign_to = next_owner(&workflows, def, &current, &next);
            self.store
                .commit(StageCommit {
                    task_id: task.id.clone(),
                    status: Some(next.clone()),
                    note: Activity {
                        task_id: task.id.clone(),
                        kind: ActivityKind::Transition,
                        worker: Some(worker.id().to_string()),
                        from_state: current.clone(),
                        to_state: next.clone(),
                        message: format!("{mission_name}: {current} → {next}"),
                        at: now,
                    },
                    reassign_to: reassign_to.clone(),
                })
                .await?;
            self.learning
                .transition(TransitionEvent {
                    worker: worker.id().to_string(),
                    mission_type: mission_name.clone(),
                    task_id: task.id.clone(),
                    from_state: current.clone(),
                    to_state: next.clone(),
                    duration_secs: started.elapsed().as_secs_f64(),
                    guard: guard.clone(),
                    guard_result: guard.as_ref().map(|_| true),
                })
                .await;
            info!(
                mission = %mission_name,
                from = %current,
                to = %next,
                revision,
                reassigned = ?reassign_to,
                "stage complete"
            );
            return Ok(ExecuteOutcome::Advanced {
                from: current,
                to: next,
                revision,
            });
        }

        let error_state = def.error_edge(&current).map(|t| t.to.clone());
        if let Some(state) = &error_state {
            ensure_status(&workflows, &task, state)?;
        }
        let reason = if reply.text.trim().is_empty() {
            "No output".to_string()
        } else {
            truncate_chars(&reply.text, REASON_CHARS).to_string()
        };
        self.store
            .commit(StageCommit {
                task_id: task.id.clone(),
                status: error_state.clone(),
                note: Activity {
                    task_id: task.id.clone(),
                    kind: ActivityKind::Failure,
                    worker: Some(worker.id().to_string()),
                    from_state: current.clone(),
                    to_state: error_state.clone().unwrap_or_else(|| current.clone()),
                    message: format!(
                        "{mission_name} {current}: failed. {}",
                        truncate_chars(&reason, NOTE_REASON_CHARS)
                    ),
                    at: now,
                },
                reassign_to: None,
            })
            .await?;
        warn!(
            mission = %mission_name,
            state = %current,
            error_state = ?error_state,
            worker_ok = reply.success,
            post_check_ok = post_ok,
            blocked_by = ?blocked_by,
            "deliverable check failed"
        );
        if let Some(guard) = &blocked_by {
            self.monitor
                .record_block(BlockEvent {
                    mission_type: mission_name.clone(),
                    from_state: current.clone(),
                    to_state: next.clone(),
                    guard: guard.clone(),
                    worker: worker.id().to_string(),
                    task_id: task.id.clone(),
                    at: now,
                })
                .await;
        }
        self.learning
            .transition(TransitionEvent {
                worker: worker.id().to_string(),
                mission_type: mission_name.clone(),
                task_id: task.id.clone(),
                from_state: current.clone(),
                to_state: error_state.clone().unwrap_or_else(|| current.clone()),
                duration_secs: started.elapsed().as_secs_f64(),
                guard: Some(blocked_by.unwrap_or_else(|| "post_check".to_string())),
                guard_result: Some(false),
            })
            .await;
        self.learning
            .error(worker.id(), &mission_name, &task.id, &reason)
            .await;
        Ok(ExecuteOutcome::Failed {
            from: current,
            to: error_state,
            reason,
        })
    }

    async fn promote(
        &self,
        workflows: &Workflows,
        worker: &WorkerHandle,
        task: &mut Task,
        def: &MissionDef,
    ) -> Result<()> {
        let initial = def.initial_state.clone();
        ensure_status(workflows, task, &initial)?;
        let now = Utc::now();
        self.store
            .commit(StageCommit {
                task_id: task.id.clone(),
                status: Some(initial.clone()),
                note: Activity {
                    task_id: task.id.clone(),
                    kind: ActivityKind::Promoted,
                    worker: Some(worker.id().to_string()),
                    from_state: task.status.clone(),
                    to_state: initial.clone(),
                    message: format!("{}: {} → {initial}", def.name, task.status),
                    at: now,
                },
                reassign_to: None,
            })
            .await?;
        info!(from = %task.status, to = %initial, "task promoted into pipeline");
        task.status = initial;
        task.updated_at = now;
        Ok(())
    }

    fn task_facts(&self, worker: &WorkerHandle, task: &Task, def: &MissionDef) -> TaskFacts {
        let merged = def.merged_config(&task.mission_config);
        let repository = merged
            .get("repository")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .or_else(|| extract_target_repo(&task.description))
            .unwrap_or_default();
        let source_branch = merged
            .get("base_branch")
            .and_then(Value::as_str)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_SOURCE_BRANCH)
            .to_string();
        TaskFacts {
            repository,
            source_branch,
            branch_name: worker.branch_for(&task.id),
            merged,
        }
    }

    fn build_prompt(&self, stage: &StageConfig, task: &Task, vars: &Vars) -> Result<String> {
        match stage.prompt_template.as_deref().filter(|t| !t.is_empty()) {
            Some(template) => {
                let mut names = Vec::with_capacity(2);
                if let Some(base) = stage.prompt_base.as_deref().filter(|b| !b.is_empty()) {
                    names.push(base);
                }
                names.push(template);
                self.prompts.render_composite(&names, vars)
            }
            None => Ok(format!(
                "Task: {}\nDescription: {}",
                task.title, task.description
            )),
        }
    }

    /// Run the worker with its scope bound to the task's repository. The
    /// binding is released when this returns, unwinds or is cancelled.
    async fn invoke(&self, worker: &WorkerHandle, prompt: &str, repository: &str) -> WorkerReply {
        let _binding = worker.tools.scope().bind(RepoTarget::parse(repository));
        match worker.worker.run(prompt, worker.id(), &worker.tools).await {
            Ok(reply) => reply,
            Err(err) => {
                let detail = format!("{err:#}");
                error!(error = %detail, "worker run failed");
                WorkerReply::failed(format!("ERROR: {detail}"))
            }
        }
    }

    /// Ground-truth check for `pr_exists`, with a one-shot creation fallback
    /// when the worker reports success but no change request is open.
    async fn verify_pull_request(
        &self,
        worker: &WorkerHandle,
        task: &Task,
        facts: &TaskFacts,
        worker_ok: bool,
    ) -> bool {
        if facts.repository.is_empty() {
            warn!("no repository configured, cannot verify change request");
            return false;
        }
        let lookup = has_open_pr(self.sor.as_ref(), &facts.repository, &worker.head_prefix()).await;
        if lookup.found {
            info!(url = ?lookup.url, "change request verified");
            return true;
        }
        if !worker_ok {
            return false;
        }
        match self
            .sor
            .create_change_request(
                &facts.repository,
                &facts.branch_name,
                &facts.source_branch,
                &task.title,
            )
            .await
        {
            Ok(Some(url)) => {
                info!(%url, "change request created by fallback");
                true
            }
            Ok(None) => false,
            Err(err) => {
                let detail = format!("{err:#}");
                warn!(error = %detail, "change request fallback failed");
                false
            }
        }
    }

    async fn guard_context(
        &self,
        worker: &WorkerHandle,
        task: &Task,
        facts: &TaskFacts,
        reply: &WorkerReply,
    ) -> Result<GuardContext> {
        let mut ctx = GuardContext::new(task.id.clone(), Utc::now());
        ctx.mission_type.clone_from(&task.mission_type);
        ctx.repository.clone_from(&facts.repository);
        ctx.head_prefix = worker.head_prefix();
        ctx.assignee_prefix = self
            .store
            .assignments(&task.id)
            .await?
            .into_iter()
            .map(|a| a.worker)
            .find(|w| w != worker.id())
            .map(|w| format!("{}/", w.to_lowercase()));
        ctx.branch_name.clone_from(&facts.branch_name);
        ctx.last_response.clone_from(&reply.text);
        ctx.updated_at = task.updated_at;
        ctx.stale_threshold_minutes = facts
            .merged
            .get("stale_threshold_minutes")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_STALE_MINUTES);
        ctx.max_files = facts
            .merged
            .get("max_files")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_FILES);
        Ok(ctx)
    }
}

fn base_vars(task: &Task, mission: &str, current: &str, next: &str, facts: &TaskFacts) -> Vars {
    let (owner, repo) = split_repo(&facts.repository).unwrap_or(("", ""));
    [
        ("task_id", task.id.to_string()),
        ("short_id", task.id.short()),
        ("title", task.title.clone()),
        ("description", task.description.clone()),
        ("repository", facts.repository.clone()),
        ("owner", owner.to_string()),
        ("repo", repo.to_string()),
        ("branch_name", facts.branch_name.clone()),
        ("source_branch", facts.source_branch.clone()),
        ("mission_type", mission.to_string()),
        ("current_state", current.to_string()),
        ("next_state", next.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn context_files_section(merged: &BTreeMap<String, Value>) -> String {
    let files: Vec<&str> = merged
        .get("context_files")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if files.is_empty() {
        String::new()
    } else {
        format!("Reference these files for context: {}", files.join(", "))
    }
}

/// Status writes must stay inside the task's mission vocabulary.
fn ensure_status(workflows: &Workflows, task: &Task, status: &str) -> Result<()> {
    if workflows.accepts_status(&task.mission_type, status) {
        Ok(())
    } else {
        Err(anyhow!(
            "state '{status}' is not valid for mission '{}'",
            task.mission_type
        ))
    }
}

/// Worker that should own the task after `from → to`, if it changes hands.
fn next_owner(workflows: &Workflows, def: &MissionDef, from: &str, to: &str) -> Option<String> {
    let role = def.role_for(to)?;
    if def.is_terminal(to) {
        return None;
    }
    if def.role_for(from) == Some(role) {
        debug!(%role, "same role owns next stage, keeping assignment");
        return None;
    }
    match workflows.find_worker_for_role(role) {
        Some(agent) => Some(agent.id.clone()),
        None => {
            warn!(%role, "no agent holds the next stage's role");
            None
        }
    }
}
