//! Guard registry: named read-only predicates gating transitions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{error, warn};

use crate::core::types::TaskId;
use crate::io::github::SystemOfRecord;
use crate::io::pr_check::{has_open_pr, has_open_pr_for_task};

pub const DEFAULT_STALE_MINUTES: i64 = 90;
pub const DEFAULT_MAX_FILES: u64 = 500;
/// Mission type whose tasks review someone else's deliverable.
pub const REVIEW_MISSION_TYPE: &str = "review";

const ERROR_MARKERS: [&str; 6] = [
    "broken pipe",
    "cannot proceed",
    "error:",
    "timeout",
    "connection refused",
    "rate limit",
];

/// Facts a guard may inspect about one task at one moment.
#[derive(Debug, Clone)]
pub struct GuardContext {
    pub task_id: TaskId,
    pub short_id: String,
    pub mission_type: String,
    /// `owner/repo` of the task's target repository; empty when unknown.
    pub repository: String,
    /// Branch prefix of the executing worker (`{worker}/`).
    pub head_prefix: String,
    /// Branch prefix of the worker currently assigned the task, if different.
    pub assignee_prefix: Option<String>,
    pub branch_name: String,
    pub last_response: String,
    pub updated_at: DateTime<Utc>,
    pub stale_threshold_minutes: i64,
    pub max_files: u64,
    pub now: DateTime<Utc>,
}

impl GuardContext {
    pub fn new(task_id: TaskId, now: DateTime<Utc>) -> Self {
        Self {
            short_id: task_id.short(),
            task_id,
            mission_type: String::new(),
            repository: String::new(),
            head_prefix: String::new(),
            assignee_prefix: None,
            branch_name: String::new(),
            last_response: String::new(),
            updated_at: now,
            stale_threshold_minutes: DEFAULT_STALE_MINUTES,
            max_files: DEFAULT_MAX_FILES,
            now,
        }
    }
}

#[async_trait]
pub trait Guard: Send + Sync {
    async fn check(&self, ctx: &GuardContext) -> Result<bool>;
}

/// Guard backed by a synchronous closure.
pub struct FnGuard<F>(pub F);

#[async_trait]
impl<F> Guard for FnGuard<F>
where
    F: Fn(&GuardContext) -> Result<bool> + Send + Sync,
{
    async fn check(&self, ctx: &GuardContext) -> Result<bool> {
        (self.0)(ctx)
    }
}

/// Negation of another guard; errors propagate unchanged.
pub struct Not(pub Arc<dyn Guard>);

#[async_trait]
impl Guard for Not {
    async fn check(&self, ctx: &GuardContext) -> Result<bool> {
        Ok(!self.0.check(ctx).await?)
    }
}

#[derive(Clone, Default)]
pub struct GuardRegistry {
    guards: BTreeMap<String, Arc<dyn Guard>>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in guard.
    pub fn with_builtins(sor: Arc<dyn SystemOfRecord>) -> Self {
        let mut registry = Self::new();
        let open_pr: Arc<dyn Guard> = Arc::new(HasOpenPr(sor.clone()));
        let approved: Arc<dyn Guard> = Arc::new(QualityApproved(sor.clone()));
        registry.register("has_open_pr", open_pr.clone());
        registry.register("no_open_pr", Arc::new(Not(open_pr)));
        registry.register("has_task_pr", Arc::new(HasTaskPr(sor.clone())));
        registry.register("has_branch", Arc::new(HasBranch(sor.clone())));
        registry.register("has_error", Arc::new(FnGuard(has_error)));
        registry.register("is_stale", Arc::new(FnGuard(is_stale)));
        registry.register("files_changed_ok", Arc::new(FilesChangedOk(sor.clone())));
        registry.register("quality_approved", approved.clone());
        registry.register("needs_revision", Arc::new(Not(approved)));
        for (name, folder) in CONTENT_FOLDERS {
            registry.register(
                name,
                Arc::new(ContentFile {
                    sor: sor.clone(),
                    folder,
                }),
            );
        }
        registry
    }

    pub fn register(&mut self, name: &str, guard: Arc<dyn Guard>) {
        self.guards.insert(name.to_string(), guard);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.guards.contains_key(name)
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.guards.keys().cloned().collect()
    }

    /// Evaluate `name`. Unknown guards pass; a failing predicate blocks.
    pub async fn evaluate(&self, name: &str, ctx: &GuardContext) -> bool {
        let Some(guard) = self.guards.get(name) else {
            warn!(guard = name, "unknown guard, allowing transition");
            return true;
        };
        match guard.check(ctx).await {
            Ok(pass) => pass,
            Err(err) => {
                let detail = format!("{err:#}");
                error!(guard = name, task = %ctx.task_id, error = %detail, "guard evaluation failed");
                false
            }
        }
    }
}

fn has_error(ctx: &GuardContext) -> Result<bool> {
    let response = ctx.last_response.to_lowercase();
    Ok(ERROR_MARKERS.iter().any(|m| response.contains(m)))
}

fn is_stale(ctx: &GuardContext) -> Result<bool> {
    Ok(ctx.now - ctx.updated_at > Duration::minutes(ctx.stale_threshold_minutes))
}

struct HasOpenPr(Arc<dyn SystemOfRecord>);

#[async_trait]
impl Guard for HasOpenPr {
    async fn check(&self, ctx: &GuardContext) -> Result<bool> {
        if ctx.repository.is_empty() || ctx.head_prefix.is_empty() {
            return Ok(false);
        }
        Ok(has_open_pr(self.0.as_ref(), &ctx.repository, &ctx.head_prefix)
            .await
            .found)
    }
}

/// Task-scoped deliverable check used by verification pipelines.
struct HasTaskPr(Arc<dyn SystemOfRecord>);

#[async_trait]
impl Guard for HasTaskPr {
    async fn check(&self, ctx: &GuardContext) -> Result<bool> {
        if ctx.mission_type == REVIEW_MISSION_TYPE {
            return Ok(true);
        }
        if ctx.repository.is_empty() {
            return Ok(false);
        }
        let sor = self.0.as_ref();
        if has_open_pr_for_task(sor, &ctx.repository, &ctx.short_id)
            .await
            .found
        {
            return Ok(true);
        }
        match &ctx.assignee_prefix {
            Some(prefix) => Ok(has_open_pr(sor, &ctx.repository, prefix).await.found),
            None => Ok(false),
        }
    }
}

struct HasBranch(Arc<dyn SystemOfRecord>);

#[async_trait]
impl Guard for HasBranch {
    async fn check(&self, ctx: &GuardContext) -> Result<bool> {
        if ctx.repository.is_empty() || ctx.branch_name.is_empty() {
            return Ok(false);
        }
        self.0.branch_exists(&ctx.repository, &ctx.branch_name).await
    }
}

/// Passes unless an open change request from this worker touches too many
/// files. Lookup failures are permissive.
struct FilesChangedOk(Arc<dyn SystemOfRecord>);

#[async_trait]
impl Guard for FilesChangedOk {
    async fn check(&self, ctx: &GuardContext) -> Result<bool> {
        if ctx.repository.is_empty() || ctx.head_prefix.is_empty() {
            return Ok(true);
        }
        let Ok(requests) = self.0.list_open_change_requests(&ctx.repository).await else {
            return Ok(true);
        };
        let Some(request) = requests
            .iter()
            .find(|cr| cr.source_branch.starts_with(&ctx.head_prefix))
        else {
            return Ok(true);
        };
        match self.0.changed_files(&ctx.repository, request.number).await {
            Ok(changed) => Ok(changed <= ctx.max_files),
            Err(_) => Ok(true),
        }
    }
}

const CONTENT_FOLDERS: [(&str, &str); 4] = [
    ("has_research", "content/research"),
    ("has_draft", "content/drafts"),
    ("is_published", "content/published"),
    ("has_social_posts", "content/social"),
];

/// A file naming the task's short id exists in `folder`.
struct ContentFile {
    sor: Arc<dyn SystemOfRecord>,
    folder: &'static str,
}

#[async_trait]
impl Guard for ContentFile {
    async fn check(&self, ctx: &GuardContext) -> Result<bool> {
        if ctx.repository.is_empty() || !self.sor.has_credential() {
            return Ok(false);
        }
        let names = self.sor.list_directory(&ctx.repository, self.folder).await?;
        Ok(names.iter().any(|n| n.contains(&ctx.short_id)))
    }
}

/// Latest commit touching the task's draft carries `[approved]`.
struct QualityApproved(Arc<dyn SystemOfRecord>);

pub fn draft_path(short_id: &str) -> String {
    format!("content/drafts/{short_id}-article.md")
}

#[async_trait]
impl Guard for QualityApproved {
    async fn check(&self, ctx: &GuardContext) -> Result<bool> {
        if ctx.repository.is_empty() || !self.0.has_credential() {
            return Ok(false);
        }
        let message = self
            .0
            .latest_commit_message(&ctx.repository, &draft_path(&ctx.short_id))
            .await?;
        Ok(message.is_some_and(|m| m.to_lowercase().contains("[approved]")))
    }
}
