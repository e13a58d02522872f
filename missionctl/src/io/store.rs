//! Task store contract and the in-memory implementation.
//!
//! [`MemoryStore`] optionally mirrors its state to a JSON snapshot after every
//! mutation (atomic temp-file + rename) and reloads it on open, so tasks,
//! assignments, heartbeats and alert records survive restarts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::types::{
    Activity, ActivityKind, AlertRecord, Assignment, HeartbeatRecord, StageCommit, Task, TaskId,
};
use crate::io::config::write_atomic;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: Task) -> Result<()>;
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;
    /// All tasks, oldest first.
    async fn all_tasks(&self) -> Result<Vec<Task>>;
    async fn tasks_in_status(&self, status: &str) -> Result<Vec<Task>>;
    /// Tasks currently assigned to `worker`, oldest first.
    async fn tasks_for_worker(&self, worker: &str) -> Result<Vec<Task>>;

    async fn assignments(&self, id: &TaskId) -> Result<Vec<Assignment>>;
    /// Replace every assignment row of the task with one for `worker`.
    async fn assign(&self, id: &TaskId, worker: &str, at: DateTime<Utc>) -> Result<()>;

    /// Apply a stage outcome atomically: status, activity note and optional
    /// reassignment land together or not at all.
    async fn commit(&self, commit: StageCommit) -> Result<()>;
    async fn activities(&self, id: &TaskId) -> Result<Vec<Activity>>;

    async fn record_heartbeat(&self, worker: &str, at: DateTime<Utc>) -> Result<()>;
    async fn heartbeats(&self) -> Result<Vec<HeartbeatRecord>>;

    /// Alert whose description starts with `prefix`.
    async fn find_alert(&self, prefix: &str) -> Result<Option<AlertRecord>>;
    /// Insert `alert`, replacing any record whose description starts with `prefix`.
    async fn upsert_alert(&self, prefix: &str, alert: AlertRecord) -> Result<()>;
    async fn alerts(&self) -> Result<Vec<AlertRecord>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreState {
    tasks: BTreeMap<TaskId, Task>,
    assignments: Vec<Assignment>,
    activities: Vec<Activity>,
    heartbeats: BTreeMap<String, DateTime<Utc>>,
    alerts: Vec<AlertRecord>,
}

impl StoreState {
    fn sorted(&self, keep: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().filter(|t| keep(t)).cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    fn reassign(&mut self, id: &TaskId, worker: &str, at: DateTime<Utc>) {
        self.assignments.retain(|a| &a.task_id != id);
        self.assignments.push(Assignment {
            task_id: id.clone(),
            worker: worker.to_string(),
            assigned_at: at,
        });
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by a JSON snapshot at `path`, loaded when present.
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read state {}", path.display()))?;
            let state: StoreState = serde_json::from_str(&raw)
                .with_context(|| format!("parse state {}", path.display()))?;
            info!(path = %path.display(), tasks = state.tasks.len(), "state loaded");
            state
        } else {
            StoreState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            snapshot: Some(path.to_path_buf()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }
        let mut payload = serde_json::to_string_pretty(state).context("serialize state")?;
        payload.push('\n');
        write_atomic(path, &payload)?;
        debug!(path = %path.display(), "state persisted");
        Ok(())
    }

    /// Apply `mutate` and persist; on a persistence failure the in-memory state
    /// is rolled back.
    fn mutate<T>(&self, mutate: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        let backup = serde_json::to_value(&*state).context("snapshot state")?;
        let out = mutate(&mut state)?;
        if let Err(err) = self.persist(&state) {
            *state = serde_json::from_value(backup).context("restore state")?;
            return Err(err);
        }
        Ok(out)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: Task) -> Result<()> {
        self.mutate(|state| {
            if state.tasks.contains_key(&task.id) {
                return Err(anyhow!("task {} already exists", task.id));
            }
            state.tasks.insert(task.id.clone(), task);
            Ok(())
        })
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.lock().tasks.get(id).cloned())
    }

    async fn all_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.lock().sorted(|_| true))
    }

    async fn tasks_in_status(&self, status: &str) -> Result<Vec<Task>> {
        Ok(self.lock().sorted(|t| t.status == status))
    }

    async fn tasks_for_worker(&self, worker: &str) -> Result<Vec<Task>> {
        let state = self.lock();
        Ok(state.sorted(|t| {
            state
                .assignments
                .iter()
                .any(|a| a.task_id == t.id && a.worker == worker)
        }))
    }

    async fn assignments(&self, id: &TaskId) -> Result<Vec<Assignment>> {
        Ok(self
            .lock()
            .assignments
            .iter()
            .filter(|a| &a.task_id == id)
            .cloned()
            .collect())
    }

    async fn assign(&self, id: &TaskId, worker: &str, at: DateTime<Utc>) -> Result<()> {
        self.mutate(|state| {
            if !state.tasks.contains_key(id) {
                return Err(anyhow!("unknown task {id}"));
            }
            state.reassign(id, worker, at);
            Ok(())
        })
    }

    async fn commit(&self, commit: StageCommit) -> Result<()> {
        self.mutate(|state| {
            let task = state
                .tasks
                .get_mut(&commit.task_id)
                .ok_or_else(|| anyhow!("unknown task {}", commit.task_id))?;
            if let Some(status) = &commit.status {
                task.status.clone_from(status);
            }
            task.updated_at = commit.note.at;
            let at = commit.note.at;
            let from_state = commit.note.to_state.clone();
            state.activities.push(commit.note);
            if let Some(worker) = &commit.reassign_to {
                state.reassign(&commit.task_id, worker, at);
                state.activities.push(Activity {
                    task_id: commit.task_id.clone(),
                    kind: ActivityKind::Reassigned,
                    worker: Some(worker.clone()),
                    to_state: from_state.clone(),
                    from_state,
                    message: format!("Reassigned to {worker}"),
                    at,
                });
            }
            Ok(())
        })
    }

    async fn activities(&self, id: &TaskId) -> Result<Vec<Activity>> {
        Ok(self
            .lock()
            .activities
            .iter()
            .filter(|a| &a.task_id == id)
            .cloned()
            .collect())
    }

    async fn record_heartbeat(&self, worker: &str, at: DateTime<Utc>) -> Result<()> {
        self.mutate(|state| {
            state.heartbeats.insert(worker.to_string(), at);
            Ok(())
        })
    }

    async fn heartbeats(&self) -> Result<Vec<HeartbeatRecord>> {
        Ok(self
            .lock()
            .heartbeats
            .iter()
            .map(|(worker, at)| HeartbeatRecord {
                worker: worker.clone(),
                last_fired_at: *at,
            })
            .collect())
    }

    async fn find_alert(&self, prefix: &str) -> Result<Option<AlertRecord>> {
        Ok(self
            .lock()
            .alerts
            .iter()
            .find(|a| a.description.starts_with(prefix))
            .cloned())
    }

    async fn upsert_alert(&self, prefix: &str, alert: AlertRecord) -> Result<()> {
        self.mutate(|state| {
            match state
                .alerts
                .iter_mut()
                .find(|a| a.description.starts_with(prefix))
            {
                Some(existing) => *existing = alert,
                None => state.alerts.push(alert),
            }
            Ok(())
        })
    }

    async fn alerts(&self) -> Result<Vec<AlertRecord>> {
        Ok(self.lock().alerts.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, minute, 0)
            .single()
            .expect("valid time")
    }

    fn note(task: &Task, to: &str, minute: u32) -> Activity {
        Activity {
            task_id: task.id.clone(),
            kind: ActivityKind::Transition,
            worker: Some("dev".to_string()),
            from_state: task.status.clone(),
            to_state: to.to_string(),
            message: format!("build: {} → {to}", task.status),
            at: at(minute),
        }
    }

    #[tokio::test]
    async fn commit_moves_status_and_replaces_assignment() {
        let store = MemoryStore::new();
        let task = Task::new("Fix login", "", "build", "IN_PROGRESS", at(0));
        store.insert_task(task.clone()).await.expect("insert");
        store.assign(&task.id, "dev", at(0)).await.expect("assign");
        store.assign(&task.id, "dev2", at(1)).await.expect("reassign");
        assert_eq!(store.assignments(&task.id).await.expect("rows").len(), 1);

        store
            .commit(StageCommit {
                task_id: task.id.clone(),
                status: Some("REVIEW".to_string()),
                note: note(&task, "REVIEW", 5),
                reassign_to: Some("qa".to_string()),
            })
            .await
            .expect("commit");

        let stored = store.get_task(&task.id).await.expect("get").expect("task");
        assert_eq!(stored.status, "REVIEW");
        assert_eq!(stored.updated_at, at(5));
        let rows = store.assignments(&task.id).await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].worker, "qa");
        let kinds: Vec<ActivityKind> = store
            .activities(&task.id)
            .await
            .expect("activities")
            .iter()
            .map(|a| a.kind)
            .collect();
        assert_eq!(kinds, vec![ActivityKind::Transition, ActivityKind::Reassigned]);
        assert!(store.tasks_for_worker("dev2").await.expect("tasks").is_empty());
        assert_eq!(store.tasks_for_worker("qa").await.expect("tasks").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = MemoryStore::new();
        let task = Task::new("t", "", "build", "ASSIGNED", at(0));
        store.insert_task(task.clone()).await.expect("insert");
        assert!(store.insert_task(task).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("state.json");
        let task = Task::new("t", "", "build", "ASSIGNED", at(0));
        {
            let store = MemoryStore::open(&path).expect("open");
            store.insert_task(task.clone()).await.expect("insert");
            store.record_heartbeat("dev", at(3)).await.expect("heartbeat");
        }
        let reopened = MemoryStore::open(&path).expect("reopen");
        assert_eq!(reopened.get_task(&task.id).await.expect("get"), Some(task));
        let beats = reopened.heartbeats().await.expect("heartbeats");
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].last_fired_at, at(3));
    }

    #[tokio::test]
    async fn alerts_upsert_by_prefix() {
        let store = MemoryStore::new();
        let alert = |count: u32| AlertRecord {
            mission_type: "content".to_string(),
            description: "Guard 'g' blocked A→B in content: seen often".to_string(),
            suggestion: String::new(),
            occurrence_count: count,
            confidence: 0.6,
            last_seen: at(0),
        };
        store.upsert_alert("Guard 'g'", alert(3)).await.expect("insert");
        store.upsert_alert("Guard 'g'", alert(4)).await.expect("update");
        let alerts = store.alerts().await.expect("alerts");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].occurrence_count, 4);
        assert!(store.find_alert("Guard 'h'").await.expect("find").is_none());
    }
}
