//! Shared deterministic types for the control-plane core.
//!
//! These types define stable contracts between the loader, the execution loop
//! and the task store. They carry no behavior that touches I/O.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque task identifier (lower-case ULID).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short identifier embedded in branch names (`{worker}/{short_id}`).
    ///
    /// ULIDs lead with a millisecond timestamp, so the random tail is used.
    pub fn short(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let start = chars.len().saturating_sub(8);
        chars[start..].iter().collect::<String>().to_lowercase()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work moving through one mission pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    /// Name of the current state; only valid within the mission's vocabulary.
    pub status: String,
    pub mission_type: String,
    /// Task-level configuration merged over the mission's `default_config`.
    #[serde(default)]
    pub mission_config: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        mission_type: impl Into<String>,
        status: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            title: title.into(),
            description: description.into(),
            status: status.into(),
            mission_type: mission_type.into(),
            mission_config: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// String value from `mission_config`, ignoring non-string entries.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.mission_config.get(key).and_then(Value::as_str)
    }
}

/// One row binding a task to the worker that currently owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub worker: String,
    pub assigned_at: DateTime<Utc>,
}

/// Kind of structured activity note written alongside a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Promoted,
    Transition,
    Failure,
    Reassigned,
}

/// Structured activity note visible to task submitters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub task_id: TaskId,
    pub kind: ActivityKind,
    pub worker: Option<String>,
    pub from_state: String,
    pub to_state: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Last time a worker's wake-up fired, persisted for the watchdog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub worker: String,
    pub last_fired_at: DateTime<Utc>,
}

/// Persisted alert raised by the guard-block monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub mission_type: String,
    /// Human-readable description; starts with a stable per-tuple prefix.
    pub description: String,
    pub suggestion: String,
    pub occurrence_count: u32,
    pub confidence: f64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentLevel {
    /// Leads also review tasks delegated to their pipeline.
    Lead,
    #[default]
    Specialist,
}

fn default_always_run_timeout() -> u64 {
    60
}

/// Prompt run at the start of every wake-up, before work discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlwaysRun {
    pub prompt: String,
    #[serde(default = "default_always_run_timeout")]
    pub timeout_secs: u64,
}

/// One `[[agents]]` entry: a worker identity bound to a role and a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentBinding {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub mission: Option<String>,
    #[serde(default)]
    pub level: AgentLevel,
    /// Minute offset inside the wake-up cycle.
    #[serde(default)]
    pub heartbeat_offset: u32,
    /// Cycle length in seconds; 3600 or more means hourly. Unset uses the
    /// control-plane default cycle.
    #[serde(default)]
    pub heartbeat_interval: Option<u64>,
    #[serde(default)]
    pub always_run: Option<AlwaysRun>,
}

impl AgentBinding {
    pub fn new(id: &str, role: &str, mission: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            role: role.to_string(),
            mission: mission.map(str::to_string),
            level: AgentLevel::default(),
            heartbeat_offset: 0,
            heartbeat_interval: None,
            always_run: None,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Atomic write applied by the execution loop at the end of a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageCommit {
    pub task_id: TaskId,
    /// New status; `None` keeps the current one.
    pub status: Option<String>,
    pub note: Activity,
    /// Destructive-replace the task's assignment rows with this worker.
    pub reassign_to: Option<String>,
}
