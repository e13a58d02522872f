//! Compiled mission graph: states, ordered transitions and per-state stages.
//!
//! A [`MissionDef`] deserializes straight from one `[missions.<name>]` table of
//! the workflow document. It is immutable once loaded; reloads swap the whole
//! set.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::states::{DEFAULT_REVISION_STATE, PLACEHOLDER_STATE, TERMINAL_STATE};

/// Reserved guard marking the failure edge out of a state.
pub const ERROR_GUARD: &str = "has_error";
/// Value of `verify_strategy` that disables delegation.
pub const NO_VERIFY: &str = "none";

/// One `(from, to, guard)` edge, kept in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

impl Transition {
    pub fn is_error_edge(&self) -> bool {
        self.guard.as_deref() == Some(ERROR_GUARD)
    }
}

/// Named action plus its raw parameters (`{key}` placeholders unrendered).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub action: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl ActionConfig {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Fixed vocabulary of stage post-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostCheck {
    /// Deliverable must exist as an open change request in the system of record.
    PrExists,
    /// Worker response must carry an approval (or revision) marker.
    ReviewApproved,
}

impl PostCheck {
    pub const ALLOWED: [&'static str; 2] = ["pr_exists", "review_approved"];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pr_exists" => Some(Self::PrExists),
            "review_approved" => Some(Self::ReviewApproved),
            _ => None,
        }
    }
}

/// Side effects and prompt for the stage that runs while a task sits in a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub pre_actions: Vec<ActionConfig>,
    pub prompt_template: Option<String>,
    /// Shared preamble rendered before `prompt_template`.
    pub prompt_base: Option<String>,
    pub post_actions: Vec<ActionConfig>,
    pub post_check: Option<String>,
    /// Target of a `review_approved` revision loop.
    pub revision_state: Option<String>,
    /// `false` marks a gate stage: no worker runs, only the edge guard decides.
    pub worker: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            pre_actions: Vec::new(),
            prompt_template: None,
            prompt_base: None,
            post_actions: Vec::new(),
            post_check: None,
            revision_state: None,
            worker: true,
        }
    }
}

impl StageConfig {
    pub fn post_check(&self) -> Option<PostCheck> {
        self.post_check.as_deref().and_then(PostCheck::parse)
    }

    pub fn revision_state(&self) -> &str {
        self.revision_state
            .as_deref()
            .unwrap_or(DEFAULT_REVISION_STATE)
    }
}

fn default_initial_state() -> String {
    PLACEHOLDER_STATE.to_string()
}

/// Compiled form of one declarative pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionDef {
    /// Filled from the table key by the loader.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_initial_state")]
    pub initial_state: String,
    /// Custom states registered into the vocabulary by this mission.
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub state_agents: BTreeMap<String, String>,
    #[serde(default)]
    pub stages: BTreeMap<String, StageConfig>,
    #[serde(default)]
    pub default_config: BTreeMap<String, Value>,
    #[serde(default)]
    pub verify_strategy: Option<String>,
}

impl MissionDef {
    /// Every state that appears in a transition, plus `initial_state`.
    pub fn pipeline_states(&self) -> BTreeSet<&str> {
        let mut states: BTreeSet<&str> = self
            .transitions
            .iter()
            .flat_map(|t| [t.from.as_str(), t.to.as_str()])
            .collect();
        states.insert(self.initial_state.as_str());
        states
    }

    /// Name of the pipeline that completes this one, if delegated.
    pub fn verify_delegate(&self) -> Option<&str> {
        self.verify_strategy
            .as_deref()
            .filter(|s| !s.is_empty() && *s != NO_VERIFY)
    }

    pub fn outgoing<'a>(&'a self, from: &'a str) -> impl Iterator<Item = &'a Transition> + 'a {
        self.transitions.iter().filter(move |t| t.from == from)
    }

    /// First declared non-error edge out of `from`.
    pub fn success_candidate(&self, from: &str) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.from == from && !t.is_error_edge())
    }

    /// Edge guarded by the reserved error marker out of `from`.
    pub fn error_edge(&self, from: &str) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.is_error_edge())
    }

    /// Guard bound to the specific `(from, to)` edge.
    pub fn edge_guard(&self, from: &str, to: &str) -> Option<&str> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
            .and_then(|t| t.guard.as_deref())
    }

    pub fn validate_transition(&self, from: &str, to: &str) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        state == TERMINAL_STATE || self.success_candidate(state).is_none()
    }

    pub fn role_for(&self, state: &str) -> Option<&str> {
        self.state_agents.get(state).map(String::as_str)
    }

    pub fn stage(&self, state: &str) -> Option<&StageConfig> {
        self.stages.get(state)
    }

    /// States reachable from `initial_state` (inclusive) over any edge.
    pub fn reachable(&self) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([self.initial_state.clone()]);
        while let Some(state) = queue.pop_front() {
            if !seen.insert(state.clone()) {
                continue;
            }
            for t in self.outgoing(&state) {
                if !seen.contains(&t.to) {
                    queue.push_back(t.to.clone());
                }
            }
        }
        seen
    }

    /// Task config merged over `default_config` (task entries win).
    pub fn merged_config(&self, task_config: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut merged = self.default_config.clone();
        for (key, value) in task_config {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}
