//! Workflow document loader.
//!
//! Parses the declarative pipeline document (`workflows.toml`), validates it
//! against the registered guards and actions, and publishes an immutable
//! [`Workflows`] snapshot. Reload swaps the snapshot only when the new
//! document is free of hard errors.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::core::graph::MissionDef;
use crate::core::states::{INBOX_STATE, PLACEHOLDER_STATE, StateVocabulary};
use crate::core::types::AgentBinding;
use crate::core::validate::{Finding, KnownNames, validate, vocabulary};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("read workflow document {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse workflow document {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid workflow document: {}", summarize(.findings))]
    Invalid { findings: Vec<Finding> },
}

fn summarize(findings: &[Finding]) -> String {
    findings
        .iter()
        .filter(|f| f.is_error())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Deserialize)]
struct WorkflowDoc {
    #[serde(default)]
    missions: BTreeMap<String, MissionDef>,
    #[serde(default)]
    agents: Vec<AgentBinding>,
}

/// One validated, immutable set of mission definitions and agent bindings.
#[derive(Debug, Clone)]
pub struct Workflows {
    missions: BTreeMap<String, MissionDef>,
    agents: Vec<AgentBinding>,
    vocab: StateVocabulary,
    warnings: Vec<Finding>,
}

impl Workflows {
    /// Parse and validate a document. Warnings are kept; any hard error fails.
    pub fn compile(
        source: &str,
        origin: &Path,
        known: &KnownNames,
        default_cycle_minutes: u32,
    ) -> Result<Self, LoadError> {
        let doc: WorkflowDoc = toml::from_str(source).map_err(|source| LoadError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        let mut missions = doc.missions;
        for (name, def) in &mut missions {
            def.name.clone_from(name);
        }
        let findings = validate(&missions, &doc.agents, known, default_cycle_minutes);
        if findings.iter().any(Finding::is_error) {
            return Err(LoadError::Invalid { findings });
        }
        Ok(Self {
            vocab: vocabulary(&missions),
            missions,
            agents: doc.agents,
            warnings: findings,
        })
    }

    pub fn warnings(&self) -> &[Finding] {
        &self.warnings
    }

    pub fn mission_names(&self) -> impl Iterator<Item = &str> {
        self.missions.keys().map(String::as_str)
    }

    pub fn get_mission_def(&self, mission: &str) -> Option<&MissionDef> {
        self.missions.get(mission)
    }

    pub fn get_state_agents(&self, mission: &str) -> Option<&BTreeMap<String, String>> {
        self.missions.get(mission).map(|def| &def.state_agents)
    }

    pub fn validate_transition(&self, mission: &str, from: &str, to: &str) -> bool {
        self.missions
            .get(mission)
            .is_some_and(|def| def.validate_transition(from, to))
    }

    pub fn get_transition_guard(&self, mission: &str, from: &str, to: &str) -> Option<&str> {
        self.missions.get(mission)?.edge_guard(from, to)
    }

    /// Every state known to the runtime: built-ins plus declared ones.
    pub fn get_all_states(&self) -> &StateVocabulary {
        &self.vocab
    }

    /// States a task of `mission` may occupy: its pipeline and declared states
    /// plus those of its verify delegate.
    pub fn mission_states(&self, mission: &str) -> BTreeSet<String> {
        let mut states = BTreeSet::new();
        let Some(def) = self.missions.get(mission) else {
            return states;
        };
        let mut collect = |def: &MissionDef| {
            states.extend(def.pipeline_states().into_iter().map(str::to_string));
            states.extend(def.states.iter().cloned());
        };
        collect(def);
        if let Some(delegate) = def.verify_delegate().and_then(|d| self.missions.get(d)) {
            collect(delegate);
        }
        states
    }

    /// Whether `status` may be written for a task of `mission`.
    pub fn accepts_status(&self, mission: &str, status: &str) -> bool {
        self.vocab.contains(status)
            && (status == PLACEHOLDER_STATE
                || status == INBOX_STATE
                || self.mission_states(mission).contains(status))
    }

    pub fn agents(&self) -> &[AgentBinding] {
        &self.agents
    }

    pub fn agent(&self, id: &str) -> Option<&AgentBinding> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// First declared agent holding `role`.
    pub fn find_worker_for_role(&self, role: &str) -> Option<&AgentBinding> {
        self.agents.iter().find(|a| a.role == role)
    }

    /// Missions that hand completion to `mission` through `verify_strategy`.
    pub fn delegators_of(&self, mission: &str) -> Vec<&MissionDef> {
        self.missions
            .values()
            .filter(|def| def.verify_delegate() == Some(mission))
            .collect()
    }
}

/// Owns the live [`Workflows`] snapshot and reloads it from disk.
pub struct WorkflowLoader {
    path: PathBuf,
    known: KnownNames,
    default_cycle_minutes: u32,
    current: RwLock<Arc<Workflows>>,
}

impl WorkflowLoader {
    pub fn load(
        path: &Path,
        known: KnownNames,
        default_cycle_minutes: u32,
    ) -> Result<Self, LoadError> {
        let workflows = read_and_compile(path, &known, default_cycle_minutes)?;
        log_warnings(&workflows);
        info!(
            path = %path.display(),
            missions = workflows.missions.len(),
            agents = workflows.agents.len(),
            "workflows loaded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            known,
            default_cycle_minutes,
            current: RwLock::new(Arc::new(workflows)),
        })
    }

    /// Wrap an already compiled snapshot; `reload` reads `path`.
    pub fn from_workflows(
        path: &Path,
        workflows: Workflows,
        known: KnownNames,
        default_cycle_minutes: u32,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            known,
            default_cycle_minutes,
            current: RwLock::new(Arc::new(workflows)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<Workflows> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the document. On any error the current snapshot stays live.
    pub fn reload(&self) -> Result<(), LoadError> {
        match read_and_compile(&self.path, &self.known, self.default_cycle_minutes) {
            Ok(workflows) => {
                log_warnings(&workflows);
                *self
                    .current
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Arc::new(workflows);
                info!(path = %self.path.display(), "workflows reloaded");
                Ok(())
            }
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "workflow reload rejected, keeping previous definitions");
                Err(err)
            }
        }
    }
}

fn read_and_compile(
    path: &Path,
    known: &KnownNames,
    default_cycle_minutes: u32,
) -> Result<Workflows, LoadError> {
    let source = fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Workflows::compile(&source, path, known, default_cycle_minutes)
}

fn log_warnings(workflows: &Workflows) {
    for finding in &workflows.warnings {
        warn!(mission = ?finding.mission, remediation = %finding.remediation, "{}", finding.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{SAMPLE_WORKFLOWS, known_names};

    fn compile(source: &str) -> Result<Workflows, LoadError> {
        Workflows::compile(source, Path::new("workflows.toml"), &known_names(), 15)
    }

    #[test]
    fn sample_document_loads_cleanly() {
        let workflows = compile(SAMPLE_WORKFLOWS).expect("compile");
        let names: Vec<&str> = workflows.mission_names().collect();
        assert_eq!(names, vec!["build", "content", "verify"]);
        assert!(workflows.warnings().is_empty(), "{:?}", workflows.warnings());
        let build = workflows.get_mission_def("build").expect("build");
        assert_eq!(build.name, "build");
        assert!(workflows.validate_transition("build", "IN_PROGRESS", "REVIEW"));
        assert!(!workflows.validate_transition("build", "REVIEW", "DONE"));
        assert_eq!(
            workflows.get_transition_guard("build", "IN_PROGRESS", "REVIEW"),
            Some("has_open_pr")
        );
        assert!(workflows.get_all_states().contains("RESEARCH"));
    }

    #[test]
    fn mission_states_include_verify_delegate() {
        let workflows = compile(SAMPLE_WORKFLOWS).expect("compile");
        let states = workflows.mission_states("build");
        assert!(states.contains("IN_PROGRESS"));
        assert!(states.contains("DONE"));
        assert!(!states.contains("RESEARCH"));
        assert!(workflows.accepts_status("build", "DONE"));
        assert!(workflows.accepts_status("build", "INBOX"));
        assert!(!workflows.accepts_status("build", "DRAFT"));
        assert!(!workflows.accepts_status("build", "NOT_A_STATE"));
    }

    #[test]
    fn delegators_and_roles() {
        let workflows = compile(SAMPLE_WORKFLOWS).expect("compile");
        let delegators: Vec<&str> = workflows
            .delegators_of("verify")
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(delegators, vec!["build"]);
        assert_eq!(
            workflows.find_worker_for_role("writer").map(|a| a.id.as_str()),
            Some("quill")
        );
        assert!(workflows.find_worker_for_role("nobody").is_none());
    }

    #[test]
    fn unknown_guard_aborts_with_one_error() {
        let source = SAMPLE_WORKFLOWS.replace("guard = \"has_open_pr\"", "guard = \"nonexistent_guard\"");
        let err = compile(&source).expect_err("invalid");
        let LoadError::Invalid { findings } = err else {
            panic!("expected Invalid");
        };
        let errors: Vec<&Finding> = findings.iter().filter(|f| f.is_error()).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("nonexistent_guard"));
        assert_eq!(errors[0].mission.as_deref(), Some("build"));
    }

    #[test]
    fn parse_errors_are_typed() {
        let err = compile("missions = [").expect_err("parse");
        assert!(matches!(err, LoadError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = WorkflowLoader::load(&temp.path().join("nope.toml"), known_names(), 15)
            .err()
            .expect("missing");
        assert!(matches!(err, LoadError::Read { .. }));
    }

    #[test]
    fn reload_is_all_or_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("workflows.toml");
        fs::write(&path, SAMPLE_WORKFLOWS).expect("write");
        let loader = WorkflowLoader::load(&path, known_names(), 15).expect("load");
        let before = loader.snapshot();

        fs::write(&path, SAMPLE_WORKFLOWS.replace("has_task_pr", "nonexistent_guard"))
            .expect("write");
        assert!(loader.reload().is_err());
        let after = loader.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(
            after.get_transition_guard("verify", "REVIEW", "DONE"),
            Some("has_task_pr")
        );
    }

    #[test]
    fn reloading_unchanged_document_keeps_lookups() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("workflows.toml");
        fs::write(&path, SAMPLE_WORKFLOWS).expect("write");
        let loader = WorkflowLoader::load(&path, known_names(), 15).expect("load");
        let before = loader.snapshot();
        loader.reload().expect("reload");
        let after = loader.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        for name in before.mission_names() {
            assert_eq!(before.get_mission_def(name), after.get_mission_def(name));
            assert_eq!(before.mission_states(name), after.mission_states(name));
        }
        assert_eq!(before.agents(), after.agents());
    }
}
