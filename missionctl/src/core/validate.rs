//! Static validation of a workflow document before it is committed.
//!
//! Every finding names the offending pipeline and a remediation. Hard errors
//! abort a load; warnings are logged and loading proceeds.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::graph::{MissionDef, PostCheck};
use crate::core::schedule::Cadence;
use crate::core::states::{
    INBOX_STATE, PLACEHOLDER_STATE, StateVocabulary, TERMINAL_STATE, is_well_formed,
};
use crate::core::types::AgentBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => f.write_str("error"),
            Self::Warning => f.write_str("warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    /// Pipeline the finding is about; `None` for document-level findings.
    pub mission: Option<String>,
    pub message: String,
    pub remediation: String,
}

impl Finding {
    fn error(mission: Option<&str>, message: String, remediation: &str) -> Self {
        Self {
            severity: Severity::Error,
            mission: mission.map(str::to_string),
            message,
            remediation: remediation.to_string(),
        }
    }

    fn warning(mission: Option<&str>, message: String, remediation: &str) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(mission, message, remediation)
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.severity)?;
        if let Some(mission) = &self.mission {
            write!(f, "mission '{mission}': ")?;
        }
        write!(f, "{} (fix: {})", self.message, self.remediation)
    }
}

/// Names registered in the guard and action registries.
#[derive(Debug, Clone, Default)]
pub struct KnownNames {
    pub guards: BTreeSet<String>,
    pub actions: BTreeSet<String>,
}

/// Built-in states plus every state declared by any mission.
///
/// Malformed declarations are skipped here and reported by [`validate`].
pub fn vocabulary(missions: &BTreeMap<String, MissionDef>) -> StateVocabulary {
    let mut vocab = StateVocabulary::default();
    for def in missions.values() {
        for state in &def.states {
            vocab.register(state);
        }
    }
    vocab
}

pub fn validate(
    missions: &BTreeMap<String, MissionDef>,
    agents: &[AgentBinding],
    known: &KnownNames,
    default_cycle_minutes: u32,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    if missions.is_empty() {
        findings.push(Finding::error(
            None,
            "no missions defined".to_string(),
            "add at least one [missions.<name>] table",
        ));
    }

    let vocab = vocabulary(missions);
    for (name, def) in missions {
        validate_mission(name, def, missions, agents, known, &vocab, &mut findings);
    }
    validate_agents(missions, agents, default_cycle_minutes, &mut findings);
    findings
}

fn validate_mission(
    name: &str,
    def: &MissionDef,
    missions: &BTreeMap<String, MissionDef>,
    agents: &[AgentBinding],
    known: &KnownNames,
    vocab: &StateVocabulary,
    findings: &mut Vec<Finding>,
) {
    let m = Some(name);

    for state in &def.states {
        if !is_well_formed(state) {
            findings.push(Finding::error(
                m,
                format!("invalid state name '{state}'"),
                "state names are UPPER_SNAKE_CASE",
            ));
        }
    }

    if def.transitions.is_empty() {
        findings.push(Finding::error(
            m,
            "no transitions".to_string(),
            "declare at least one transition",
        ));
        return;
    }

    for (i, t) in def.transitions.iter().enumerate() {
        if t.from.is_empty() || t.to.is_empty() {
            findings.push(Finding::error(
                m,
                format!("transition {i}: missing from/to"),
                "every transition needs both `from` and `to`",
            ));
            continue;
        }
        for state in [&t.from, &t.to] {
            if !vocab.contains(state) {
                findings.push(Finding::error(
                    m,
                    format!(
                        "transition {i}: unknown state '{state}' (valid: {})",
                        vocab.listing()
                    ),
                    "use a known state or add it to the mission's `states`",
                ));
            }
        }
        if let Some(guard) = &t.guard
            && !known.guards.contains(guard)
        {
            findings.push(Finding::error(
                m,
                format!("transition {i}: unknown guard '{guard}'"),
                "register the guard or fix the name",
            ));
        }
    }

    if !vocab.contains(&def.initial_state) {
        findings.push(Finding::error(
            m,
            format!("initial_state '{}' is not a known state", def.initial_state),
            "use a known state or add it to the mission's `states`",
        ));
    }
    if def.initial_state != TERMINAL_STATE && def.outgoing(&def.initial_state).next().is_none() {
        findings.push(Finding::error(
            m,
            format!(
                "initial_state '{}' has no outgoing transitions",
                def.initial_state
            ),
            "add a transition out of the initial state",
        ));
    }

    let reachable = def.reachable();
    check_completion(name, def, missions, &reachable, findings);
    check_state_agents(name, def, agents, &reachable, findings);
    check_stages(name, def, known, &reachable, findings);
}

fn check_completion(
    name: &str,
    def: &MissionDef,
    missions: &BTreeMap<String, MissionDef>,
    reachable: &BTreeSet<String>,
    findings: &mut Vec<Finding>,
) {
    let m = Some(name);
    if reachable.contains(TERMINAL_STATE) {
        return;
    }
    let Some(delegate) = def.verify_delegate() else {
        findings.push(Finding::error(
            m,
            format!("no path to {TERMINAL_STATE}"),
            "add transitions reaching DONE or set verify_strategy",
        ));
        return;
    };
    let Some(delegate_def) = missions.get(delegate) else {
        findings.push(Finding::error(
            m,
            format!("verify_strategy names unknown mission '{delegate}'"),
            "point verify_strategy at a defined mission or set it to \"none\"",
        ));
        return;
    };
    if !reachable.contains(&delegate_def.initial_state) {
        findings.push(Finding::error(
            m,
            format!(
                "no path to {TERMINAL_STATE}: verify_strategy '{delegate}' starts at '{}', which is not reachable",
                delegate_def.initial_state
            ),
            "add a transition reaching the delegate's initial state",
        ));
    }
}

fn check_state_agents(
    name: &str,
    def: &MissionDef,
    agents: &[AgentBinding],
    reachable: &BTreeSet<String>,
    findings: &mut Vec<Finding>,
) {
    let m = Some(name);
    for state in reachable {
        // Holding states belong to whoever the task is assigned to.
        if def.is_terminal(state) || state == PLACEHOLDER_STATE || state == INBOX_STATE {
            continue;
        }
        if def.role_for(state).is_none() {
            findings.push(Finding::error(
                m,
                format!("state '{state}' missing coverage in state_agents"),
                "map every non-terminal state to a role",
            ));
        }
    }

    for (state, role) in &def.state_agents {
        let holders: Vec<&str> = agents
            .iter()
            .filter(|a| &a.role == role)
            .map(|a| a.id.as_str())
            .collect();
        match holders.as_slice() {
            [] => findings.push(Finding::error(
                m,
                format!("state_agents['{state}'] = '{role}': no agent has this role"),
                "add an agent with this role or fix the role name",
            )),
            [_] => {}
            [first, ..] => findings.push(Finding::warning(
                m,
                format!(
                    "role '{role}' matches multiple agents ({}); first match '{first}' wins",
                    holders.join(", ")
                ),
                "give each role a single agent to make hand-offs deterministic",
            )),
        }
    }
}

fn check_stages(
    name: &str,
    def: &MissionDef,
    known: &KnownNames,
    reachable: &BTreeSet<String>,
    findings: &mut Vec<Finding>,
) {
    let m = Some(name);
    let pipeline_states = def.pipeline_states();
    for (state, stage) in &def.stages {
        if !reachable.contains(state) {
            findings.push(Finding::warning(
                m,
                format!("stage '{state}' is not reachable by any transition"),
                "remove the stage or add a transition into it",
            ));
        }
        if let Some(raw) = &stage.post_check {
            match PostCheck::parse(raw) {
                None => findings.push(Finding::error(
                    m,
                    format!(
                        "stage '{state}': unknown post_check '{raw}' (allowed: {})",
                        PostCheck::ALLOWED.join(", ")
                    ),
                    "use one of the allowed post_check values",
                )),
                Some(PostCheck::ReviewApproved)
                    if !pipeline_states.contains(stage.revision_state()) =>
                {
                    findings.push(Finding::error(
                        m,
                        format!(
                            "stage '{state}': revision_state '{}' is not a state of this mission",
                            stage.revision_state()
                        ),
                        "set revision_state to a state reachable in this mission",
                    ));
                }
                Some(_) => {}
            }
        }
        for action in stage.pre_actions.iter().chain(&stage.post_actions) {
            if !known.actions.contains(&action.action) {
                findings.push(Finding::error(
                    m,
                    format!("stage '{state}': unknown action '{}'", action.action),
                    "register the action or fix the name",
                ));
            }
        }
    }
}

fn validate_agents(
    missions: &BTreeMap<String, MissionDef>,
    agents: &[AgentBinding],
    default_cycle_minutes: u32,
    findings: &mut Vec<Finding>,
) {
    let mut ids = BTreeSet::new();
    // (mission, cycle, offset) -> agent ids
    let mut slots: BTreeMap<(&str, u32, u32), Vec<&str>> = BTreeMap::new();

    for agent in agents {
        if !ids.insert(agent.id.as_str()) {
            findings.push(Finding::error(
                None,
                format!("agent '{}' is declared more than once", agent.id),
                "agent ids must be unique",
            ));
        }
        if let Some(mission) = &agent.mission
            && !missions.contains_key(mission)
        {
            findings.push(Finding::error(
                None,
                format!("agent '{}': unknown mission '{mission}'", agent.id),
                "bind the agent to a defined mission",
            ));
        }
        let cadence = Cadence::for_agent(agent, default_cycle_minutes);
        if let Some(problem) = cadence.check() {
            findings.push(Finding::error(
                agent.mission.as_deref(),
                format!("agent '{}': {problem}", agent.id),
                "pick an offset inside the cycle and a cycle that divides the hour",
            ));
        }
        if let Some(mission) = &agent.mission {
            slots
                .entry((mission.as_str(), cadence.cycle_minutes(), cadence.offset()))
                .or_default()
                .push(agent.id.as_str());
        }
    }

    for ((mission, _, offset), holders) in slots {
        if holders.len() > 1 {
            findings.push(Finding::warning(
                Some(mission),
                format!(
                    "agents {} share the same heartbeat_offset={offset}",
                    holders.join(", ")
                ),
                "stagger heartbeat_offset to avoid a thundering herd",
            ));
        }
    }
}
