//! Dynamic state vocabulary.
//!
//! States are not a closed enum: the built-in set grows with whatever each
//! mission declares. Membership is checked at load time and on every write.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// Placeholder for tasks that are assigned but not yet inside a pipeline.
pub const PLACEHOLDER_STATE: &str = "ASSIGNED";
/// The system-wide terminal state.
pub const TERMINAL_STATE: &str = "DONE";
/// Default target of a `review_approved` revision loop.
pub const DEFAULT_REVISION_STATE: &str = "DRAFT";
/// State new tasks are created in before any assignment.
pub const INBOX_STATE: &str = "INBOX";

pub const BUILTIN_STATES: [&str; 6] = [
    INBOX_STATE,
    PLACEHOLDER_STATE,
    "IN_PROGRESS",
    "REVIEW",
    TERMINAL_STATE,
    "BLOCKED",
];

static STATE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").expect("state name regex is valid"));

/// True if `name` has the shape of a state (`UPPER_SNAKE`).
pub fn is_well_formed(name: &str) -> bool {
    STATE_NAME_RE.is_match(name)
}

/// Registered set of valid state names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateVocabulary {
    states: BTreeSet<String>,
}

impl Default for StateVocabulary {
    fn default() -> Self {
        Self {
            states: BUILTIN_STATES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl StateVocabulary {
    /// Register a custom state. Returns `false` if the name is malformed.
    pub fn register(&mut self, name: &str) -> bool {
        if !is_well_formed(name) {
            return false;
        }
        self.states.insert(name.to_string());
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.states.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(String::as_str)
    }

    /// Comma-separated listing used in error messages.
    pub fn listing(&self) -> String {
        self.iter().collect::<Vec<_>>().join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_states_are_registered() {
        let vocab = StateVocabulary::default();
        for state in BUILTIN_STATES {
            assert!(vocab.contains(state), "{state}");
        }
        assert!(!vocab.contains("RESEARCH"));
    }

    #[test]
    fn register_rejects_malformed_names() {
        let mut vocab = StateVocabulary::default();
        assert!(vocab.register("RESEARCH"));
        assert!(vocab.contains("RESEARCH"));
        assert!(!vocab.register("draft"));
        assert!(!vocab.register("1ST"));
        assert!(!vocab.register(""));
        assert!(!vocab.contains("draft"));
    }

    #[test]
    fn listing_is_sorted() {
        let vocab = StateVocabulary::default();
        assert_eq!(
            vocab.listing(),
            "ASSIGNED, BLOCKED, DONE, INBOX, IN_PROGRESS, REVIEW"
        );
    }
}
