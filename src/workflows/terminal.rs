use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::types::{STATE_CANCELLED, STATE_COMPLETED, STATE_EXPIRED, STATE_FAILED};

/// Labels that are terminal under every configuration
pub const BUILT_IN_TERMINAL_STATES: [&str; 3] = [STATE_COMPLETED, STATE_FAILED, STATE_EXPIRED];

/// The set of state labels the engine treats as terminal.
///
/// Always contains `COMPLETED`, `FAILED` and `EXPIRED`; configuration can
/// only add labels. Everything outside the set is active. Labels are matched
/// exactly, so an intermediate label such as `COMPLETING` stays active
/// unless configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TerminalStates(BTreeSet<String>);

impl Default for TerminalStates {
    fn default() -> Self {
        Self::new([STATE_CANCELLED])
    }
}

impl From<Vec<String>> for TerminalStates {
    fn from(states: Vec<String>) -> Self {
        Self::new(states)
    }
}

impl From<TerminalStates> for Vec<String> {
    fn from(states: TerminalStates) -> Self {
        states.0.into_iter().collect()
    }
}

impl TerminalStates {
    /// The built-in labels plus `extra`. Blank labels are dropped.
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            BUILT_IN_TERMINAL_STATES
                .iter()
                .map(|s| s.to_string())
                .chain(extra.into_iter().map(Into::into))
                .filter(|s: &String| !s.trim().is_empty())
                .collect(),
        )
    }

    pub fn with(mut self, state: impl Into<String>) -> Self {
        self.0.insert(state.into());
        self
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.0.contains(state)
    }

    pub fn is_active(&self, state: &str) -> bool {
        !self.is_terminal(state)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}
