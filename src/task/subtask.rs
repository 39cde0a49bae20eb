//! Records of executed subtasks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::usage::UsageTotals;

/// Outcome of one planning cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubtaskStatus {
    Succeeded,
    Failed { error: String },
}

impl SubtaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One Planning-through-Recording cycle of an agent run.
///
/// # Invariants
/// - `index` is the 1-based cycle number within the run
/// - `usage` is an object carrying the usage envelope of this cycle's
///   oracle calls, and nothing else
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskRecord {
    pub index: usize,
    /// Name of the capability or synthetic action chosen
    pub action_taken: String,
    /// Arguments or goal given to the action
    pub input: Value,
    pub output: Value,
    pub usage: Map<String, Value>,
    pub status: SubtaskStatus,
}

impl SubtaskRecord {
    pub fn succeeded(
        index: usize,
        action_taken: impl Into<String>,
        input: Value,
        output: Value,
    ) -> Self {
        Self {
            index,
            action_taken: action_taken.into(),
            input,
            output,
            usage: Map::new(),
            status: SubtaskStatus::Succeeded,
        }
    }

    pub fn failed(
        index: usize,
        action_taken: impl Into<String>,
        input: Value,
        error: impl Into<String>,
    ) -> Self {
        Self {
            index,
            action_taken: action_taken.into(),
            input,
            output: Value::Null,
            usage: Map::new(),
            status: SubtaskStatus::Failed {
                error: error.into(),
            },
        }
    }

    pub fn with_usage(mut self, usage: Map<String, Value>) -> Self {
        self.usage = usage;
        self
    }

    pub fn usage_totals(&self) -> UsageTotals {
        UsageTotals::from_envelope(&self.usage)
    }

    /// One-line rendering used in prompts and retrieval queries.
    pub fn condensed(&self) -> String {
        match &self.status {
            SubtaskStatus::Succeeded => format!(
                "Subtask {} [{}] input: {} -> output: {}",
                self.index, self.action_taken, self.input, self.output
            ),
            SubtaskStatus::Failed { error } => format!(
                "Subtask {} [{}] input: {} -> FAILED: {}",
                self.index, self.action_taken, self.input, error
            ),
        }
    }
}
