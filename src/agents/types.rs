//! Core types for the agent system.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::capability::ExecutionMode;
use crate::memory::RetrievalError;
use crate::task::SubtaskRecord;
use crate::usage::UsageTotals;

/// Unique identifier for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a run ended, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// The oracle declared the goal achieved
    Completed,
    /// The subtask budget ran out first
    Partial,
}

/// Reason why agent execution terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalReason {
    /// Oracle returned a final answer
    Finished,
    /// Hit `max_subtasks` cycles
    MaxSubtasks,
}

/// Result of one `Agent::run`.
///
/// # Invariants
/// - `status == Completed` iff `terminal_reason == Finished`
/// - `subtask_count <= max_subtasks` of the agent that ran
/// - `records` holds only cycles not yet folded into `summary`
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub agent: String,
    pub output: Value,
    pub status: RunStatus,
    pub terminal_reason: TerminalReason,
    pub subtask_count: usize,
    pub summary: Option<String>,
    pub records: Vec<SubtaskRecord>,
    /// Usage across every oracle call of the run, nested runs excluded
    pub usage: UsageTotals,
}

impl RunResult {
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Errors detected while assembling an agent. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("{0} name must not be empty")]
    EmptyName(&'static str),

    #[error("'{0}' has no description")]
    MissingDescription(String),

    #[error("Compulsory function '{0}' has no callable body")]
    MissingCallable(String),

    #[error("Capability name '{0}' is registered more than once")]
    DuplicateName(String),

    #[error("{0} must be at least 1")]
    ZeroBudget(&'static str),

    #[error("Function '{function}' does not match the agent's {mode:?} execution mode")]
    ModeMismatch {
        function: String,
        mode: ExecutionMode,
    },

    #[error("Delegating to '{0}' would create a cycle")]
    DelegationCycle(String),

    #[error("Code actions are enabled but no code runner is configured")]
    CodeActionWithoutRunner,

    #[error("Agent '{0}' has no capabilities and may not answer directly")]
    NoCapabilities(String),
}

/// Errors that can occur in agent operations.
///
/// Only `Configuration` and `Llm` escape `Agent::run`; the others are
/// recorded as failed subtasks and fed back to the oracle.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Selection error: {0}")]
    Selection(String),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Capability '{capability}' failed: {message}")]
    CapabilityExecution { capability: String, message: String },

    #[error("LLM error: {0}")]
    Llm(#[source] anyhow::Error),
}
