//! Agents module - hierarchical goal decomposition.
//!
//! # Pieces
//! - **Agent**: holds the capability registry and runs the subtask loop
//! - **Action**: one entry of the menu shown to the oracle
//! - **Oracle**: decides the next action, summarises history, and stands in
//!   for functions without a callable
//!
//! # Design Principles
//! - Agents are built once and immutable afterwards
//! - Sub-agents run inline, sharing the caller's variables
//! - A run never exceeds `max_subtasks` cycles

mod action;
mod agent;
mod oracle;
mod types;

pub use action::{render_menu, Action, CODE_ACTION, DIRECT_ANSWER};
pub use agent::{Agent, AgentBuilder, GlobalContextFn};
pub use oracle::{
    parse_decision, Decision, LlmOracle, Oracle, OracleReply, Selection, SelectionRequest,
};
pub use types::{AgentError, AgentId, ConfigurationError, RunResult, RunStatus, TerminalReason};
