//! # taskgen
//!
//! Hierarchical task orchestration driven by a language model.
//!
//! An [`Agent`] splits a goal into subtasks, one per cycle. On each cycle it
//! ranks its capabilities against the goal, asks its oracle to pick one,
//! runs it, and records the outcome. Every model call's usage is attached to
//! the record of the cycle that made it.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │              Agent               │
//!        │  compulsory ∪ top-k functions    │
//!        │  sub-agents · direct · code      │
//!        └───────┬──────────────┬───────────┘
//!                │              │
//!                ▼              ▼
//!        ┌──────────────┐ ┌──────────────┐
//!        │ MemoryStore  │ │    Oracle    │──► usage envelope
//!        │   + Ranker   │ │ (LlmClient)  │
//!        └──────────────┘ └──────────────┘
//! ```
//!
//! ## Modules
//! - `agents`: agent, builder, run loop and oracle
//! - `capability`: functions and their bodies
//! - `memory`: top-k retrieval
//! - `task`: subtask records and history
//! - `usage`: per-call usage extraction and envelopes
//! - `source`: recovering closure source text
//! - `llm`: chat and embedding clients
//! - `runner`: code-action execution

pub mod agents;
pub mod capability;
pub mod config;
pub mod llm;
pub mod memory;
pub mod runner;
pub mod shared;
pub mod source;
pub mod task;
pub mod usage;
pub mod util;

pub use agents::{Agent, AgentBuilder, AgentError, LlmOracle, Oracle, RunResult, RunStatus};
pub use capability::{ExecutionMode, Function};
pub use config::Config;
pub use memory::{MemoryBank, MemorySettings, MemoryStore, Ranker, RetrievalStrategy};
pub use shared::SharedVariables;
pub use usage::ADDITIONAL_DATA_KEY;
