//! Capability memory: ranked retrieval over an agent's registry.
//!
//! Before every selection the orchestrator asks its memories for the
//! functions and sub-agents most relevant to the current goal. Only the
//! retrieved items (plus compulsory functions) reach the oracle's menu.
//!
//! ```text
//!   query ──► MemoryStore::retrieve ──► RetrievalStrategy
//!                    │                     ├─ Ranker (embed + cosine, cached)
//!                    │                     └─ Custom (pair scoring fn)
//!                    ▼
//!           top_k_indices (bounded heap)
//! ```

mod ranker;
mod store;

pub use ranker::{cosine_similarity, Ranker};
pub use store::{top_k_indices, Mapper, MemoryStore, RetrievalStrategy, ScoringFn};

use std::sync::Arc;

use thiserror::Error;

use crate::agents::Agent;
use crate::capability::Function;

/// Failure to rank memory items.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Embedding request failed: {0}")]
    Embedding(#[source] anyhow::Error),

    #[error("Scoring function failed: {0}")]
    Scoring(#[source] anyhow::Error),

    #[error("Ranker has neither an embedder nor a ranking function")]
    NoEmbedder,

    #[error("No embedding cached for '{0}'")]
    MissingEmbedding(String),

    #[error("Embedding dimensions differ: {expected} vs {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Expected {expected} scores, got {got}")]
    ScoreCount { expected: usize, got: usize },
}

/// How one memory of an agent retrieves.
///
/// Items are ranked by `mapper`'s text when set, otherwise by the item's
/// default `name: description` text.
pub struct MemorySettings<T: ?Sized> {
    pub top_k: usize,
    pub strategy: RetrievalStrategy,
    pub mapper: Option<Arc<dyn Fn(&T) -> String + Send + Sync>>,
}

impl<T: ?Sized> MemorySettings<T> {
    pub fn new(top_k: usize, strategy: RetrievalStrategy) -> Self {
        Self {
            top_k,
            strategy,
            mapper: None,
        }
    }

    /// Rank items by `mapper(item)` instead of the default text.
    pub fn with_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.mapper = Some(Arc::new(mapper));
        self
    }
}

impl<T: ?Sized> Clone for MemorySettings<T> {
    fn clone(&self) -> Self {
        Self {
            top_k: self.top_k,
            strategy: self.strategy.clone(),
            mapper: self.mapper.clone(),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for MemorySettings<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySettings")
            .field("top_k", &self.top_k)
            .field("strategy", &self.strategy)
            .field("mapper", &self.mapper.is_some())
            .finish()
    }
}

/// Memories an agent ranks its capabilities with.
///
/// A missing memory means every item of that kind is offered on each step.
#[derive(Debug, Clone, Default)]
pub struct MemoryBank {
    pub function: Option<MemorySettings<Function>>,
    pub agent: Option<MemorySettings<Agent>>,
}

impl MemoryBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function_memory(mut self, settings: MemorySettings<Function>) -> Self {
        self.function = Some(settings);
        self
    }

    pub fn with_agent_memory(mut self, settings: MemorySettings<Agent>) -> Self {
        self.agent = Some(settings);
        self
    }
}
