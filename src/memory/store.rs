//! Top-k retrieval over a fixed, insertion-ordered item list.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use tracing::debug;

use super::ranker::Ranker;
use super::RetrievalError;

/// Maps an item to the text it is ranked by.
pub type Mapper<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

/// Scores `(query, candidate)` pairs directly. Higher is more relevant.
pub type ScoringFn = Arc<dyn Fn(&str, &str) -> anyhow::Result<f64> + Send + Sync>;

/// How a store scores its candidates.
#[derive(Clone)]
pub enum RetrievalStrategy {
    Ranker(Arc<Ranker>),
    Custom(ScoringFn),
}

impl RetrievalStrategy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, &str) -> anyhow::Result<f64> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f64>, RetrievalError> {
        match self {
            Self::Ranker(ranker) => ranker.score(query, texts).await,
            Self::Custom(f) => texts
                .iter()
                .map(|text| f(query, text).map_err(RetrievalError::Scoring))
                .collect(),
        }
    }
}

impl std::fmt::Debug for RetrievalStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ranker(ranker) => f.debug_tuple("Ranker").field(&ranker.model()).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Read-only collection ranked against a query on each retrieval.
///
/// # Invariants
/// - `retrieve` returns at most `top_k` items
/// - Results are ordered by descending score, ties by insertion order
/// - With `top_k >= len` all items come back in insertion order unscored
pub struct MemoryStore<T> {
    items: Vec<T>,
    top_k: usize,
    mapper: Mapper<T>,
    strategy: RetrievalStrategy,
}

impl<T> MemoryStore<T> {
    pub fn new(
        items: Vec<T>,
        top_k: usize,
        mapper: impl Fn(&T) -> String + Send + Sync + 'static,
        strategy: RetrievalStrategy,
    ) -> Self {
        Self {
            items,
            top_k,
            mapper: Arc::new(mapper),
            strategy,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn strategy(&self) -> &RetrievalStrategy {
        &self.strategy
    }

    /// The `top_k` items most relevant to `query`.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<&T>, RetrievalError> {
        if self.top_k == 0 || self.items.is_empty() {
            return Ok(Vec::new());
        }
        if self.top_k >= self.items.len() {
            debug!(
                items = self.items.len(),
                top_k = self.top_k,
                "Store fits in top_k, skipping scoring"
            );
            return Ok(self.items.iter().collect());
        }

        let texts: Vec<String> = self.items.iter().map(|item| (self.mapper)(item)).collect();
        let scores = self.strategy.score(query, &texts).await?;
        if scores.len() != texts.len() {
            return Err(RetrievalError::ScoreCount {
                expected: texts.len(),
                got: scores.len(),
            });
        }

        let selected = top_k_indices(&scores, self.top_k);
        debug!(query = %crate::util::truncate(query, 80), ?selected, "Retrieved from memory");
        Ok(selected.into_iter().map(|i| &self.items[i]).collect())
    }
}

impl<T> std::fmt::Debug for MemoryStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("items", &self.items.len())
            .field("top_k", &self.top_k)
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Heap entry; greater means more relevant.
struct Scored {
    score: f64,
    index: usize,
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

/// Indices of the `k` highest scores, best first, ties by lower index.
///
/// Keeps a min-heap of at most `k` entries, so the pass is `O(n log k)`.
/// NaN scores rank below every number.
pub fn top_k_indices(scores: &[f64], k: usize) -> Vec<usize> {
    if k == 0 {
        return Vec::new();
    }

    let k = k.min(scores.len());
    let mut heap: BinaryHeap<Reverse<Scored>> = BinaryHeap::with_capacity(k + 1);
    for (index, &score) in scores.iter().enumerate() {
        let score = if score.is_nan() { f64::NEG_INFINITY } else { score };
        heap.push(Reverse(Scored { score, index }));
        if heap.len() > k {
            heap.pop();
        }
    }

    let mut kept: Vec<Scored> = heap.into_iter().map(|Reverse(s)| s).collect();
    kept.sort_by(|a, b| b.cmp(a));
    kept.into_iter().map(|s| s.index).collect()
}
