//! Relevance scoring for memory retrieval.
//!
//! Without a ranking function the ranker embeds the query and every
//! candidate in a single batched request and scores by cosine similarity.
//! Candidate embeddings are cached by text for the ranker's lifetime; query
//! embeddings are not.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::store::ScoringFn;
use super::RetrievalError;
use crate::llm::Embedder;

pub struct Ranker {
    model: String,
    ranking_fn: Option<ScoringFn>,
    embedder: Option<Arc<dyn Embedder>>,
    cache: Mutex<HashMap<String, Arc<Vec<f32>>>>,
}

impl Ranker {
    /// Embedding-backed ranker using `embedder`'s model.
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            model: embedder.model().to_string(),
            ranking_fn: None,
            embedder: Some(embedder),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Ranker that scores each pair with `ranking_fn`; nothing is embedded.
    pub fn with_ranking_fn<F>(model: impl Into<String>, ranking_fn: F) -> Self
    where
        F: Fn(&str, &str) -> anyhow::Result<f64> + Send + Sync + 'static,
    {
        Self {
            model: model.into(),
            ranking_fn: Some(Arc::new(ranking_fn)),
            embedder: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Number of texts with a cached embedding.
    pub fn cached_embeddings(&self) -> usize {
        self.cache.lock().len()
    }

    /// Score each candidate against `query`, in candidate order.
    pub async fn score(
        &self,
        query: &str,
        candidates: &[String],
    ) -> Result<Vec<f64>, RetrievalError> {
        if let Some(ranking_fn) = &self.ranking_fn {
            return candidates
                .iter()
                .map(|text| ranking_fn(query, text).map_err(RetrievalError::Scoring))
                .collect();
        }

        let embedder = self.embedder.as_ref().ok_or(RetrievalError::NoEmbedder)?;
        let query_vec = self
            .embed_with_candidates(embedder.as_ref(), query, candidates)
            .await?;

        let cache = self.cache.lock();
        candidates
            .iter()
            .map(|text| {
                let vector = cache
                    .get(text.as_str())
                    .ok_or_else(|| RetrievalError::MissingEmbedding(text.clone()))?;
                cosine_similarity(&query_vec, vector)
            })
            .collect()
    }

    /// Embed the query and every uncached candidate in one request.
    ///
    /// Only candidates are cached; the query vector goes back to the caller.
    async fn embed_with_candidates(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        candidates: &[String],
    ) -> Result<Arc<Vec<f32>>, RetrievalError> {
        let (cached_query, missing) = {
            let cache = self.cache.lock();
            let mut missing: Vec<String> = Vec::new();
            for text in candidates {
                if !cache.contains_key(text) && !missing.contains(text) {
                    missing.push(text.clone());
                }
            }
            (cache.get(query).cloned(), missing)
        };

        let embed_query = cached_query.is_none() && !missing.iter().any(|m| m == query);
        let mut batch = Vec::with_capacity(missing.len() + 1);
        if embed_query {
            batch.push(query.to_string());
        }
        batch.extend(missing.iter().cloned());

        let mut vectors = if batch.is_empty() {
            Vec::new().into_iter()
        } else {
            debug!(model = %self.model, count = batch.len(), "Embedding retrieval texts");
            let vectors = embedder
                .embed_batch(&batch)
                .await
                .map_err(RetrievalError::Embedding)?;
            if vectors.len() != batch.len() {
                return Err(RetrievalError::ScoreCount {
                    expected: batch.len(),
                    got: vectors.len(),
                });
            }
            vectors.into_iter()
        };

        let fresh_query = if embed_query {
            vectors.next().map(Arc::new)
        } else {
            None
        };
        let mut cache = self.cache.lock();
        for (text, vector) in missing.into_iter().zip(vectors) {
            cache.insert(text, Arc::new(vector));
        }

        cached_query
            .or(fresh_query)
            .or_else(|| cache.get(query).cloned())
            .ok_or_else(|| RetrievalError::MissingEmbedding(query.to_string()))
    }
}

impl std::fmt::Debug for Ranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ranker")
            .field("model", &self.model)
            .field("ranking_fn", &self.ranking_fn.is_some())
            .field("cached_embeddings", &self.cached_embeddings())
            .finish()
    }
}

/// Cosine similarity of two equal-length vectors; zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, RetrievalError> {
    if a.len() != b.len() {
        return Err(RetrievalError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds text as `[len, vowel count]`.
    struct CountingEmbedder {
        batches: AtomicUsize,
        texts: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model(&self) -> &str {
            "fake-embed"
        }

        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count();
                    vec![t.len() as f32, vowels as f32]
                })
                .collect())
        }
    }

    fn embedder() -> Arc<CountingEmbedder> {
        Arc::new(CountingEmbedder {
            batches: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        })
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]).unwrap() - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 3.0]).unwrap().abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]).unwrap(), 0.0);
        assert!(matches!(
            cosine_similarity(&[1.0], &[1.0, 2.0]),
            Err(RetrievalError::DimensionMismatch { expected: 1, got: 2 })
        ));
    }

    #[tokio::test]
    async fn embeds_once_per_batch_and_caches() {
        let fake = embedder();
        let ranker = Ranker::new(fake.clone());
        assert_eq!(ranker.model(), "fake-embed");

        let candidates = vec!["aaa".to_string(), "xyz".to_string(), "aaa".to_string()];
        let scores = ranker.score("aa", &candidates).await.unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores[0] > scores[1]);
        assert_eq!(scores[0], scores[2]);
        assert_eq!(fake.batches.load(Ordering::SeqCst), 1);
        // The duplicate candidate is embedded once.
        assert_eq!(fake.texts.load(Ordering::SeqCst), 3);

        // Only the query is embedded again.
        ranker.score("aa", &candidates).await.unwrap();
        assert_eq!(fake.batches.load(Ordering::SeqCst), 2);
        assert_eq!(fake.texts.load(Ordering::SeqCst), 4);
        assert_eq!(ranker.cached_embeddings(), 2);
    }

    #[tokio::test]
    async fn distinct_queries_do_not_grow_the_cache() {
        let fake = embedder();
        let ranker = Ranker::new(fake.clone());
        let candidates = vec!["a".to_string(), "bb".to_string()];

        for i in 0..50 {
            let query = format!("goal\nSubtask {} output {}", i, i);
            ranker.score(&query, &candidates).await.unwrap();
        }
        assert_eq!(ranker.cached_embeddings(), 2);
        // Candidates once, then one query per call.
        assert_eq!(fake.texts.load(Ordering::SeqCst), 2 + 50);
    }

    #[tokio::test]
    async fn query_equal_to_a_candidate_is_embedded_once() {
        let fake = embedder();
        let ranker = Ranker::new(fake.clone());
        let candidates = vec!["aa".to_string(), "xyz".to_string()];

        let scores = ranker.score("aa", &candidates).await.unwrap();
        assert!((scores[0] - 1.0).abs() < 1e-9);
        assert_eq!(fake.texts.load(Ordering::SeqCst), 2);

        ranker.score("aa", &candidates).await.unwrap();
        assert_eq!(fake.batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ranking_fn_bypasses_embeddings() {
        let ranker = Ranker::with_ranking_fn("overlap", |query, text| {
            Ok(query.split(' ').filter(|w| text.contains(w)).count() as f64)
        });
        let candidates = vec!["dish price".to_string(), "weather".to_string()];
        let scores = ranker.score("price of dish", &candidates).await.unwrap();
        assert_eq!(scores, vec![2.0, 0.0]);
        assert_eq!(ranker.cached_embeddings(), 0);
    }

    #[tokio::test]
    async fn embedder_failure_is_reported() {
        struct Down;

        #[async_trait]
        impl Embedder for Down {
            fn model(&self) -> &str {
                "down"
            }

            async fn embed_batch(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
                anyhow::bail!("503 from embeddings endpoint")
            }
        }

        let ranker = Ranker::new(Arc::new(Down));
        let err = ranker.score("q", &["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Embedding(_)));
    }
}
