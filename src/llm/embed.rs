//! Embedding client for OpenAI-compatible `/embeddings` endpoints.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{with_retry, LlmError, RetryConfig};
use super::openai::post_json;

/// Anything that can turn texts into vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, used as part of cache keys.
    fn model(&self) -> &str;

    /// Embed `texts` in one call; output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No embedding returned"))
    }
}

/// HTTP embedding client.
pub struct EmbeddingClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    retry_config: RetryConfig,
}

impl EmbeddingClient {
    pub fn new(api_key: String, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let url = format!("{}/embeddings", self.base_url);
        let raw = with_retry(&self.retry_config, "embeddings", || {
            post_json(&self.client, &url, &self.api_key, &request)
        })
        .await?;
        let response: EmbeddingResponse = serde_json::from_value(raw)
            .map_err(|e| LlmError::parse(format!("Unexpected embedding shape: {}", e)))?;

        let mut data = response.data;
        data.sort_by_key(|d| d.index);

        if data.len() != texts.len() {
            anyhow::bail!(
                "Embedding API returned {} vectors for {} inputs",
                data.len(),
                texts.len()
            );
        }

        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
