//! OpenAI-compatible chat client with automatic retry for transient errors.
//!
//! Works against any host exposing `/chat/completions` in the OpenAI format
//! (OpenAI itself, OpenRouter, local gateways). The raw response body is
//! preserved on every `ChatResponse` for usage accounting.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{with_retry, LlmError, RetryConfig};
use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient};

/// OpenAI-compatible client.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    host: String,
    retry_config: RetryConfig,
}

impl OpenAiClient {
    /// Create a client for `base_url` (e.g. `https://api.openai.com/v1`).
    pub fn new(api_key: String, base_url: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            host: host.into(),
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn complete_once(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let raw = post_json(&self.client, &self.endpoint(), &self.api_key, request).await?;
        let parsed: ChatCompletion = serde_json::from_value(raw.clone())
            .map_err(|e| LlmError::parse(format!("Unexpected completion shape: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse("No choices in response"))?;

        Ok(ChatResponse {
            content: choice.message.content,
            finish_reason: choice.finish_reason,
            raw,
        })
    }
}

/// POST `body` as JSON with bearer auth and return the decoded JSON reply.
pub(super) async fn post_json<B: Serialize + ?Sized>(
    client: &Client,
    url: &str,
    api_key: &str,
    body: &B,
) -> Result<Value, LlmError> {
    let response = client
        .post(url)
        .bearer_auth(api_key)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            let what = if e.is_timeout() {
                "timed out"
            } else if e.is_connect() {
                "connection failed"
            } else {
                "request failed"
            };
            LlmError::network(format!("{} {}: {}", url, what, e))
        })?;

    let status = response.status();
    let retry_after = retry_after(response.headers());
    let text = response
        .text()
        .await
        .map_err(|e| LlmError::network(format!("reading body failed: {}", e)))?;

    if !status.is_success() {
        return Err(LlmError::from_status(status.as_u16(), text, retry_after));
    }

    serde_json::from_str(&text).map_err(|e| {
        LlmError::parse(format!(
            "Body is not JSON ({}): {}",
            e,
            crate::util::truncate(&text, 500)
        ))
    })
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> anyhow::Result<ChatResponse> {
        self.chat_completion_with_options(model, messages, ChatOptions::default())
            .await
    }

    async fn chat_completion_with_options(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options
                .json_mode
                .then(|| serde_json::json!({"type": "json_object"})),
        };

        tracing::debug!(host = %self.host, model, "Sending chat request");
        let response =
            with_retry(&self.retry_config, "chat", || self.complete_once(&request)).await?;
        Ok(response)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}
