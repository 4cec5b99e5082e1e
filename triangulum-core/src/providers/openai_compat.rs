//! OpenAI-compatible chat and embedding providers.
//!
//! Works against OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio and any
//! endpoint that follows the `/chat/completions` and `/embeddings` formats.

use crate::brain::ChatModel;
use crate::config::LlmConfig;
use crate::embeddings::EmbeddingModel;
use crate::error::{EmbeddingError, LlmError};
use crate::types::Message;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Resolve the API key for `config`, tolerating local endpoints without one.
fn resolve_api_key(config: &LlmConfig) -> Result<String, LlmError> {
    let is_local = config.base_url.contains("localhost") || config.base_url.contains("127.0.0.1");
    std::env::var(&config.api_key_env)
        .ok()
        .filter(|k| !k.is_empty())
        .or_else(|| {
            if is_local {
                // Local providers (Ollama, vLLM, LM Studio) don't require an API key
                debug!("No API key set for local provider; using dummy bearer token");
                Some("ollama".to_string())
            } else {
                None
            }
        })
        .ok_or_else(|| LlmError::AuthFailed {
            provider: format!(
                "OpenAI-compatible: env var '{}' not set",
                config.api_key_env
            ),
        })
}

fn build_client(timeout_secs: u64) -> Result<Client, String> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {e}"))
}

/// Map an HTTP status code to the appropriate LlmError.
fn map_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
    match status.as_u16() {
        401 | 403 => LlmError::AuthFailed {
            provider: format!("OpenAI-compatible ({status})"),
        },
        code if code >= 500 => LlmError::ApiRequest {
            message: format!("Server error ({code}): {body}"),
        },
        code => LlmError::ApiRequest {
            message: format!("HTTP {code}: {body}"),
        },
    }
}

/// OpenAI-compatible chat completion model.
pub struct OpenAiChatModel {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiChatModel {
    /// Create a model from configuration, reading the key from `config.api_key_env`.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = resolve_api_key(config)?;
        Self::new_with_key(config, api_key)
    }

    /// Create a model with an explicitly provided API key.
    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, LlmError> {
        let client =
            build_client(config.timeout_secs).map_err(|message| LlmError::ApiRequest { message })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    fn request_body(&self, messages: &[Message]) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": m.role.to_string(), "content": m.content}))
            .collect();
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.2,
        })
    }

    /// Extract the assistant text from a completion body.
    fn parse_response(body: &Value) -> Result<String, LlmError> {
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No choices in response".to_string(),
            })?;
        choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No message content in choice".to_string(),
            })
    }

    async fn send(&self, messages: &[Message]) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(messages))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout_secs: self.timeout_secs,
                    }
                } else {
                    LlmError::ApiRequest {
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {e}"),
        })?;
        if !status.is_success() {
            return Err(map_http_error(status, &text));
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| LlmError::ResponseParse {
            message: e.to_string(),
        })?;
        Self::parse_response(&body)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn invoke(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        debug!(model = %self.model, messages = messages.len(), "chat completion");
        tokio::select! {
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            result = self.send(messages) => result,
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// OpenAI-compatible embedding model.
pub struct OpenAiEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(config: &LlmConfig) -> Result<Self, EmbeddingError> {
        let api_key = resolve_api_key(config).map_err(|e| EmbeddingError::Request {
            message: e.to_string(),
        })?;
        Self::new_with_key(config, api_key)
    }

    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, EmbeddingError> {
        let client = build_client(config.timeout_secs)
            .map_err(|message| EmbeddingError::Request { message })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.embedding_model.clone(),
        })
    }

    /// Parse `data[].embedding`, ordered by each item's `index`.
    fn parse_embeddings(body: &Value, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let data = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| EmbeddingError::Request {
                message: "No data in embedding response".to_string(),
            })?;

        let mut indexed: Vec<(usize, Vec<f32>)> = data
            .iter()
            .enumerate()
            .filter_map(|(pos, item)| {
                let index = item
                    .get("index")
                    .and_then(|i| i.as_u64())
                    .map(|i| i as usize)
                    .unwrap_or(pos);
                let vector = item
                    .get("embedding")?
                    .as_array()?
                    .iter()
                    .filter_map(|x| x.as_f64().map(|f| f as f32))
                    .collect();
                Some((index, vector))
            })
            .collect();
        indexed.sort_by_key(|(index, _)| *index);

        if indexed.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: indexed.len(),
            });
        }
        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch.pop().ok_or_else(|| EmbeddingError::Request {
            message: "Empty embedding response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({"model": self.model, "input": texts}))
            .send()
            .await
            .map_err(|e| EmbeddingError::Request {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Request {
                message: format!("HTTP {}: {body}", status.as_u16()),
            });
        }
        let body: Value = response.json().await.map_err(|e| EmbeddingError::Request {
            message: format!("Failed to parse embedding response: {e}"),
        })?;
        Self::parse_embeddings(&body, texts.len())
    }

    fn provider_name(&self) -> &str {
        "openai_compat"
    }
}
