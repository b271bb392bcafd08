//! OpenRouter LLM client implementation
//!
//! Provides an async HTTP client for the OpenRouter API with:
//! - Chat completions with model fallback
//! - Embeddings at a requested dimension
//! - Rate limit handling with exponential backoff

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client as HttpClient;
use tracing::{debug, error, info, warn};

use crate::config::{EmbeddingConfig, LlmConfig};
use crate::error::{Error, Result};

use super::InferenceBackend;
use super::types::{
    ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Message, ResponseFormat,
};

/// Maximum number of attempts for a rate-limited request
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (in milliseconds)
const BACKOFF_BASE_MS: u64 = 1000;

/// OpenRouter LLM client
///
/// Cheap to clone. One client serves both the triage analyzer and the
/// embedding adapter.
#[derive(Clone)]
pub struct LlmClient {
    http_client: HttpClient,
    config: LlmConfig,
    embedding: EmbeddingConfig,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("base_url", &self.base_url)
            .field("default_model", &self.config.default_model)
            .field("embedding_model", &self.embedding.model)
            .finish()
    }
}

/// Builder for creating an LlmClient
#[derive(Default)]
pub struct LlmClientBuilder {
    config: Option<LlmConfig>,
    embedding: Option<EmbeddingConfig>,
    api_key: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

impl LlmClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn embedding(mut self, embedding: EmbeddingConfig) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Override the base URL from the configuration
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn build(self) -> Result<LlmClient> {
        let config = self.config.unwrap_or_default();
        let api_key = self
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::ConfigError("API key is required".to_string()))?;

        let timeout_secs = self.timeout_secs.unwrap_or(config.timeout_secs);

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(Error::NetworkError)?;

        let base_url = self
            .base_url
            .unwrap_or_else(|| config.base_url.clone())
            .trim_end_matches('/')
            .to_string();

        Ok(LlmClient {
            http_client,
            config,
            embedding: self.embedding.unwrap_or_default(),
            api_key,
            base_url,
        })
    }
}

impl LlmClient {
    pub fn builder() -> LlmClientBuilder {
        LlmClientBuilder::new()
    }

    /// JSON-mode chat completion, trying the default model and then each
    /// fallback model while the failure looks model-specific.
    pub async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let messages = [Message::system(system), Message::user(prompt)];
        let models = std::iter::once(&self.config.default_model).chain(&self.config.fallback_models);

        let mut last_error = None;

        for model in models {
            debug!(model = %model, "Attempting chat completion");

            let request = ChatRequest {
                model,
                messages: &messages,
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
                response_format: ResponseFormat::JSON_OBJECT,
            };

            match self.execute_request(&request).await {
                Ok(content) => {
                    info!(model = %model, "Chat completion successful");
                    return Ok(content);
                }
                Err(Error::RateLimited(secs)) => {
                    warn!(model = %model, wait_secs = secs, "Rate limited, trying next model");
                    last_error = Some(Error::RateLimited(secs));
                }
                Err(Error::LLMError(msg)) if is_model_error(&msg) => {
                    warn!(model = %model, error = %msg, "Model error, trying next model");
                    last_error = Some(Error::LLMError(msg));
                }
                Err(e) => {
                    error!(model = %model, error = %e, "Chat completion failed");
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::LLMError("All models failed".to_string())))
    }

    /// Generate an embedding with the configured model and dimension
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.embedding.model,
            input: text,
            dimensions: self.embedding.dimensions,
        };

        let url = format!("{}/embeddings", self.base_url);
        debug!(model = %request.model, dimensions = request.dimensions, "Sending embedding request");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "Triage")
            .json(&request)
            .send()
            .await
            .map_err(Error::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return handle_error_response(status, response).await;
        }

        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::EmbeddingFailed(format!("Failed to parse response: {}", e)))?;

        embedding_response
            .into_vector()
            .ok_or_else(|| Error::EmbeddingFailed("Empty embedding response".to_string()))
    }

    /// Execute a chat request, retrying while rate limited
    async fn execute_request(&self, request: &ChatRequest<'_>) -> Result<String> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.send_request(request).await {
                Ok(response) => return Ok(response),
                Err(Error::RateLimited(wait_secs)) if attempts < MAX_RETRY_ATTEMPTS => {
                    let backoff = calculate_backoff(attempts, wait_secs);
                    warn!(
                        attempt = attempts,
                        wait_ms = backoff,
                        "Rate limited, retrying after backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_request(&self, request: &ChatRequest<'_>) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "Triage")
            .json(request)
            .send()
            .await
            .map_err(Error::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return handle_error_response(status, response).await;
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::LLMError(format!("Failed to parse response: {}", e)))?;

        debug!(model = %chat_response.model, "Chat completion received");
        chat_response
            .into_content()
            .ok_or_else(|| Error::LLMError("Empty response from API".to_string()))
    }
}

#[async_trait]
impl InferenceBackend for LlmClient {
    async fn infer(&self, system: &str, prompt: &str) -> Result<String> {
        self.complete(system, prompt).await
    }
}

/// Map an unsuccessful HTTP response to an error
async fn handle_error_response<T>(
    status: reqwest::StatusCode,
    response: reqwest::Response,
) -> Result<T> {
    let body = response.text().await.unwrap_or_default();

    match status.as_u16() {
        401 => Err(Error::ConfigError(
            "Unauthorized: Invalid API key. Set TRIAGE_API_KEY or OPENROUTER_API_KEY.".to_string(),
        )),
        429 => {
            let wait_secs = extract_retry_after(&body).unwrap_or(60);
            Err(Error::RateLimited(wait_secs))
        }
        400 => Err(Error::LLMError(format!("Bad request: {}", body))),
        402 => Err(Error::ConfigError(
            "Payment required: Insufficient credits on OpenRouter account".to_string(),
        )),
        404 => Err(Error::LLMError(format!(
            "Model not found or endpoint unavailable: {}",
            body
        ))),
        500..=599 => Err(Error::LLMError(format!("Server error ({}): {}", status, body))),
        _ => Err(Error::LLMError(format!("HTTP error {}: {}", status, body))),
    }
}

/// Whether a provider error is specific to the model, so another model may work
fn is_model_error(msg: &str) -> bool {
    let model_error_patterns = [
        "model not found",
        "unavailable",
        "not available",
        "no available provider",
        "overloaded",
        "capacity",
    ];

    let msg_lower = msg.to_lowercase();
    model_error_patterns
        .iter()
        .any(|pattern| msg_lower.contains(pattern))
}

/// Backoff delay in milliseconds with up to 10% jitter
fn calculate_backoff(attempt: u32, suggested_wait: u64) -> u64 {
    let base = BACKOFF_BASE_MS * 2u64.pow(attempt.saturating_sub(1));
    let delay = base.max(suggested_wait.saturating_mul(1000));

    let jitter = (delay / 10).max(1);
    delay.saturating_add(rand::thread_rng().gen_range(0..jitter))
}

fn extract_retry_after(body: &str) -> Option<u64> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    json.get("retry_after")
        .or_else(|| json.get("error").and_then(|e| e.get("retry_after")))
        .and_then(|v| v.as_u64())
}
