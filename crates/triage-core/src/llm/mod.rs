//! LLM integration - OpenRouter API
//!
//! This module provides:
//! - OpenRouter HTTP client for chat completions and embeddings
//! - The request/response subset of the OpenAI-compatible API it uses
//! - The [`InferenceBackend`] capability consumed by the triage analyzer

mod client;
mod types;

pub use client::{LlmClient, LlmClientBuilder};

use async_trait::async_trait;

use crate::error::Result;

/// Something that turns a system prompt and a user prompt into raw model text
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn infer(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Stand-in used when no API key is configured. Every call fails as retriable,
/// so the ticket workflow finishes without analysis on its last attempt.
#[derive(Debug, Clone)]
pub struct UnavailableBackend {
    reason: String,
}

impl UnavailableBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl InferenceBackend for UnavailableBackend {
    async fn infer(&self, _system: &str, _prompt: &str) -> Result<String> {
        Err(crate::error::Error::LLMError(self.reason.clone()))
    }
}
