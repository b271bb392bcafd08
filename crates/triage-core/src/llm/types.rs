//! Wire types for the OpenAI-compatible API served by OpenRouter
//!
//! Only the fields the triage client sends or reads are modelled. Unknown
//! response fields are ignored by serde.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
}

/// An outgoing chat message
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Output format hint. Providers that ignore it still get a JSON-only prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl ResponseFormat {
    pub const JSON_OBJECT: Self = Self { kind: "json_object" };
}

/// Request body for chat completions
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub temperature: f32,
    pub max_tokens: usize,
    pub response_format: ResponseFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
}

/// Response from the chat completions API
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
}

impl ChatResponse {
    /// Text of the first choice, if the provider returned any
    pub fn into_content(self) -> Option<String> {
        self.choices.into_iter().next().map(|c| c.message.content)
    }
}

/// Request body for embeddings
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingRequest<'a> {
    pub model: &'a str,
    pub input: &'a str,
    /// Requested output size, for models that can shorten their vectors
    pub dimensions: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingData {
    #[serde(default)]
    pub index: usize,
    pub embedding: Vec<f32>,
}

/// Response from the embeddings API
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingResponse {
    pub data: Vec<EmbeddingData>,
}

impl EmbeddingResponse {
    /// Vector for the lowest input index
    pub fn into_vector(self) -> Option<Vec<f32>> {
        self.data
            .into_iter()
            .min_by_key(|d| d.index)
            .map(|d| d.embedding)
    }
}
