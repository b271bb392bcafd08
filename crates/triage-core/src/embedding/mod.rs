//! Embeddings for ticket similarity
//!
//! Every vector that reaches the knowledge graph or the similarity index goes
//! through [`EmbeddingAdapter`], which pins the dimension to
//! [`EMBEDDING_DIMENSIONS`] so stored and query vectors always compare.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::LlmClient;
use crate::tickets::Ticket;

/// Width of every stored and queried vector
pub const EMBEDDING_DIMENSIONS: usize = 768;

/// External embedding capability
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
impl EmbeddingBackend for LlmClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        LlmClient::embed(self, text).await
    }
}

/// Deterministic offline embedder.
///
/// Hashes lowercase word tokens into buckets and normalizes the result, so
/// texts sharing vocabulary score close together. Used when no API key is
/// configured and throughout the tests.
#[derive(Clone, Debug)]
pub struct SimpleEmbedder {
    dimensions: usize,
}

impl Default for SimpleEmbedder {
    fn default() -> Self {
        Self {
            dimensions: EMBEDDING_DIMENSIONS,
        }
    }
}

impl SimpleEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait]
impl EmbeddingBackend for SimpleEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(text_to_vec(text, self.dimensions))
    }
}

fn text_to_vec(text: &str, dims: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dims];
    if dims == 0 {
        return vec;
    }

    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let token = token.to_lowercase();
        // FNV-1a
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in token.bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        vec[(hash % dims as u64) as usize] += 1.0;
    }

    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

/// Cosine similarity in [-1, 1]; 0.0 for empty, mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let score = dot / (norm_a * norm_b);
    // NaN survives clamp and would poison the top-k ordering
    if score.is_finite() {
        score.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Text embedded to look up similar tickets
pub fn query_text(title: &str, description: &str) -> String {
    format!("Title: {}\nDescription: {}", title, description)
}

/// Text embedded when a ticket is resolved
pub fn resolution_text(title: &str, description: &str, resolution: &str) -> String {
    format!(
        "Title: {}\nDescription: {}\nResolution: {}",
        title, description, resolution
    )
}

/// Fixed-dimension wrapper around an [`EmbeddingBackend`]
#[derive(Clone)]
pub struct EmbeddingAdapter {
    backend: Arc<dyn EmbeddingBackend>,
    dimensions: usize,
}

impl EmbeddingAdapter {
    pub fn new(backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self::with_dimensions(backend, EMBEDDING_DIMENSIONS)
    }

    pub fn with_dimensions(backend: Arc<dyn EmbeddingBackend>, dimensions: usize) -> Self {
        Self {
            backend,
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed `text`, rejecting vectors of the wrong width or with non-finite values
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.backend.embed(text).await?;

        if vector.len() != self.dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(Error::EmbeddingFailed(
                "backend returned non-finite values".to_string(),
            ));
        }

        debug!(dimensions = vector.len(), text_len = text.len(), "Embedding generated");
        Ok(vector)
    }

    pub async fn embed_query(&self, ticket: &Ticket) -> Result<Vec<f32>> {
        self.embed(&query_text(&ticket.title, &ticket.description))
            .await
    }

    pub async fn embed_resolution(
        &self,
        title: &str,
        description: &str,
        resolution: &str,
    ) -> Result<Vec<f32>> {
        self.embed(&resolution_text(title, description, resolution))
            .await
    }
}
