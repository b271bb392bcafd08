//! Vector index over resolved-ticket embeddings
//!
//! The index catalog lives in `vector_indexes`; lookups compare the query
//! against every stored `Ticket` node of the same width.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info, warn};

use crate::embedding::{EMBEDDING_DIMENSIONS, cosine_similarity};
use crate::error::{Error, Result};
use crate::storage::decode_vector;

/// Default number of neighbors returned
pub const DEFAULT_K: usize = 3;

/// Index definition recorded by [`SimilarityIndex::ensure_index`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    pub name: String,
    pub label: String,
    pub property: String,
    pub dimensions: usize,
    pub similarity_function: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            name: "ticket_embeddings".to_string(),
            label: "Ticket".to_string(),
            property: "embedding".to_string(),
            dimensions: EMBEDDING_DIMENSIONS,
            similarity_function: "cosine".to_string(),
        }
    }
}

/// A resolved ticket close to the query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarTicket {
    pub title: String,
    pub resolution: String,
    pub score: f32,
}

#[derive(Clone)]
pub struct SimilarityIndex {
    pool: SqlitePool,
    config: IndexConfig,
}

impl SimilarityIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_config(pool, IndexConfig::default())
    }

    pub fn with_config(pool: SqlitePool, config: IndexConfig) -> Self {
        Self { pool, config }
    }

    /// Record the index definition if it is not there yet. Safe to call on every run.
    pub async fn ensure_index(&self) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO vector_indexes (name, label, property, dimensions, similarity_function, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(&self.config.name)
        .bind(&self.config.label)
        .bind(&self.config.property)
        .bind(self.config.dimensions as i64)
        .bind(&self.config.similarity_function)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::GraphStore(e.to_string()))?;

        if result.rows_affected() > 0 {
            info!(index = %self.config.name, dimensions = self.config.dimensions, "Vector index created");
        }
        Ok(())
    }

    pub async fn exists(&self) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT name FROM vector_indexes WHERE name = ?")
            .bind(&self.config.name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::GraphStore(e.to_string()))?;
        Ok(row.is_some())
    }

    /// Up to `k` stored tickets ordered by non-increasing cosine score.
    ///
    /// Never fails: a missing index, an empty graph or an unreachable store
    /// all produce an empty list.
    pub async fn query(&self, vector: &[f32], k: usize) -> Vec<SimilarTicket> {
        match self.try_query(vector, k).await {
            Ok(results) => results,
            Err(e) => {
                warn!(index = %self.config.name, error = %e, "Similarity lookup failed, using empty context");
                Vec::new()
            }
        }
    }

    async fn try_query(&self, vector: &[f32], k: usize) -> Result<Vec<SimilarTicket>> {
        if k == 0 || vector.is_empty() {
            return Ok(Vec::new());
        }
        if !self.exists().await? {
            debug!(index = %self.config.name, "Vector index absent");
            return Ok(Vec::new());
        }

        let rows: Vec<NodeEmbeddingRow> = sqlx::query_as(
            "SELECT title, resolution, embedding FROM ticket_nodes WHERE dimensions = ?",
        )
        .bind(vector.len() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::GraphStore(e.to_string()))?;

        let mut results: Vec<SimilarTicket> = rows
            .into_iter()
            .map(|row| {
                let score = cosine_similarity(vector, &decode_vector(&row.embedding));
                SimilarTicket {
                    title: row.title,
                    resolution: row.resolution,
                    score,
                }
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);

        debug!(index = %self.config.name, results = results.len(), "Similarity lookup complete");
        Ok(results)
    }
}

#[derive(Debug, FromRow)]
struct NodeEmbeddingRow {
    title: String,
    resolution: String,
    embedding: Vec<u8>,
}
