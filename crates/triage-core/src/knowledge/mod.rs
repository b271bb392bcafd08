//! Knowledge graph of resolved tickets
//!
//! Resolved tickets become `Ticket` nodes carrying their resolution text and
//! embedding, linked by `REQUIRES` edges to `Skill` nodes. The similarity
//! index answers nearest-neighbor queries over those embeddings.
//!
//! # Architecture
//!
//! - `store`: keyed upserts and read helpers ([`KnowledgeGraphStore`])
//! - `index`: vector index catalog and k-nearest-neighbor lookup ([`SimilarityIndex`])

mod index;
mod store;

pub use index::{DEFAULT_K, IndexConfig, SimilarTicket, SimilarityIndex};
pub use store::SqliteKnowledgeGraph;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What happens to a ticket's existing REQUIRES edges when it is upserted again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillEdgePolicy {
    /// Keep earlier edges and add the new ones
    #[default]
    Accumulate,
    /// Drop edges to skills missing from the latest upsert
    Replace,
}

impl SkillEdgePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillEdgePolicy::Accumulate => "accumulate",
            SkillEdgePolicy::Replace => "replace",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accumulate" => Some(SkillEdgePolicy::Accumulate),
            "replace" => Some(SkillEdgePolicy::Replace),
            _ => None,
        }
    }
}

/// A `Ticket` node as stored in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketNode {
    pub id: String,
    pub title: String,
    pub resolution: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Node and edge counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphStats {
    pub ticket_nodes: u64,
    pub skill_nodes: u64,
    pub requires_edges: u64,
    pub vector_indexes: u64,
}

#[async_trait]
pub trait KnowledgeGraphStore: Send + Sync {
    /// Merge the ticket node by id, merge each skill node by name and make
    /// sure exactly one REQUIRES edge links them. Runs in one transaction.
    async fn upsert_ticket(
        &self,
        id: &str,
        title: &str,
        resolution: &str,
        skills: &[String],
        embedding: &[f32],
    ) -> Result<()>;

    async fn get_ticket_node(&self, id: &str) -> Result<Option<TicketNode>>;

    /// Skill names linked to the ticket, sorted
    async fn skills_for_ticket(&self, id: &str) -> Result<Vec<String>>;

    async fn stats(&self) -> Result<GraphStats>;
}
