//! SQLite implementation of the KnowledgeGraphStore

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};

use super::{GraphStats, KnowledgeGraphStore, SkillEdgePolicy, TicketNode};
use crate::error::{Error, Result};
use crate::storage::{decode_vector, encode_vector, parse_timestamp};

/// Graph writes are retried by the workflow engine, so every store failure
/// surfaces as a graph error rather than a raw database error.
fn graph_err(e: sqlx::Error) -> Error {
    Error::GraphStore(e.to_string())
}

#[derive(Clone)]
pub struct SqliteKnowledgeGraph {
    pool: SqlitePool,
    edge_policy: SkillEdgePolicy,
}

impl SqliteKnowledgeGraph {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            edge_policy: SkillEdgePolicy::default(),
        }
    }

    pub fn with_edge_policy(mut self, policy: SkillEdgePolicy) -> Self {
        self.edge_policy = policy;
        self
    }
}

/// Trimmed, non-empty skill names in first-seen order
fn normalize_skills(skills: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(skills.len());
    for skill in skills {
        let name = skill.trim();
        if !name.is_empty() && !out.iter().any(|s| s == name) {
            out.push(name.to_string());
        }
    }
    out
}

#[async_trait]
impl KnowledgeGraphStore for SqliteKnowledgeGraph {
    async fn upsert_ticket(
        &self,
        id: &str,
        title: &str,
        resolution: &str,
        skills: &[String],
        embedding: &[f32],
    ) -> Result<()> {
        if embedding.is_empty() {
            return Err(Error::InvalidInput(
                "Ticket node requires a non-empty embedding".to_string(),
            ));
        }

        let skills = normalize_skills(skills);
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await.map_err(graph_err)?;

        sqlx::query(
            r#"
            INSERT INTO ticket_nodes (id, title, resolution, embedding, dimensions, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                resolution = excluded.resolution,
                embedding = excluded.embedding,
                dimensions = excluded.dimensions,
                created_at = excluded.created_at
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(resolution)
        .bind(encode_vector(embedding))
        .bind(embedding.len() as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(graph_err)?;

        if self.edge_policy == SkillEdgePolicy::Replace {
            sqlx::query("DELETE FROM requires_edges WHERE ticket_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(graph_err)?;
        }

        for skill in &skills {
            sqlx::query("INSERT INTO skill_nodes (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
                .bind(skill)
                .execute(&mut *tx)
                .await
                .map_err(graph_err)?;

            sqlx::query(
                "INSERT INTO requires_edges (ticket_id, skill_name) VALUES (?, ?) \
                 ON CONFLICT(ticket_id, skill_name) DO NOTHING",
            )
            .bind(id)
            .bind(skill)
            .execute(&mut *tx)
            .await
            .map_err(graph_err)?;
        }

        tx.commit().await.map_err(graph_err)?;

        info!(
            ticket_id = %id,
            skills = skills.len(),
            policy = self.edge_policy.as_str(),
            "Ticket stored in knowledge graph"
        );
        Ok(())
    }

    async fn get_ticket_node(&self, id: &str) -> Result<Option<TicketNode>> {
        let row: Option<TicketNodeRow> = sqlx::query_as(
            "SELECT id, title, resolution, embedding, created_at FROM ticket_nodes WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(graph_err)?;

        Ok(row.map(|r| r.into_node()))
    }

    async fn skills_for_ticket(&self, id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT skill_name FROM requires_edges WHERE ticket_id = ? ORDER BY skill_name",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(graph_err)?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn stats(&self) -> Result<GraphStats> {
        let (ticket_nodes, skill_nodes, requires_edges, vector_indexes): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM ticket_nodes),
                    (SELECT COUNT(*) FROM skill_nodes),
                    (SELECT COUNT(*) FROM requires_edges),
                    (SELECT COUNT(*) FROM vector_indexes)
                "#,
            )
            .fetch_one(&self.pool)
            .await
            .map_err(graph_err)?;

        debug!(ticket_nodes, skill_nodes, requires_edges, "Knowledge graph stats");

        Ok(GraphStats {
            ticket_nodes: ticket_nodes as u64,
            skill_nodes: skill_nodes as u64,
            requires_edges: requires_edges as u64,
            vector_indexes: vector_indexes as u64,
        })
    }
}

#[derive(Debug, FromRow)]
struct TicketNodeRow {
    id: String,
    title: String,
    resolution: String,
    embedding: Vec<u8>,
    created_at: String,
}

impl TicketNodeRow {
    fn into_node(self) -> TicketNode {
        TicketNode {
            id: self.id,
            title: self.title,
            resolution: self.resolution,
            embedding: decode_vector(&self.embedding),
            created_at: parse_timestamp(&self.created_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    async fn setup(policy: SkillEdgePolicy) -> SqliteKnowledgeGraph {
        let db = Database::in_memory().await.expect("Failed to create database");
        SqliteKnowledgeGraph::new(db.pool().clone()).with_edge_policy(policy)
    }

    fn skills(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_double_upsert_keeps_one_node() {
        let graph = setup(SkillEdgePolicy::Accumulate).await;

        graph
            .upsert_ticket("t-1", "Login broken", "Cleared cookies", &skills(&["React"]), &[1.0, 0.0])
            .await
            .unwrap();
        graph
            .upsert_ticket("t-1", "Login broken", "Rotated session key", &skills(&["Node.js"]), &[0.0, 1.0])
            .await
            .unwrap();

        let stats = graph.stats().await.unwrap();
        assert_eq!(stats.ticket_nodes, 1);
        assert_eq!(stats.skill_nodes, 2);

        let node = graph.get_ticket_node("t-1").await.unwrap().unwrap();
        assert_eq!(node.resolution, "Rotated session key");
        assert_eq!(node.embedding, vec![0.0, 1.0]);

        // Accumulate keeps the earlier edge
        assert_eq!(graph.skills_for_ticket("t-1").await.unwrap(), vec!["Node.js", "React"]);
    }

    #[tokio::test]
    async fn test_replace_policy_drops_stale_edges() {
        let graph = setup(SkillEdgePolicy::Replace).await;

        graph
            .upsert_ticket("t-1", "t", "r", &skills(&["React", "CSS"]), &[1.0])
            .await
            .unwrap();
        graph
            .upsert_ticket("t-1", "t", "r", &skills(&["CSS"]), &[1.0])
            .await
            .unwrap();

        assert_eq!(graph.skills_for_ticket("t-1").await.unwrap(), vec!["CSS"]);
        // Skill nodes themselves are shared and stay
        assert_eq!(graph.stats().await.unwrap().skill_nodes, 2);
    }

    #[tokio::test]
    async fn test_duplicate_skills_make_one_edge() {
        let graph = setup(SkillEdgePolicy::Accumulate).await;

        graph
            .upsert_ticket("t-1", "t", "r", &skills(&["React", " React ", ""]), &[1.0])
            .await
            .unwrap();
        graph
            .upsert_ticket("t-1", "t", "r", &skills(&["React"]), &[1.0])
            .await
            .unwrap();

        assert_eq!(graph.stats().await.unwrap().requires_edges, 1);
    }

    #[tokio::test]
    async fn test_empty_embedding_rejected() {
        let graph = setup(SkillEdgePolicy::Accumulate).await;
        let err = graph.upsert_ticket("t-1", "t", "r", &[], &[]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_retriable() {
        let db = Database::in_memory().await.unwrap();
        let graph = SqliteKnowledgeGraph::new(db.pool().clone());
        db.close().await;

        let err = graph.upsert_ticket("t-1", "t", "r", &[], &[1.0]).await.unwrap_err();
        assert!(matches!(err, Error::GraphStore(_)));
        assert!(err.is_retriable());
    }
}
