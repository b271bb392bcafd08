//! SQLite implementation of the TicketStore

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use super::{NewTicket, Priority, Ticket, TicketStatus, TicketStore, TriageUpdate};
use crate::error::{Error, Result};
use crate::storage::parse_timestamp;

/// Rank of the stored status, mirrored from [`TicketStatus::rank`]
const STATUS_RANK_SQL: &str = "CASE status \
    WHEN 'CREATED' THEN 0 \
    WHEN 'TODO' THEN 1 \
    WHEN 'IN_PROGRESS' THEN 2 \
    ELSE 3 END";

/// SQLite-backed ticket store
#[derive(Clone)]
pub struct SqliteTicketStore {
    pool: SqlitePool,
}

impl SqliteTicketStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TicketStore for SqliteTicketStore {
    async fn create(&self, ticket: &NewTicket) -> Result<Ticket> {
        if ticket.title.trim().is_empty() || ticket.description.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Title and description are required".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO tickets (id, title, description, status, created_by, created_at, updated_at)
            VALUES (?, ?, ?, 'CREATED', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&ticket.title)
        .bind(&ticket.description)
        .bind(&ticket.created_by)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        debug!(ticket_id = %id, "Ticket created");

        self.find_by_id(&id)
            .await?
            .ok_or_else(|| Error::TicketNotFound(id))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Ticket>> {
        let row: Option<TicketRow> = sqlx::query_as("SELECT * FROM tickets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_ticket()).transpose()
    }

    async fn list(&self, limit: usize) -> Result<Vec<Ticket>> {
        let rows: Vec<TicketRow> =
            sqlx::query_as("SELECT * FROM tickets ORDER BY created_at DESC, id LIMIT ?")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(|r| r.into_ticket()).collect()
    }

    async fn update_status(&self, id: &str, status: TicketStatus) -> Result<bool> {
        let query = format!(
            "UPDATE tickets SET status = ?, updated_at = ? WHERE id = ? AND {} < ?",
            STATUS_RANK_SQL
        );
        let result = sqlx::query(&query)
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .bind(status.rank())
            .execute(&self.pool)
            .await?;

        let advanced = result.rows_affected() > 0;
        debug!(ticket_id = %id, status = %status, advanced, "Ticket status update");
        Ok(advanced)
    }

    async fn apply_triage(&self, id: &str, update: &TriageUpdate) -> Result<()> {
        let skills = serde_json::to_string(&update.related_skills)?;
        let in_progress = TicketStatus::InProgress;

        let query = format!(
            r#"
            UPDATE tickets SET
                priority = ?,
                helpful_notes = ?,
                related_skills = ?,
                status = CASE WHEN {rank} < ? THEN ? ELSE status END,
                updated_at = ?
            WHERE id = ?
            "#,
            rank = STATUS_RANK_SQL
        );

        let result = sqlx::query(&query)
            .bind(update.priority.as_str())
            .bind(&update.helpful_notes)
            .bind(&skills)
            .bind(in_progress.rank())
            .bind(in_progress.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::TicketNotFound(id.to_string()));
        }

        debug!(ticket_id = %id, priority = %update.priority, "Triage applied to ticket");
        Ok(())
    }

    async fn update_assigned_to(&self, id: &str, user_id: Option<&str>) -> Result<()> {
        let result = sqlx::query("UPDATE tickets SET assigned_to = ?, updated_at = ? WHERE id = ?")
            .bind(user_id)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::TicketNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn resolve(&self, id: &str, resolution: &str) -> Result<Ticket> {
        let result = sqlx::query(
            "UPDATE tickets SET resolution = ?, status = 'RESOLVED', updated_at = ? WHERE id = ?",
        )
        .bind(resolution)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::TicketNotFound(id.to_string()));
        }

        self.find_by_id(id)
            .await?
            .ok_or_else(|| Error::TicketNotFound(id.to_string()))
    }
}

#[derive(Debug, FromRow)]
struct TicketRow {
    id: String,
    title: String,
    description: String,
    status: String,
    priority: Option<String>,
    helpful_notes: Option<String>,
    related_skills: String,
    resolution: Option<String>,
    assigned_to: Option<String>,
    created_by: Option<String>,
    created_at: String,
}

impl TicketRow {
    fn into_ticket(self) -> Result<Ticket> {
        let status = TicketStatus::parse(&self.status)
            .ok_or_else(|| Error::Other(format!("Invalid ticket status: {}", self.status)))?;

        let related_skills: Vec<String> = serde_json::from_str(&self.related_skills)?;

        Ok(Ticket {
            id: self.id,
            title: self.title,
            description: self.description,
            status,
            priority: self.priority.as_deref().and_then(Priority::parse),
            helpful_notes: self.helpful_notes,
            related_skills,
            resolution: self.resolution,
            assigned_to: self.assigned_to,
            created_by: self.created_by,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}
