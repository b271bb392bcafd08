//! Durable run journal
//!
//! Holds each run's status and the outputs of its completed steps so that a
//! retried or re-entered run resumes at the first step with no recorded output.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use super::events::EventEnvelope;
use super::run::{RunRecord, RunStatus, StepRecord};
use crate::error::{Error, Result};
use crate::storage::parse_timestamp;

#[async_trait]
pub trait RunJournal: Send + Sync {
    /// Create the run record if absent and return the stored record
    async fn begin_run(
        &self,
        run_id: &str,
        function_id: &str,
        envelope: &EventEnvelope,
    ) -> Result<RunRecord>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Most recently updated runs first
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>>;

    async fn record_attempt(&self, run_id: &str, attempt: u32) -> Result<()>;

    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Output of a completed step, if any
    async fn completed_step(&self, run_id: &str, name: &str) -> Result<Option<serde_json::Value>>;

    /// Record a step output unless one is already recorded. Returns the stored output.
    async fn record_step(
        &self,
        run_id: &str,
        name: &str,
        output: &serde_json::Value,
        attempt: u32,
    ) -> Result<serde_json::Value>;

    /// Completed steps in completion order
    async fn steps(&self, run_id: &str) -> Result<Vec<StepRecord>>;
}

#[derive(Clone)]
pub struct SqliteRunJournal {
    pool: SqlitePool,
}

impl SqliteRunJournal {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunJournal for SqliteRunJournal {
    async fn begin_run(
        &self,
        run_id: &str,
        function_id: &str,
        envelope: &EventEnvelope,
    ) -> Result<RunRecord> {
        let now = Utc::now().to_rfc3339();
        let payload = serde_json::to_string(&envelope.event.payload()?)?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_runs (id, function_id, event_id, event_name, payload, status, attempts, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'running', 0, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(function_id)
        .bind(&envelope.id)
        .bind(envelope.name())
        .bind(&payload)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(run_id = %run_id, "Run record created");
        }

        self.get_run(run_id)
            .await?
            .ok_or_else(|| Error::Other(format!("Run '{}' vanished after insert", run_id)))
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let row: Option<RunRow> = sqlx::query_as("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_record()).transpose()
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let rows: Vec<RunRow> =
            sqlx::query_as("SELECT * FROM workflow_runs ORDER BY updated_at DESC, id LIMIT ?")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(|r| r.into_record()).collect()
    }

    async fn record_attempt(&self, run_id: &str, attempt: u32) -> Result<()> {
        sqlx::query("UPDATE workflow_runs SET attempts = ?, status = 'running', updated_at = ? WHERE id = ?")
            .bind(attempt as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let output = output.map(serde_json::to_string).transpose()?;

        sqlx::query(
            "UPDATE workflow_runs SET status = ?, output = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn completed_step(&self, run_id: &str, name: &str) -> Result<Option<serde_json::Value>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT output FROM workflow_steps WHERE run_id = ? AND name = ?")
                .bind(run_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(output,)| serde_json::from_str(&output).map_err(Error::from))
            .transpose()
    }

    async fn record_step(
        &self,
        run_id: &str,
        name: &str,
        output: &serde_json::Value,
        attempt: u32,
    ) -> Result<serde_json::Value> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_steps (run_id, name, output, attempt, completed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(run_id, name) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(name)
        .bind(serde_json::to_string(output)?)
        .bind(attempt as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(run_id = %run_id, step = %name, "Step already recorded, keeping stored output");
        }

        self.completed_step(run_id, name)
            .await?
            .ok_or_else(|| Error::Other(format!("Step '{}' vanished after insert", name)))
    }

    async fn steps(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        let rows: Vec<StepRow> = sqlx::query_as(
            "SELECT name, output, attempt, completed_at FROM workflow_steps WHERE run_id = ? ORDER BY rowid",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_record()).collect()
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: String,
    function_id: String,
    event_id: String,
    event_name: String,
    payload: String,
    status: String,
    attempts: i64,
    output: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn into_record(self) -> Result<RunRecord> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| Error::Other(format!("Invalid run status: {}", self.status)))?;

        Ok(RunRecord {
            id: self.id,
            function_id: self.function_id,
            event_id: self.event_id,
            event_name: self.event_name,
            payload: serde_json::from_str(&self.payload)?,
            status,
            attempts: self.attempts.max(0) as u32,
            output: self.output.map(|o| serde_json::from_str(&o)).transpose()?,
            last_error: self.last_error,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}

#[derive(Debug, FromRow)]
struct StepRow {
    name: String,
    output: String,
    attempt: i64,
    completed_at: String,
}

impl StepRow {
    fn into_record(self) -> Result<StepRecord> {
        Ok(StepRecord {
            name: self.name,
            output: serde_json::from_str(&self.output)?,
            attempt: self.attempt.max(0) as u32,
            completed_at: parse_timestamp(&self.completed_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use crate::workflow::events::{TriageEvent, UserSignup};
    use serde_json::json;

    async fn setup() -> (SqliteRunJournal, EventEnvelope) {
        let db = Database::in_memory().await.expect("Failed to create database");
        let envelope = EventEnvelope::new(TriageEvent::UserSignup(UserSignup {
            email: "a@example.com".into(),
        }))
        .unwrap();
        (SqliteRunJournal::new(db.pool().clone()), envelope)
    }

    #[tokio::test]
    async fn test_begin_run_is_idempotent() {
        let (journal, envelope) = setup().await;

        let first = journal.begin_run("fn:1", "fn", &envelope).await.unwrap();
        journal.record_attempt("fn:1", 1).await.unwrap();
        let second = journal.begin_run("fn:1", "fn", &envelope).await.unwrap();

        assert_eq!(first.status, RunStatus::Running);
        assert_eq!(second.attempts, 1);
        assert_eq!(second.payload, json!({"email": "a@example.com"}));
        assert_eq!(journal.list_runs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_step_recorded_once() {
        let (journal, envelope) = setup().await;
        journal.begin_run("fn:1", "fn", &envelope).await.unwrap();

        assert!(journal.completed_step("fn:1", "a").await.unwrap().is_none());

        let stored = journal.record_step("fn:1", "a", &json!({"v": 1}), 1).await.unwrap();
        assert_eq!(stored, json!({"v": 1}));

        // A second writer sees the first output
        let stored = journal.record_step("fn:1", "a", &json!({"v": 2}), 2).await.unwrap();
        assert_eq!(stored, json!({"v": 1}));

        journal.record_step("fn:1", "b", &serde_json::Value::Null, 1).await.unwrap();
        assert_eq!(
            journal.completed_step("fn:1", "b").await.unwrap(),
            Some(serde_json::Value::Null)
        );

        let steps = journal.steps("fn:1").await.unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_finish_run() {
        let (journal, envelope) = setup().await;
        journal.begin_run("fn:1", "fn", &envelope).await.unwrap();
        journal
            .finish_run("fn:1", RunStatus::FailedNonRetriable, None, Some("[E003] nope"))
            .await
            .unwrap();

        let run = journal.get_run("fn:1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::FailedNonRetriable);
        assert_eq!(run.last_error.as_deref(), Some("[E003] nope"));
        assert!(run.output.is_none());
    }
}
