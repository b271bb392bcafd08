//! Run and step records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    FailedNonRetriable,
    FailedExhaustedRetries,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::FailedNonRetriable => "failed_non_retriable",
            RunStatus::FailedExhaustedRetries => "failed_exhausted_retries",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed_non_retriable" => Some(RunStatus::FailedNonRetriable),
            "failed_exhausted_retries" => Some(RunStatus::FailedExhaustedRetries),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub function_id: String,
    pub event_id: String,
    pub event_name: String,
    pub payload: serde_json::Value,
    pub status: RunStatus,
    pub attempts: u32,
    pub output: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A completed, memoized step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub name: String,
    pub output: serde_json::Value,
    pub attempt: u32,
    pub completed_at: DateTime<Utc>,
}

/// Outcome handed back to whoever started the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub attempts: u32,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

impl From<&RunRecord> for RunResult {
    fn from(record: &RunRecord) -> Self {
        Self {
            run_id: record.id.clone(),
            status: record.status,
            attempts: record.attempts,
            output: record.output.clone(),
            error: record.last_error.clone(),
        }
    }
}
