//! Support tickets
//!
//! The ticket record is owned by the ticket store. Workflows never keep their
//! own copy of truth; they read and write through [`TicketStore`].

mod sqlite;

pub use sqlite::SqliteTicketStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle status of a ticket. Ordering follows the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Created,
    Todo,
    InProgress,
    Resolved,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Created => "CREATED",
            TicketStatus::Todo => "TODO",
            TicketStatus::InProgress => "IN_PROGRESS",
            TicketStatus::Resolved => "RESOLVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(TicketStatus::Created),
            "TODO" => Some(TicketStatus::Todo),
            "IN_PROGRESS" => Some(TicketStatus::InProgress),
            "RESOLVED" => Some(TicketStatus::Resolved),
            _ => None,
        }
    }

    /// Position in the lifecycle, used to keep status transitions forward-only
    pub fn rank(&self) -> i64 {
        match self {
            TicketStatus::Created => 0,
            TicketStatus::Todo => 1,
            TicketStatus::InProgress => 2,
            TicketStatus::Resolved => 3,
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ticket priority as stored. Anything else the analyzer says becomes `Medium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }

    /// Coerce free-form model output into one of the three stored values
    pub fn normalize(raw: Option<&str>) -> Self {
        raw.and_then(Self::parse).unwrap_or(Priority::Medium)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A support ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: Option<Priority>,
    pub helpful_notes: Option<String>,
    pub related_skills: Vec<String>,
    pub resolution: Option<String>,
    pub assigned_to: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields required to open a ticket
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub title: String,
    pub description: String,
    pub created_by: Option<String>,
}

impl NewTicket {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            created_by: None,
        }
    }

    pub fn created_by(mut self, user_id: impl Into<String>) -> Self {
        self.created_by = Some(user_id.into());
        self
    }
}

/// Result of triage analysis applied to a ticket in one write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageUpdate {
    pub priority: Priority,
    pub helpful_notes: Option<String>,
    pub related_skills: Vec<String>,
}

/// Validate a ticket identifier before it reaches any store
pub fn parse_ticket_id(raw: &str) -> Result<String> {
    Uuid::parse_str(raw.trim())
        .map(|id| id.to_string())
        .map_err(|_| Error::InvalidTicketId(raw.to_string()))
}

/// Ticket persistence consumed by the workflows and the CLI
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Open a new ticket in status CREATED
    async fn create(&self, ticket: &NewTicket) -> Result<Ticket>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Ticket>>;

    /// Most recent tickets first
    async fn list(&self, limit: usize) -> Result<Vec<Ticket>>;

    /// Move the ticket forward to `status`. Returns false when the ticket is
    /// already at or beyond it, which leaves the row untouched.
    async fn update_status(&self, id: &str, status: TicketStatus) -> Result<bool>;

    /// Store priority, notes and skills and advance the ticket to IN_PROGRESS
    async fn apply_triage(&self, id: &str, update: &TriageUpdate) -> Result<()>;

    async fn update_assigned_to(&self, id: &str, user_id: Option<&str>) -> Result<()>;

    /// Record the resolution text and advance the ticket to RESOLVED
    async fn resolve(&self, id: &str, resolution: &str) -> Result<Ticket>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_normalization() {
        assert_eq!(Priority::normalize(Some("high")), Priority::High);
        assert_eq!(Priority::normalize(Some(" LOW ")), Priority::Low);
        assert_eq!(Priority::normalize(Some("HIGH")), Priority::High);
        assert_eq!(Priority::normalize(Some("urgent")), Priority::Medium);
        assert_eq!(Priority::normalize(Some("")), Priority::Medium);
        assert_eq!(Priority::normalize(None), Priority::Medium);
    }

    #[test]
    fn test_status_ordering() {
        assert!(TicketStatus::Created < TicketStatus::Todo);
        assert!(TicketStatus::Todo < TicketStatus::InProgress);
        assert!(TicketStatus::InProgress < TicketStatus::Resolved);
        assert_eq!(TicketStatus::parse("IN_PROGRESS"), Some(TicketStatus::InProgress));
        assert_eq!(TicketStatus::parse("in_progress"), None);
    }

    #[test]
    fn test_parse_ticket_id() {
        let id = Uuid::new_v4().to_string();
        assert_eq!(parse_ticket_id(&id).unwrap(), id);

        let err = parse_ticket_id("64f1c2-not-an-id").unwrap_err();
        assert!(matches!(err, Error::InvalidTicketId(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_ticket_serializes_camel_case() {
        let ticket = Ticket {
            id: "t".into(),
            title: "Login broken".into(),
            description: "500 on submit".into(),
            status: TicketStatus::InProgress,
            priority: Some(Priority::High),
            helpful_notes: None,
            related_skills: vec!["React".into()],
            resolution: None,
            assigned_to: None,
            created_by: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&ticket).unwrap();
        assert_eq!(json["status"], "IN_PROGRESS");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["relatedSkills"][0], "React");
    }
}
