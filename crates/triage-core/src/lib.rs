//! Triage Core Library
//!
//! This crate provides the core functionality for Triage, including:
//! - Workflow orchestration (durable runs, memoized steps, retries)
//! - Ticket and user stores (SQLite)
//! - Knowledge graph of resolved tickets and a similarity index over it
//! - AI triage analysis (OpenRouter API)
//! - Skill-based moderator assignment
//! - Notification mail

pub mod assignment;
pub mod config;
pub mod embedding;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod mail;
pub mod storage;
pub mod tickets;
pub mod triage;
pub mod users;
pub mod workflow;

pub use error::{Error, ErrorClass, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorClass, Result};
    pub use crate::storage::Database;
    pub use crate::tickets::{NewTicket, Ticket, TicketStatus, TicketStore};
    pub use crate::users::{NewUser, Role, User, UserStore};
    pub use crate::workflow::{Dispatcher, EventEnvelope, RunResult, RunStatus, TriageEvent};
}
