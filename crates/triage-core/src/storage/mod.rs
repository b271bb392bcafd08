//! Storage layer - SQLite
//!
//! Provides database management and migrations for triage.
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//!
//! # Usage
//!
//! ```ignore
//! use triage_core::storage::Database;
//!
//! // Create an in-memory database for testing
//! let db = Database::in_memory().await?;
//!
//! // Every store shares the same pool
//! let tickets = SqliteTicketStore::new(db.pool().clone());
//! ```

pub mod database;
pub mod migrations;

pub use database::{Database, DatabaseConfig, default_database_path};
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};

/// Encode an embedding as little-endian f32 bytes for BLOB storage
pub(crate) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a BLOB written by [`encode_vector`]
pub(crate) fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Parse an RFC 3339 column, falling back to now for legacy rows
pub(crate) fn parse_timestamp(value: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}
