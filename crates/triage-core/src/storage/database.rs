//! SQLite database operations
//!
//! Provides connection pool management and database initialization for triage.
//! A single `Database` handle is built at process start and its pool is passed
//! into every store that needs it.

use crate::storage::migrations;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default maximum connections in the pool
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Database configuration options
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to run migrations automatically
    pub auto_migrate: bool,
    /// Journal mode (default: WAL so concurrent runs can read while one writes)
    pub journal_mode: SqliteJournalMode,
    /// Synchronous mode (default: NORMAL)
    pub synchronous: SqliteSynchronous,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            auto_migrate: true,
            journal_mode: SqliteJournalMode::Wal,
            synchronous: SqliteSynchronous::Normal,
        }
    }
}

impl DatabaseConfig {
    /// Create a new database config with the specified path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a config for an in-memory database (useful for testing)
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            max_connections: 1, // In-memory requires single connection
            auto_migrate: true,
            journal_mode: SqliteJournalMode::Wal,
            synchronous: SqliteSynchronous::Normal,
        }
    }

    /// Set the maximum number of connections
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Disable automatic migrations
    pub fn no_migrate(mut self) -> Self {
        self.auto_migrate = false;
        self
    }

    fn is_in_memory(&self) -> bool {
        self.path.to_string_lossy() == ":memory:"
    }
}

/// Get the default database path
pub fn default_database_path() -> PathBuf {
    if let Ok(custom) = std::env::var("TRIAGE_DATABASE") {
        return PathBuf::from(custom);
    }
    if let Some(config_dir) = dirs::config_dir() {
        config_dir.join("triage").join("triage.db")
    } else {
        PathBuf::from("triage.db")
    }
}

/// Database connection pool wrapper
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    config: DatabaseConfig,
}

impl Database {
    /// Create a new database connection with the given configuration
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !config.is_in_memory() && !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {:?}", parent)
                })?;
            }
        }

        let connection_str = if config.is_in_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", config.path.display())
        };

        let connect_options = SqliteConnectOptions::from_str(&connection_str)?
            .journal_mode(config.journal_mode)
            .synchronous(config.synchronous)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("Failed to connect to database: {:?}", config.path))?;

        let db = Self {
            pool,
            config: config.clone(),
        };

        if config.auto_migrate {
            db.migrate().await?;
        }

        Ok(db)
    }

    /// Create a database connection with default configuration
    pub async fn default() -> Result<Self> {
        Self::new(DatabaseConfig::default()).await
    }

    /// Create an in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self> {
        Self::new(DatabaseConfig::in_memory()).await
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool)
            .await
            .context("Failed to run database migrations")
    }

    /// Check migration status
    pub async fn migration_status(&self) -> Result<migrations::MigrationStatus> {
        migrations::migration_status(&self.pool)
            .await
            .context("Failed to check migration status")
    }

    /// Check if database is healthy
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }

    /// Close the database connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}
