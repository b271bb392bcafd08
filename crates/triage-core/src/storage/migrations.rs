//! Database migrations
//!
//! This module manages SQLite schema migrations for triage.
//! Migrations are versioned and applied automatically on database connection.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Tickets and users
const MIGRATION_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY NOT NULL,
        email TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('user', 'moderator', 'admin')),
        skills TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_users_role ON users(role, created_at);

    CREATE TABLE IF NOT EXISTS tickets (
        id TEXT PRIMARY KEY NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'CREATED' CHECK (status IN ('CREATED', 'TODO', 'IN_PROGRESS', 'RESOLVED')),
        priority TEXT CHECK (priority IS NULL OR priority IN ('low', 'medium', 'high')),
        helpful_notes TEXT,
        related_skills TEXT NOT NULL DEFAULT '[]',
        resolution TEXT,
        assigned_to TEXT REFERENCES users(id) ON DELETE SET NULL,
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
    CREATE INDEX IF NOT EXISTS idx_tickets_assigned_to ON tickets(assigned_to);
    CREATE INDEX IF NOT EXISTS idx_tickets_created_at ON tickets(created_at);
"#;

/// Migration 2: Knowledge graph and vector index catalog
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS ticket_nodes (
        id TEXT PRIMARY KEY NOT NULL,
        title TEXT NOT NULL,
        resolution TEXT NOT NULL,
        embedding BLOB NOT NULL,
        dimensions INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS skill_nodes (
        name TEXT PRIMARY KEY NOT NULL
    );

    CREATE TABLE IF NOT EXISTS requires_edges (
        ticket_id TEXT NOT NULL REFERENCES ticket_nodes(id) ON DELETE CASCADE,
        skill_name TEXT NOT NULL REFERENCES skill_nodes(name) ON DELETE CASCADE,
        PRIMARY KEY (ticket_id, skill_name)
    );

    CREATE INDEX IF NOT EXISTS idx_requires_edges_skill ON requires_edges(skill_name);

    CREATE TABLE IF NOT EXISTS vector_indexes (
        name TEXT PRIMARY KEY NOT NULL,
        label TEXT NOT NULL,
        property TEXT NOT NULL,
        dimensions INTEGER NOT NULL,
        similarity_function TEXT NOT NULL CHECK (similarity_function IN ('cosine')),
        created_at TEXT NOT NULL
    );
"#;

/// Migration 3: Durable workflow runs and memoized steps
const MIGRATION_V3: &str = r#"
    CREATE TABLE IF NOT EXISTS workflow_runs (
        id TEXT PRIMARY KEY NOT NULL,
        function_id TEXT NOT NULL,
        event_id TEXT NOT NULL,
        event_name TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'running' CHECK (status IN ('running', 'succeeded', 'failed_non_retriable', 'failed_exhausted_retries')),
        attempts INTEGER NOT NULL DEFAULT 0,
        output TEXT,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs(status);
    CREATE INDEX IF NOT EXISTS idx_workflow_runs_updated_at ON workflow_runs(updated_at);

    CREATE TABLE IF NOT EXISTS workflow_steps (
        run_id TEXT NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        output TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        completed_at TEXT NOT NULL,
        PRIMARY KEY (run_id, name)
    );
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    // Ensure migrations table exists
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Tickets and users");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Knowledge graph and vector index");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    if current_version < 3 {
        tracing::info!("Applying migration v3: Workflow runs and steps");
        sqlx::raw_sql(MIGRATION_V3).execute(pool).await?;
        record_migration(pool, 3).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}
