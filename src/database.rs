//! SQLite database for persistent storage.
//!
//! Holds guild settings, support roles, grants, the blacklist, tickets with
//! their append-only lifecycle events, transcripts, participants, and the
//! audit log. Repositories never talk to the pool directly; they go through a
//! [`DbHandle`] so queries issued inside an ambient transaction share its
//! connection (see [`crate::transaction`]).

use std::path::Path;
use std::sync::Arc;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteQueryResult,
    SqliteRow,
};
use sqlx::Sqlite;

use crate::config::TxConfig;
use crate::error::{Result, TicketdError};

/// A raw positional-bind query, the shape every repository in this crate uses.
pub type SqlQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// A pooled connection shared with an ambient transaction scope.
pub type SharedConn = Arc<tokio::sync::Mutex<PoolConnection<Sqlite>>>;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `path` and initialize schema.
    pub async fn new(path: &str, tx: &TxConfig) -> Result<Self> {
        let db_path = Path::new(path);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    TicketdError::Config(format!("failed to create database directory: {}", e))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(tx.busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(tx.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| {
                TicketdError::Transaction(format!("failed to connect to database: {}", e))
            })?;

        let db = Self { pool };
        db.initialize_schema().await?;
        Ok(db)
    }

    /// Create an in-memory database for testing.
    ///
    /// Single connection only: each `:memory:` connection is its own database.
    /// Tests that need genuine connection concurrency use a tempfile path with
    /// [`Database::new`] instead.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                TicketdError::Transaction(format!("failed to create in-memory db: {}", e))
            })?;

        let db = Self { pool };
        db.initialize_schema().await?;
        Ok(db)
    }

    /// Initialize database schema. Idempotent.
    pub async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                TicketdError::Transaction(format!("failed to initialize schema: {}", e))
            })?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check if the database is healthy.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| TicketdError::Transaction(format!("health check failed: {}", e)))?;
        Ok(())
    }
}

/// Executor handle: either the shared pool (auto-commit) or the connection of
/// an ambient transaction. Obtained via [`crate::transaction::use_transaction`].
#[derive(Clone)]
pub enum DbHandle {
    /// No ambient transaction; queries auto-commit against the pool.
    Pool(SqlitePool),
    /// Queries join the ambient transaction's dedicated connection.
    Tx(SharedConn),
}

impl DbHandle {
    pub async fn execute(&self, query: SqlQuery<'_>) -> Result<SqliteQueryResult> {
        match self {
            Self::Pool(pool) => Ok(query.execute(pool).await?),
            Self::Tx(conn) => {
                let mut conn = conn.lock().await;
                Ok(query.execute(conn.as_mut()).await?)
            }
        }
    }

    pub async fn fetch_optional(&self, query: SqlQuery<'_>) -> Result<Option<SqliteRow>> {
        match self {
            Self::Pool(pool) => Ok(query.fetch_optional(pool).await?),
            Self::Tx(conn) => {
                let mut conn = conn.lock().await;
                Ok(query.fetch_optional(conn.as_mut()).await?)
            }
        }
    }

    pub async fn fetch_one(&self, query: SqlQuery<'_>) -> Result<SqliteRow> {
        match self {
            Self::Pool(pool) => Ok(query.fetch_one(pool).await?),
            Self::Tx(conn) => {
                let mut conn = conn.lock().await;
                Ok(query.fetch_one(conn.as_mut()).await?)
            }
        }
    }

    pub async fn fetch_all(&self, query: SqlQuery<'_>) -> Result<Vec<SqliteRow>> {
        match self {
            Self::Pool(pool) => Ok(query.fetch_all(pool).await?),
            Self::Tx(conn) => {
                let mut conn = conn.lock().await;
                Ok(query.fetch_all(conn.as_mut()).await?)
            }
        }
    }
}

/// Database schema SQL.
const SCHEMA: &str = r#"
-- Per-guild ticket settings
CREATE TABLE IF NOT EXISTS guild_settings (
    guild_id INTEGER PRIMARY KEY,
    owner_id INTEGER NOT NULL,
    max_open_tickets INTEGER NOT NULL DEFAULT 0,
    autoclose_hours INTEGER,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Support roles with permission bitmasks (32-digit hex)
CREATE TABLE IF NOT EXISTS support_roles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guild_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    permissions TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    is_default INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Role membership
CREATE TABLE IF NOT EXISTS role_members (
    role_id INTEGER NOT NULL,
    guild_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    assigned_by INTEGER NOT NULL,
    assigned_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(role_id, user_id),
    FOREIGN KEY (role_id) REFERENCES support_roles(id)
);

-- Per-user extra permission bits layered over roles
CREATE TABLE IF NOT EXISTS additional_grants (
    guild_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    permissions TEXT NOT NULL,
    granted_by INTEGER NOT NULL,
    granted_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (guild_id, user_id)
);

-- Users barred from opening tickets
CREATE TABLE IF NOT EXISTS blacklist (
    guild_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    added_by INTEGER NOT NULL,
    added_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (guild_id, user_id)
);

-- Monotonic per-guild ticket numbering; last_number is the highest allocated
CREATE TABLE IF NOT EXISTS ticket_counters (
    guild_id INTEGER PRIMARY KEY,
    last_number INTEGER NOT NULL DEFAULT 0
);

-- Ticket aggregates. Soft-delete only; rows are never removed.
CREATE TABLE IF NOT EXISTS tickets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guild_id INTEGER NOT NULL,
    number INTEGER NOT NULL,
    opener_id INTEGER NOT NULL,
    claimer_id INTEGER,
    status TEXT NOT NULL CHECK(status IN ('open', 'claimed', 'closed')),
    subject TEXT,
    close_request_id TEXT,
    close_request_by INTEGER,
    close_request_reason TEXT,
    close_request_deadline TEXT,
    autoclose_job_id TEXT,
    autoclose_excluded INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    closed_at TEXT,
    UNIQUE(guild_id, number)
);

-- Append-only lifecycle events; never updated or deleted
CREATE TABLE IF NOT EXISTS ticket_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticket_id INTEGER NOT NULL,
    guild_id INTEGER NOT NULL,
    action TEXT NOT NULL,
    actor_kind TEXT NOT NULL,
    actor_id INTEGER,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (ticket_id) REFERENCES tickets(id)
);

-- One transcript per ticket, created empty at open time
CREATE TABLE IF NOT EXISTS transcripts (
    ticket_id INTEGER PRIMARY KEY,
    guild_id INTEGER NOT NULL,
    messages TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (ticket_id) REFERENCES tickets(id)
);

-- Users attached to a ticket conversation
CREATE TABLE IF NOT EXISTS ticket_participants (
    ticket_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    added_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(ticket_id, user_id),
    FOREIGN KEY (ticket_id) REFERENCES tickets(id)
);

-- Audit log, appended after commit
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guild_id INTEGER NOT NULL,
    actor_kind TEXT NOT NULL,
    actor_id INTEGER,
    action TEXT NOT NULL,
    details TEXT,
    timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_support_roles_guild ON support_roles(guild_id, active);
CREATE INDEX IF NOT EXISTS idx_role_members_user ON role_members(guild_id, user_id);
CREATE INDEX IF NOT EXISTS idx_tickets_guild_status ON tickets(guild_id, status, deleted);
CREATE INDEX IF NOT EXISTS idx_tickets_opener ON tickets(guild_id, opener_id, status);
CREATE INDEX IF NOT EXISTS idx_ticket_events_ticket ON ticket_events(ticket_id, id);
CREATE INDEX IF NOT EXISTS idx_audit_guild ON audit_log(guild_id, timestamp DESC);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_in_memory_database() {
        let db = Database::in_memory().await.expect("should create db");
        db.health_check().await.expect("health check should pass");
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let db = Database::in_memory().await.expect("should create db");
        db.initialize_schema().await.expect("should be idempotent");
        db.health_check().await.expect("health check should pass");
    }

    #[tokio::test]
    async fn pool_handle_executes_queries() {
        let db = Database::in_memory().await.expect("should create db");
        let handle = DbHandle::Pool(db.pool().clone());

        handle
            .execute(
                sqlx::query(
                    "INSERT INTO guild_settings (guild_id, owner_id) VALUES (?, ?)",
                )
                .bind(1i64)
                .bind(2i64),
            )
            .await
            .expect("insert should work");

        let row = handle
            .fetch_optional(
                sqlx::query("SELECT owner_id FROM guild_settings WHERE guild_id = ?").bind(1i64),
            )
            .await
            .expect("select should work")
            .expect("row should exist");

        use sqlx::Row;
        assert_eq!(row.get::<i64, _>("owner_id"), 2);
    }

    #[tokio::test]
    async fn file_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("ticketd.db");
        let db = Database::new(path.to_str().unwrap(), &TxConfig::default())
            .await
            .expect("should create db");
        db.health_check().await.expect("health check should pass");
    }
}
