//! Audit log collaborator.
//!
//! Entries are appended after commit, outside any transaction, and are
//! best-effort: a failed append is logged and never affects committed state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serenity::model::id::GuildId;
use sqlx::Row;

use crate::actor::Actor;
use crate::database::Database;
use crate::error::Result;

/// One audit trail entry.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub guild_id: GuildId,
    pub actor_kind: String,
    pub actor_id: Option<u64>,
    pub action: String,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only audit log backed by the shared pool.
pub struct AuditLog {
    db: Arc<Database>,
}

impl AuditLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append one entry. Goes straight to the pool: callers invoke this after
    /// their transaction has committed.
    pub async fn append(
        &self,
        guild_id: GuildId,
        actor: Option<&Actor>,
        action: &str,
        details: Option<&str>,
    ) -> Result<()> {
        let actor_kind = actor.map(Actor::kind).unwrap_or("unknown");
        let actor_id = actor
            .and_then(|a| a.user_id().ok())
            .map(|u| u.get() as i64);

        sqlx::query(
            "INSERT INTO audit_log (guild_id, actor_kind, actor_id, action, details, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(guild_id.get() as i64)
        .bind(actor_kind)
        .bind(actor_id)
        .bind(action)
        .bind(details)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.pool())
        .await?;

        tracing::debug!(
            guild_id = guild_id.get(),
            actor_kind = actor_kind,
            action = action,
            "audit entry appended"
        );
        Ok(())
    }

    /// Recent entries for a guild, newest first.
    pub async fn entries(
        &self,
        guild_id: GuildId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, guild_id, actor_kind, actor_id, action, details, timestamp
             FROM audit_log WHERE guild_id = ?
             ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(guild_id.get() as i64)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(self.db.pool())
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(AuditEntry {
                id: row.get("id"),
                guild_id: GuildId::new(row.get::<i64, _>("guild_id") as u64),
                actor_kind: row.get("actor_kind"),
                actor_id: row.get::<Option<i64>, _>("actor_id").map(|id| id as u64),
                action: row.get("action"),
                details: row.get("details"),
                timestamp: chrono::DateTime::parse_from_rfc3339(row.get("timestamp"))
                    .map_err(|e| {
                        crate::error::TicketdError::Transaction(format!(
                            "invalid audit timestamp: {}",
                            e
                        ))
                    })?
                    .with_timezone(&Utc),
            });
        }
        Ok(entries)
    }
}
