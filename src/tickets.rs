//! Ticket aggregate, lifecycle events, transcripts and participants.
//!
//! This is the storage layer under the lifecycle coordinator: plain reads plus
//! conditional writes whose `WHERE` clauses carry the state guards, so a lost
//! update surfaces as zero affected rows instead of silently overwriting a
//! concurrent transition. Events are append-only and are the source of truth
//! for whether a ticket is currently claimed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serenity::model::id::{GuildId, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::actor::Actor;
use crate::database::Database;
use crate::error::{Result, TicketdError};
use crate::transaction::use_transaction;

/// Ticket lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Open,
    Claimed,
    Closed,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Claimed => "claimed",
            Self::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "claimed" => Some(Self::Claimed),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Lifecycle event kinds. Stable strings; stored rows are never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketAction {
    Created,
    Claimed,
    Unclaimed,
    Closed,
    Reopened,
    CloseRequested,
    CloseRequestCancelled,
    AutoClosed,
    Deleted,
    ExclusionChanged,
}

impl TicketAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Claimed => "claimed",
            Self::Unclaimed => "unclaimed",
            Self::Closed => "closed",
            Self::Reopened => "reopened",
            Self::CloseRequested => "close_requested",
            Self::CloseRequestCancelled => "close_request_cancelled",
            Self::AutoClosed => "auto_closed",
            Self::Deleted => "deleted",
            Self::ExclusionChanged => "exclusion_changed",
        }
    }
}

/// A pending, cancellable proposal to close a ticket.
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub id: String,
    pub requested_by: UserId,
    pub reason: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    /// Handle of the scheduled auto-close job, once registered.
    pub job_id: Option<String>,
}

/// The ticket aggregate.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub id: i64,
    pub guild_id: GuildId,
    /// Per-guild monotonically increasing sequence number.
    pub number: i64,
    pub opener_id: UserId,
    pub claimer_id: Option<UserId>,
    pub status: TicketStatus,
    pub subject: Option<String>,
    pub close_request: Option<CloseRequest>,
    pub autoclose_excluded: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// One immutable lifecycle event.
#[derive(Debug, Clone)]
pub struct TicketEvent {
    pub id: i64,
    pub ticket_id: i64,
    pub guild_id: GuildId,
    pub action: String,
    pub actor_kind: String,
    pub actor_id: Option<u64>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A close-request deadline awaiting a timer, as re-read at startup.
#[derive(Debug, Clone)]
pub struct PendingDeadline {
    pub ticket_id: i64,
    pub guild_id: GuildId,
    pub deadline: DateTime<Utc>,
}

/// Storage for tickets and their satellite rows.
pub struct TicketStore {
    db: Arc<Database>,
}

impl TicketStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // ========== Numbering and creation ==========

    /// Allocate the next ticket number for a guild. Runs inside the creating
    /// transaction, which serializes numbering per guild.
    pub async fn next_ticket_number(&self, guild_id: GuildId) -> Result<i64> {
        let row = use_transaction(&self.db)
            .fetch_one(
                sqlx::query(
                    "INSERT INTO ticket_counters (guild_id, last_number) VALUES (?, 1)
                     ON CONFLICT(guild_id) DO UPDATE SET last_number = last_number + 1
                     RETURNING last_number",
                )
                .bind(guild_id.get() as i64),
            )
            .await?;
        Ok(row.get("last_number"))
    }

    /// Insert a fresh OPEN ticket and return its row id.
    pub async fn insert_ticket(
        &self,
        guild_id: GuildId,
        number: i64,
        opener_id: UserId,
        subject: Option<&str>,
    ) -> Result<i64> {
        let result = use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "INSERT INTO tickets (guild_id, number, opener_id, status, subject, created_at)
                     VALUES (?, ?, ?, 'open', ?, ?)",
                )
                .bind(guild_id.get() as i64)
                .bind(number)
                .bind(opener_id.get() as i64)
                .bind(subject)
                .bind(Utc::now().to_rfc3339()),
            )
            .await?;
        Ok(result.last_insert_rowid())
    }

    // ========== Reads ==========

    /// Fetch a ticket by id within one guild. Soft-deleted rows and rows from
    /// other guilds both come back as `None`; callers translate that into
    /// `NotFound` so cross-tenant probing is indistinguishable from absence.
    pub async fn get_in_guild(&self, ticket_id: i64, guild_id: GuildId) -> Result<Option<Ticket>> {
        let row = use_transaction(&self.db)
            .fetch_optional(
                sqlx::query(
                    "SELECT * FROM tickets WHERE id = ? AND guild_id = ? AND deleted = 0",
                )
                .bind(ticket_id)
                .bind(guild_id.get() as i64),
            )
            .await?;
        row.map(map_ticket).transpose()
    }

    /// Count a user's open (open or claimed) tickets in a guild.
    pub async fn open_ticket_count(&self, guild_id: GuildId, opener_id: UserId) -> Result<u32> {
        let row = use_transaction(&self.db)
            .fetch_one(
                sqlx::query(
                    "SELECT COUNT(*) AS n FROM tickets
                     WHERE guild_id = ? AND opener_id = ? AND deleted = 0
                       AND status IN ('open', 'claimed')",
                )
                .bind(guild_id.get() as i64)
                .bind(opener_id.get() as i64),
            )
            .await?;
        Ok(row.get::<i64, _>("n") as u32)
    }

    /// A user's open tickets in a guild, oldest first.
    pub async fn open_tickets_for_user(
        &self,
        guild_id: GuildId,
        opener_id: UserId,
    ) -> Result<Vec<Ticket>> {
        let rows = use_transaction(&self.db)
            .fetch_all(
                sqlx::query(
                    "SELECT * FROM tickets
                     WHERE guild_id = ? AND opener_id = ? AND deleted = 0
                       AND status IN ('open', 'claimed')
                     ORDER BY number",
                )
                .bind(guild_id.get() as i64)
                .bind(opener_id.get() as i64),
            )
            .await?;
        rows.into_iter().map(map_ticket).collect()
    }

    /// Close-request deadlines that should have a live timer: open,
    /// non-deleted, non-excluded tickets with a pending deadline. Read at
    /// startup to rebuild the in-memory scheduler.
    pub async fn pending_close_deadlines(&self) -> Result<Vec<PendingDeadline>> {
        let rows = use_transaction(&self.db)
            .fetch_all(sqlx::query(
                "SELECT id, guild_id, close_request_deadline FROM tickets
                 WHERE deleted = 0 AND status = 'open' AND autoclose_excluded = 0
                   AND close_request_id IS NOT NULL
                   AND close_request_deadline IS NOT NULL",
            ))
            .await?;

        rows.iter()
            .map(|row| {
                Ok(PendingDeadline {
                    ticket_id: row.get("id"),
                    guild_id: GuildId::new(row.get::<i64, _>("guild_id") as u64),
                    deadline: parse_ts(row.get("close_request_deadline"))?,
                })
            })
            .collect()
    }

    // ========== Events ==========

    /// Append one immutable lifecycle event.
    pub async fn append_event(
        &self,
        ticket_id: i64,
        guild_id: GuildId,
        action: TicketAction,
        actor: &Actor,
        metadata: serde_json::Value,
    ) -> Result<()> {
        use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "INSERT INTO ticket_events (ticket_id, guild_id, action, actor_kind, actor_id, metadata, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(ticket_id)
                .bind(guild_id.get() as i64)
                .bind(action.as_str())
                .bind(actor.kind())
                .bind(actor.user_id().ok().map(|u| u.get() as i64))
                .bind(metadata.to_string())
                .bind(Utc::now().to_rfc3339()),
            )
            .await?;
        Ok(())
    }

    /// All events for a ticket in append order.
    pub async fn events(&self, ticket_id: i64) -> Result<Vec<TicketEvent>> {
        let rows = use_transaction(&self.db)
            .fetch_all(
                sqlx::query(
                    "SELECT id, ticket_id, guild_id, action, actor_kind, actor_id, metadata, created_at
                     FROM ticket_events WHERE ticket_id = ? ORDER BY id",
                )
                .bind(ticket_id),
            )
            .await?;

        rows.iter()
            .map(|row| {
                Ok(TicketEvent {
                    id: row.get("id"),
                    ticket_id: row.get("ticket_id"),
                    guild_id: GuildId::new(row.get::<i64, _>("guild_id") as u64),
                    action: row.get("action"),
                    actor_kind: row.get("actor_kind"),
                    actor_id: row.get::<Option<i64>, _>("actor_id").map(|id| id as u64),
                    metadata: serde_json::from_str(row.get("metadata"))
                        .unwrap_or(serde_json::Value::Null),
                    created_at: parse_ts(row.get("created_at"))?,
                })
            })
            .collect()
    }

    /// Who currently holds the claim, answered from the event log: the claim
    /// is active iff the latest claim-affecting event is `claimed`. A close
    /// ends any claim, so reopened tickets start unclaimed.
    pub async fn active_claimer(&self, ticket_id: i64) -> Result<Option<UserId>> {
        let row = use_transaction(&self.db)
            .fetch_optional(
                sqlx::query(
                    "SELECT action, actor_id FROM ticket_events
                     WHERE ticket_id = ?
                       AND action IN ('claimed', 'unclaimed', 'closed', 'auto_closed')
                     ORDER BY id DESC LIMIT 1",
                )
                .bind(ticket_id),
            )
            .await?;

        Ok(row.and_then(|row| {
            if row.get::<String, _>("action") == "claimed" {
                row.get::<Option<i64>, _>("actor_id")
                    .map(|id| UserId::new(id as u64))
            } else {
                None
            }
        }))
    }

    // ========== Conditional transitions ==========
    //
    // Each returns whether the guarded write took effect. A `false` under a
    // serialized write transaction means another caller got there first.

    pub async fn claim_if_claimable(
        &self,
        ticket_id: i64,
        claimer: UserId,
        force: bool,
    ) -> Result<bool> {
        let result = use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "UPDATE tickets SET status = 'claimed', claimer_id = ?
                     WHERE id = ? AND deleted = 0
                       AND (status = 'open' OR (status = 'claimed' AND ?))",
                )
                .bind(claimer.get() as i64)
                .bind(ticket_id)
                .bind(force as i64),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn unclaim_if_claimed(&self, ticket_id: i64) -> Result<bool> {
        let result = use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "UPDATE tickets SET status = 'open', claimer_id = NULL
                     WHERE id = ? AND deleted = 0 AND status = 'claimed'",
                )
                .bind(ticket_id),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Close the ticket and clear any claim and pending close request.
    pub async fn close_if_not_closed(&self, ticket_id: i64) -> Result<bool> {
        let result = use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "UPDATE tickets SET status = 'closed', closed_at = ?, claimer_id = NULL,
                        close_request_id = NULL, close_request_by = NULL,
                        close_request_reason = NULL, close_request_deadline = NULL,
                        autoclose_job_id = NULL
                     WHERE id = ? AND deleted = 0 AND status != 'closed'",
                )
                .bind(Utc::now().to_rfc3339())
                .bind(ticket_id),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn reopen_if_closed(&self, ticket_id: i64) -> Result<bool> {
        let result = use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "UPDATE tickets SET status = 'open', closed_at = NULL
                     WHERE id = ? AND deleted = 0 AND status = 'closed'",
                )
                .bind(ticket_id),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a pending close request on an OPEN ticket without one.
    pub async fn set_close_request(
        &self,
        ticket_id: i64,
        request_id: &str,
        requested_by: UserId,
        reason: Option<&str>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "UPDATE tickets SET close_request_id = ?, close_request_by = ?,
                        close_request_reason = ?, close_request_deadline = ?
                     WHERE id = ? AND deleted = 0 AND status = 'open'
                       AND close_request_id IS NULL",
                )
                .bind(request_id)
                .bind(requested_by.get() as i64)
                .bind(reason)
                .bind(deadline.map(|d| d.to_rfc3339()))
                .bind(ticket_id),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn clear_close_request(&self, ticket_id: i64) -> Result<bool> {
        let result = use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "UPDATE tickets SET close_request_id = NULL, close_request_by = NULL,
                        close_request_reason = NULL, close_request_deadline = NULL,
                        autoclose_job_id = NULL
                     WHERE id = ? AND close_request_id IS NOT NULL",
                )
                .bind(ticket_id),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Persist the scheduler's job handle for a pending close request.
    pub async fn set_autoclose_job(&self, ticket_id: i64, job_id: &str) -> Result<()> {
        use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "UPDATE tickets SET autoclose_job_id = ?
                     WHERE id = ? AND close_request_id IS NOT NULL",
                )
                .bind(job_id)
                .bind(ticket_id),
            )
            .await?;
        Ok(())
    }

    pub async fn set_autoclose_excluded(&self, ticket_id: i64, excluded: bool) -> Result<bool> {
        let result = use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "UPDATE tickets SET autoclose_excluded = ? WHERE id = ? AND deleted = 0",
                )
                .bind(excluded as i64)
                .bind(ticket_id),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Soft delete. The row and its events stay on disk forever.
    pub async fn soft_delete(&self, ticket_id: i64) -> Result<bool> {
        let result = use_transaction(&self.db)
            .execute(
                sqlx::query("UPDATE tickets SET deleted = 1 WHERE id = ? AND deleted = 0")
                    .bind(ticket_id),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // ========== Transcripts and participants ==========

    /// Create the empty transcript that accompanies every new ticket.
    pub async fn create_transcript(&self, ticket_id: i64, guild_id: GuildId) -> Result<()> {
        use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "INSERT INTO transcripts (ticket_id, guild_id, created_at) VALUES (?, ?, ?)",
                )
                .bind(ticket_id)
                .bind(guild_id.get() as i64)
                .bind(Utc::now().to_rfc3339()),
            )
            .await?;
        Ok(())
    }

    /// Append a message object to a ticket's transcript.
    pub async fn append_transcript_message(
        &self,
        ticket_id: i64,
        message: &serde_json::Value,
    ) -> Result<()> {
        let result = use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "UPDATE transcripts SET messages = json_insert(messages, '$[#]', json(?))
                     WHERE ticket_id = ?",
                )
                .bind(message.to_string())
                .bind(ticket_id),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(TicketdError::NotFound);
        }
        Ok(())
    }

    pub async fn transcript_messages(&self, ticket_id: i64) -> Result<Vec<serde_json::Value>> {
        let row = use_transaction(&self.db)
            .fetch_optional(
                sqlx::query("SELECT messages FROM transcripts WHERE ticket_id = ?")
                    .bind(ticket_id),
            )
            .await?
            .ok_or(TicketdError::NotFound)?;

        let raw: String = row.get("messages");
        serde_json::from_str(&raw)
            .map_err(|e| TicketdError::Transaction(format!("corrupt transcript: {}", e)))
    }

    /// Attach a user to the ticket conversation. Idempotent.
    pub async fn add_participant(&self, ticket_id: i64, user_id: UserId) -> Result<()> {
        use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "INSERT OR IGNORE INTO ticket_participants (ticket_id, user_id, added_at)
                     VALUES (?, ?, ?)",
                )
                .bind(ticket_id)
                .bind(user_id.get() as i64)
                .bind(Utc::now().to_rfc3339()),
            )
            .await?;
        Ok(())
    }

    pub async fn participants(&self, ticket_id: i64) -> Result<Vec<UserId>> {
        let rows = use_transaction(&self.db)
            .fetch_all(
                sqlx::query(
                    "SELECT user_id FROM ticket_participants WHERE ticket_id = ? ORDER BY added_at",
                )
                .bind(ticket_id),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| UserId::new(row.get::<i64, _>("user_id") as u64))
            .collect())
    }
}

fn map_ticket(row: SqliteRow) -> Result<Ticket> {
    let status_raw: String = row.get("status");
    let status = TicketStatus::from_str(&status_raw).ok_or_else(|| {
        TicketdError::Transaction(format!("invalid ticket status '{}'", status_raw))
    })?;

    let close_request = row
        .get::<Option<String>, _>("close_request_id")
        .map(|id| -> Result<CloseRequest> {
            // A request row without a requester is corrupt; surface it rather
            // than fabricating a zero user id, which the id type refuses.
            let requested_by = row
                .get::<Option<i64>, _>("close_request_by")
                .map(|raw| UserId::new(raw as u64))
                .ok_or_else(|| {
                    TicketdError::Transaction(format!(
                        "close request '{}' has no requester",
                        id
                    ))
                })?;
            Ok(CloseRequest {
                id,
                requested_by,
                reason: row.get("close_request_reason"),
                deadline: row
                    .get::<Option<String>, _>("close_request_deadline")
                    .map(|s| parse_ts(s))
                    .transpose()?,
                job_id: row.get("autoclose_job_id"),
            })
        })
        .transpose()?;

    Ok(Ticket {
        id: row.get("id"),
        guild_id: GuildId::new(row.get::<i64, _>("guild_id") as u64),
        number: row.get("number"),
        opener_id: UserId::new(row.get::<i64, _>("opener_id") as u64),
        claimer_id: row
            .get::<Option<i64>, _>("claimer_id")
            .map(|id| UserId::new(id as u64)),
        status,
        subject: row.get("subject"),
        close_request,
        autoclose_excluded: row.get::<i64, _>("autoclose_excluded") != 0,
        deleted: row.get::<i64, _>("deleted") != 0,
        created_at: parse_ts(row.get("created_at"))?,
        closed_at: row
            .get::<Option<String>, _>("closed_at")
            .map(parse_ts)
            .transpose()?,
    })
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TicketdError::Transaction(format!("invalid timestamp '{}': {}", raw, e)))
}
