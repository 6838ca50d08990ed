//! Ticket lifecycle coordination.
//!
//! Every operation here is one transactional unit of work: guards run first,
//! the state transition is a single conditional write, the lifecycle event is
//! appended in the same transaction, and audit entries plus scheduler changes
//! are deferred until after commit. Tickets are tenant-scoped throughout; a
//! ticket belonging to another guild is reported as missing, never as
//! forbidden, so existence does not leak across tenants.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serenity::model::id::{GuildId, UserId};
use uuid::Uuid;

use crate::actor::{self, Actor};
use crate::audit::AuditLog;
use crate::config::TxConfig;
use crate::database::Database;
use crate::error::{Result, TicketdError};
use crate::permissions::Permission;
use crate::roles::RoleService;
use crate::scheduler::{AutoCloseHandler, AutoCloseScheduler};
use crate::tickets::{Ticket, TicketAction, TicketEvent, TicketStatus, TicketStore};
use crate::transaction::{after_transaction, with_transaction};

/// Coordinates ticket state transitions.
pub struct TicketLifecycle {
    db: Arc<Database>,
    store: Arc<TicketStore>,
    roles: Arc<RoleService>,
    audit: Arc<AuditLog>,
    scheduler: Arc<dyn AutoCloseScheduler>,
    tx: TxConfig,
    /// Auto-close delay used when neither the caller nor the guild settings
    /// specify one.
    default_autoclose: Duration,
}

impl TicketLifecycle {
    pub fn new(
        db: Arc<Database>,
        store: Arc<TicketStore>,
        roles: Arc<RoleService>,
        audit: Arc<AuditLog>,
        scheduler: Arc<dyn AutoCloseScheduler>,
        tx: TxConfig,
        default_autoclose: Duration,
    ) -> Self {
        Self {
            db,
            store,
            roles,
            audit,
            scheduler,
            tx,
            default_autoclose,
        }
    }

    // ========== Creation ==========

    /// Open a new ticket for the current actor.
    ///
    /// Blacklisted users are refused outright. The per-guild open-ticket limit
    /// applies unless the actor holds `bypass_ticket_limit`.
    pub async fn create_ticket(&self, guild_id: GuildId, subject: Option<&str>) -> Result<Ticket> {
        let acting = self.tenant_actor(guild_id)?;
        let opener = acting.user_id()?;

        with_transaction(&self.db, &self.tx, || async {
            if self.roles.is_blacklisted(guild_id, opener).await? {
                return Err(TicketdError::PermissionDenied {
                    permission: "open_tickets".to_string(),
                    actor_kind: acting.kind(),
                });
            }

            if !acting.has_permission(Permission::BypassTicketLimit) {
                if let Some(settings) = self.roles.guild_settings(guild_id).await? {
                    if settings.max_open_tickets > 0 {
                        let open = self.store.open_ticket_count(guild_id, opener).await?;
                        if open >= settings.max_open_tickets {
                            return Err(TicketdError::Conflict("ticket_limit_reached"));
                        }
                    }
                }
            }

            let number = self.store.next_ticket_number(guild_id).await?;
            let ticket_id = self
                .store
                .insert_ticket(guild_id, number, opener, subject)
                .await?;
            self.store.create_transcript(ticket_id, guild_id).await?;
            self.store.add_participant(ticket_id, opener).await?;
            self.store
                .append_event(
                    ticket_id,
                    guild_id,
                    TicketAction::Created,
                    &acting,
                    serde_json::json!({ "number": number, "subject": subject }),
                )
                .await?;

            self.audit_after_commit(
                guild_id,
                "ticket_created",
                format!("ticket #{} (id {})", number, ticket_id),
            )
            .await;

            tracing::info!(
                guild_id = guild_id.get(),
                ticket_id,
                number,
                opener = opener.get(),
                "ticket created"
            );
            self.require_ticket(ticket_id, guild_id).await
        })
        .await
    }

    // ========== Claiming ==========

    /// Claim an open ticket. Requires `claim_tickets`. With `force`, a ticket
    /// already claimed by someone else is taken over under the same
    /// permission.
    pub async fn claim(&self, guild_id: GuildId, ticket_id: i64, force: bool) -> Result<Ticket> {
        let acting = self.tenant_actor(guild_id)?;
        let claimer = acting.user_id()?;
        acting.require_permission(Permission::ClaimTickets)?;

        with_transaction(&self.db, &self.tx, || async {
            let ticket = self.require_ticket(ticket_id, guild_id).await?;
            if ticket.status == TicketStatus::Closed {
                return Err(TicketdError::Conflict("ticket_closed"));
            }

            // The guarded update decides the race: under the serialized write
            // transaction exactly one concurrent claimer sees a row change.
            if !self
                .store
                .claim_if_claimable(ticket_id, claimer, force)
                .await?
            {
                return Err(TicketdError::Conflict("already_claimed"));
            }

            self.store
                .append_event(
                    ticket_id,
                    guild_id,
                    TicketAction::Claimed,
                    &acting,
                    serde_json::json!({ "force": force }),
                )
                .await?;

            self.audit_after_commit(guild_id, "ticket_claimed", format!("ticket id {}", ticket_id))
                .await;
            self.require_ticket(ticket_id, guild_id).await
        })
        .await
    }

    /// Release a claim. The active claimer may always release their own;
    /// anyone else needs `claim_tickets`.
    pub async fn unclaim(&self, guild_id: GuildId, ticket_id: i64) -> Result<Ticket> {
        let acting = self.tenant_actor(guild_id)?;

        with_transaction(&self.db, &self.tx, || async {
            let ticket = self.require_ticket(ticket_id, guild_id).await?;
            if ticket.status != TicketStatus::Claimed {
                return Err(TicketdError::Conflict("not_claimed"));
            }

            let is_claimer = acting.user_id().ok() == ticket.claimer_id;
            if !is_claimer {
                acting.require_permission(Permission::ClaimTickets)?;
            }

            if !self.store.unclaim_if_claimed(ticket_id).await? {
                return Err(TicketdError::Conflict("not_claimed"));
            }

            self.store
                .append_event(
                    ticket_id,
                    guild_id,
                    TicketAction::Unclaimed,
                    &acting,
                    serde_json::json!({}),
                )
                .await?;

            self.audit_after_commit(guild_id, "ticket_unclaimed", format!("ticket id {}", ticket_id))
                .await;
            self.require_ticket(ticket_id, guild_id).await
        })
        .await
    }

    // ========== Closing and reopening ==========

    /// Close a ticket. The opener and the active claimer may close it; anyone
    /// else needs `close_any_ticket`. Closing ends any claim and clears any
    /// pending close request.
    pub async fn close(
        &self,
        guild_id: GuildId,
        ticket_id: i64,
        reason: Option<&str>,
    ) -> Result<Ticket> {
        let acting = self.tenant_actor(guild_id)?;

        with_transaction(&self.db, &self.tx, || async {
            let ticket = self.require_ticket(ticket_id, guild_id).await?;
            let user = acting.user_id().ok();
            if user != Some(ticket.opener_id) && user != ticket.claimer_id {
                acting.require_permission(Permission::CloseAnyTicket)?;
            }

            if !self.store.close_if_not_closed(ticket_id).await? {
                return Err(TicketdError::Conflict("already_closed"));
            }

            self.store
                .append_event(
                    ticket_id,
                    guild_id,
                    TicketAction::Closed,
                    &acting,
                    serde_json::json!({ "reason": reason }),
                )
                .await?;

            self.disarm_after_commit(ticket_id).await;
            self.audit_after_commit(guild_id, "ticket_closed", format!("ticket id {}", ticket_id))
                .await;

            tracing::info!(guild_id = guild_id.get(), ticket_id, "ticket closed");
            self.require_ticket(ticket_id, guild_id).await
        })
        .await
    }

    /// Reopen a closed ticket. The opener may reopen their own; anyone else
    /// needs `close_any_ticket`. Reopened tickets come back unclaimed.
    pub async fn reopen(&self, guild_id: GuildId, ticket_id: i64) -> Result<Ticket> {
        let acting = self.tenant_actor(guild_id)?;

        with_transaction(&self.db, &self.tx, || async {
            let ticket = self.require_ticket(ticket_id, guild_id).await?;
            if acting.user_id().ok() != Some(ticket.opener_id) {
                acting.require_permission(Permission::CloseAnyTicket)?;
            }

            if !self.store.reopen_if_closed(ticket_id).await? {
                return Err(TicketdError::Conflict("not_closed"));
            }

            self.store
                .append_event(
                    ticket_id,
                    guild_id,
                    TicketAction::Reopened,
                    &acting,
                    serde_json::json!({}),
                )
                .await?;

            self.audit_after_commit(guild_id, "ticket_reopened", format!("ticket id {}", ticket_id))
                .await;
            self.require_ticket(ticket_id, guild_id).await
        })
        .await
    }

    // ========== Close requests and auto-close ==========

    /// Propose closing an open ticket, arming an auto-close deadline.
    /// Requires `claim_tickets`. A ticket carries at most one pending request.
    pub async fn request_close(
        &self,
        guild_id: GuildId,
        ticket_id: i64,
        reason: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<Ticket> {
        let acting = self.tenant_actor(guild_id)?;
        let requester = acting.user_id()?;
        acting.require_permission(Permission::ClaimTickets)?;

        with_transaction(&self.db, &self.tx, || async {
            let ticket = self.require_ticket(ticket_id, guild_id).await?;
            if ticket.status == TicketStatus::Closed {
                return Err(TicketdError::Conflict("ticket_closed"));
            }
            if ticket.close_request.is_some() {
                return Err(TicketdError::Conflict("close_request_pending"));
            }

            let delay = match delay {
                Some(delay) => delay,
                None => match self.roles.guild_settings(guild_id).await? {
                    Some(settings) => settings
                        .autoclose_hours
                        .map(|h| Duration::from_secs(u64::from(h) * 3600))
                        .unwrap_or(self.default_autoclose),
                    None => self.default_autoclose,
                },
            };
            // An excluded ticket still records the request, but without a
            // deadline and without arming a timer.
            let armed = !ticket.autoclose_excluded;
            let deadline = if armed {
                Some(Utc::now()
                    + chrono::Duration::from_std(delay).map_err(|_| {
                        TicketdError::Validation("auto-close delay too large".to_string())
                    })?)
            } else {
                None
            };

            let request_id = Uuid::new_v4().to_string();
            if !self
                .store
                .set_close_request(ticket_id, &request_id, requester, reason, deadline)
                .await?
            {
                // The guarded update refuses claimed tickets too: a request on
                // a claimed ticket would fight the active handler.
                return Err(TicketdError::Conflict("not_open"));
            }

            self.store
                .append_event(
                    ticket_id,
                    guild_id,
                    TicketAction::CloseRequested,
                    &acting,
                    serde_json::json!({
                        "request_id": request_id,
                        "reason": reason,
                        "deadline": deadline.map(|d| d.to_rfc3339()),
                    }),
                )
                .await?;

            // Arm the timer only once the request is durable; the job id is
            // persisted outside the transaction so a commit failure never
            // leaves a live timer behind.
            if armed {
                let scheduler = self.scheduler.clone();
                let store = self.store.clone();
                after_transaction(async move {
                    let job_id = scheduler.schedule(ticket_id, guild_id, delay);
                    store.set_autoclose_job(ticket_id, &job_id).await
                })
                .await;
            }

            self.audit_after_commit(
                guild_id,
                "close_requested",
                format!("ticket id {}", ticket_id),
            )
            .await;
            self.require_ticket(ticket_id, guild_id).await
        })
        .await
    }

    /// Withdraw a pending close request and disarm its timer. Only the ticket
    /// opener may do this; the request exists to give the opener the last
    /// word.
    pub async fn cancel_close_request(&self, guild_id: GuildId, ticket_id: i64) -> Result<Ticket> {
        let acting = self.tenant_actor(guild_id)?;

        with_transaction(&self.db, &self.tx, || async {
            let ticket = self.require_ticket(ticket_id, guild_id).await?;
            let request = ticket
                .close_request
                .as_ref()
                .ok_or(TicketdError::Conflict("no_close_request"))?;

            if acting.user_id().ok() != Some(ticket.opener_id) {
                return Err(TicketdError::PermissionDenied {
                    permission: "cancel_close_request".to_string(),
                    actor_kind: acting.kind(),
                });
            }

            if !self.store.clear_close_request(ticket_id).await? {
                return Err(TicketdError::Conflict("no_close_request"));
            }

            self.store
                .append_event(
                    ticket_id,
                    guild_id,
                    TicketAction::CloseRequestCancelled,
                    &acting,
                    serde_json::json!({ "request_id": request.id }),
                )
                .await?;

            self.disarm_after_commit(ticket_id).await;
            self.audit_after_commit(
                guild_id,
                "close_request_cancelled",
                format!("ticket id {}", ticket_id),
            )
            .await;
            self.require_ticket(ticket_id, guild_id).await
        })
        .await
    }

    /// Fired by the scheduler when a close-request deadline passes. Runs under
    /// a system identity; stale firings (request withdrawn, ticket claimed or
    /// closed meanwhile, exclusion set) are dropped silently.
    pub async fn auto_close(&self, ticket_id: i64, guild_id: GuildId, job_id: &str) -> Result<()> {
        let system = Actor::System {
            process: "autoclose",
            guild_id,
        };

        with_transaction(&self.db, &self.tx, || async {
            let ticket = match self.store.get_in_guild(ticket_id, guild_id).await? {
                Some(ticket) => ticket,
                None => return Ok(()),
            };

            let current_job = ticket
                .close_request
                .as_ref()
                .and_then(|req| req.job_id.as_deref());
            if current_job != Some(job_id) {
                tracing::debug!(ticket_id, job_id, "stale auto-close job ignored");
                return Ok(());
            }
            if ticket.autoclose_excluded || ticket.status != TicketStatus::Open {
                self.store.clear_close_request(ticket_id).await?;
                return Ok(());
            }

            if !self.store.close_if_not_closed(ticket_id).await? {
                return Ok(());
            }

            self.store
                .append_event(
                    ticket_id,
                    guild_id,
                    TicketAction::AutoClosed,
                    &system,
                    serde_json::json!({ "job_id": job_id }),
                )
                .await?;

            let audit = self.audit.clone();
            after_transaction(async move {
                audit
                    .append(
                        guild_id,
                        Some(&Actor::System {
                            process: "autoclose",
                            guild_id,
                        }),
                        "ticket_auto_closed",
                        Some(&format!("ticket id {}", ticket_id)),
                    )
                    .await
            })
            .await;

            tracing::info!(guild_id = guild_id.get(), ticket_id, "ticket auto-closed");
            Ok(())
        })
        .await
    }

    /// Rebuild timers for close-request deadlines that outlived the process.
    /// Called once at startup; deadlines already in the past fire right away.
    /// Each re-armed timer gets a fresh job id, so anything the old process
    /// had in flight is stale by construction.
    pub async fn rearm_autoclose_timers(&self) -> Result<usize> {
        let pending = self.store.pending_close_deadlines().await?;
        let count = pending.len();
        for entry in pending {
            let delay = (entry.deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let job_id = self
                .scheduler
                .schedule(entry.ticket_id, entry.guild_id, delay);
            self.store.set_autoclose_job(entry.ticket_id, &job_id).await?;
        }
        if count > 0 {
            tracing::info!(count, "re-armed auto-close timers");
        }
        Ok(count)
    }

    /// Exempt a ticket from auto-close (or lift the exemption). The opener may
    /// toggle it on their own ticket; anyone else needs
    /// `manage_guild_settings`. A pending deadline stays armed but will not
    /// fire while the exemption holds.
    pub async fn set_autoclose_excluded(
        &self,
        guild_id: GuildId,
        ticket_id: i64,
        excluded: bool,
    ) -> Result<Ticket> {
        let acting = self.tenant_actor(guild_id)?;

        with_transaction(&self.db, &self.tx, || async {
            let ticket = self.require_ticket(ticket_id, guild_id).await?;
            if acting.user_id().ok() != Some(ticket.opener_id) {
                acting.require_permission(Permission::ManageGuildSettings)?;
            }
            self.store.set_autoclose_excluded(ticket_id, excluded).await?;
            self.store
                .append_event(
                    ticket_id,
                    guild_id,
                    TicketAction::ExclusionChanged,
                    &acting,
                    serde_json::json!({ "excluded": excluded }),
                )
                .await?;
            self.require_ticket(ticket_id, guild_id).await
        })
        .await
    }

    // ========== Deletion ==========

    /// Soft-delete a ticket. Requires `delete_tickets`. The row and its event
    /// history survive on disk but disappear from every read path.
    pub async fn soft_delete(&self, guild_id: GuildId, ticket_id: i64) -> Result<()> {
        let acting = self.tenant_actor(guild_id)?;
        acting.require_permission(Permission::DeleteTickets)?;

        with_transaction(&self.db, &self.tx, || async {
            self.require_ticket(ticket_id, guild_id).await?;
            self.store
                .append_event(
                    ticket_id,
                    guild_id,
                    TicketAction::Deleted,
                    &acting,
                    serde_json::json!({}),
                )
                .await?;
            if !self.store.soft_delete(ticket_id).await? {
                return Err(TicketdError::NotFound);
            }

            self.disarm_after_commit(ticket_id).await;
            self.audit_after_commit(guild_id, "ticket_deleted", format!("ticket id {}", ticket_id))
                .await;
            Ok(())
        })
        .await
    }

    // ========== Reads ==========

    /// Fetch a ticket. The opener always sees their own; anyone else needs
    /// `view_tickets`.
    pub async fn get_ticket(&self, guild_id: GuildId, ticket_id: i64) -> Result<Ticket> {
        let acting = self.tenant_actor(guild_id)?;
        let ticket = self.require_ticket(ticket_id, guild_id).await?;
        if acting.user_id().ok() != Some(ticket.opener_id) {
            acting.require_permission(Permission::ViewTickets)?;
        }
        Ok(ticket)
    }

    /// Lifecycle history of a ticket. Same visibility as [`get_ticket`].
    pub async fn ticket_events(&self, guild_id: GuildId, ticket_id: i64) -> Result<Vec<TicketEvent>> {
        self.get_ticket(guild_id, ticket_id).await?;
        self.store.events(ticket_id).await
    }

    /// A user's open tickets in the guild, oldest first. Listing someone
    /// else's needs `view_tickets`.
    pub async fn open_tickets_for_user(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> Result<Vec<Ticket>> {
        let acting = self.tenant_actor(guild_id)?;
        if acting.user_id().ok() != Some(user_id) {
            acting.require_permission(Permission::ViewTickets)?;
        }
        self.store.open_tickets_for_user(guild_id, user_id).await
    }

    /// Transcript of a ticket. The opener sees their own; anyone else needs
    /// `view_transcripts`.
    pub async fn transcript(
        &self,
        guild_id: GuildId,
        ticket_id: i64,
    ) -> Result<Vec<serde_json::Value>> {
        let acting = self.tenant_actor(guild_id)?;
        let ticket = self.require_ticket(ticket_id, guild_id).await?;
        if acting.user_id().ok() != Some(ticket.opener_id) {
            acting.require_permission(Permission::ViewTranscripts)?;
        }
        self.store.transcript_messages(ticket.id).await
    }

    /// Record a message in a ticket's transcript and track the author as a
    /// participant.
    pub async fn record_message(
        &self,
        guild_id: GuildId,
        ticket_id: i64,
        content: &str,
    ) -> Result<()> {
        let acting = self.tenant_actor(guild_id)?;
        let author = acting.user_id()?;

        with_transaction(&self.db, &self.tx, || async {
            let ticket = self.require_ticket(ticket_id, guild_id).await?;
            if ticket.status == TicketStatus::Closed {
                return Err(TicketdError::Conflict("ticket_closed"));
            }

            self.store
                .append_transcript_message(
                    ticket_id,
                    &serde_json::json!({
                        "author": author.get(),
                        "content": content,
                        "at": Utc::now().to_rfc3339(),
                    }),
                )
                .await?;
            self.store.add_participant(ticket_id, author).await
        })
        .await
    }

    // ========== Internals ==========

    /// The ambient actor, checked against the target guild. A mismatch reads
    /// as the ticket not existing in the actor's guild.
    fn tenant_actor(&self, guild_id: GuildId) -> Result<Actor> {
        let acting = actor::current()?;
        if acting.guild_id() != guild_id {
            return Err(TicketdError::NotFound);
        }
        Ok(acting)
    }

    async fn require_ticket(&self, ticket_id: i64, guild_id: GuildId) -> Result<Ticket> {
        self.store
            .get_in_guild(ticket_id, guild_id)
            .await?
            .ok_or(TicketdError::NotFound)
    }

    async fn disarm_after_commit(&self, ticket_id: i64) {
        let scheduler = self.scheduler.clone();
        after_transaction(async move {
            scheduler.cancel_for_ticket(ticket_id);
            Ok(())
        })
        .await;
    }

    async fn audit_after_commit(&self, guild_id: GuildId, action: &'static str, details: String) {
        let audit = self.audit.clone();
        let acting = actor::maybe_current();
        after_transaction(async move {
            audit
                .append(guild_id, acting.as_ref(), action, Some(&details))
                .await
        })
        .await;
    }
}

/// Build the scheduler fire handler for a lifecycle service.
pub fn autoclose_handler(lifecycle: Arc<TicketLifecycle>) -> AutoCloseHandler {
    Arc::new(move |ticket_id, guild_id, job_id| {
        let lifecycle = lifecycle.clone();
        Box::pin(async move {
            if let Err(err) = lifecycle.auto_close(ticket_id, guild_id, &job_id).await {
                err.log("auto_close");
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serenity::model::id::UserId;

    use crate::permissions::PermissionSet;
    use crate::roles::GuildSettings;
    use crate::scheduler::TokioScheduler;

    const GUILD: u64 = 500;
    const OTHER_GUILD: u64 = 600;
    const OWNER: u64 = 1;
    const OPENER: u64 = 10;
    const STAFF: u64 = 20;
    const SENIOR: u64 = 30;
    const COLLEAGUE: u64 = 40;

    struct Fixture {
        lifecycle: Arc<TicketLifecycle>,
        audit: Arc<AuditLog>,
        scheduler: Arc<TokioScheduler>,
    }

    async fn fixture() -> Fixture {
        fixture_with_settings(GuildSettings {
            guild_id: GuildId::new(GUILD),
            owner_id: UserId::new(OWNER),
            max_open_tickets: 0,
            autoclose_hours: None,
        })
        .await
    }

    async fn fixture_with_settings(settings: GuildSettings) -> Fixture {
        let db = Arc::new(Database::in_memory().await.expect("db"));
        let audit = Arc::new(AuditLog::new(db.clone()));
        let roles = Arc::new(RoleService::new(db.clone(), audit.clone()));
        let store = Arc::new(TicketStore::new(db.clone()));
        let scheduler = Arc::new(TokioScheduler::new());

        actor::provide(
            Actor::System {
                process: "setup",
                guild_id: settings.guild_id,
            },
            roles.upsert_guild_settings(&settings),
        )
        .await
        .expect("settings");

        let lifecycle = Arc::new(TicketLifecycle::new(
            db,
            store,
            roles,
            audit.clone(),
            scheduler.clone(),
            TxConfig::default(),
            Duration::from_secs(3600),
        ));
        scheduler.set_handler(autoclose_handler(lifecycle.clone()));

        Fixture {
            lifecycle,
            audit,
            scheduler,
        }
    }

    fn opener() -> Actor {
        member(OPENER, &[])
    }

    fn staff() -> Actor {
        member(STAFF, &[Permission::ViewTickets, Permission::ClaimTickets])
    }

    fn senior() -> Actor {
        member(
            SENIOR,
            &[
                Permission::ViewTickets,
                Permission::ClaimTickets,
                Permission::CloseAnyTicket,
                Permission::DeleteTickets,
                Permission::ManageGuildSettings,
            ],
        )
    }

    fn member(user: u64, flags: &[Permission]) -> Actor {
        Actor::Member {
            user_id: UserId::new(user),
            guild_id: GuildId::new(GUILD),
            permissions: PermissionSet::from_flags(flags),
        }
    }

    async fn open_ticket(fx: &Fixture) -> Ticket {
        actor::provide(
            opener(),
            fx.lifecycle.create_ticket(GuildId::new(GUILD), Some("help")),
        )
        .await
        .expect("create")
    }

    #[tokio::test]
    async fn create_ticket_initializes_everything() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;

        assert_eq!(ticket.number, 1);
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(ticket.opener_id, UserId::new(OPENER));
        assert_eq!(ticket.subject.as_deref(), Some("help"));

        // Opener sees their own ticket, history and transcript.
        let (events, transcript) = actor::provide(opener(), async {
            let events = fx
                .lifecycle
                .ticket_events(GuildId::new(GUILD), ticket.id)
                .await?;
            let transcript = fx.lifecycle.transcript(GuildId::new(GUILD), ticket.id).await?;
            Ok::<_, TicketdError>((events, transcript))
        })
        .await
        .expect("read back");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "created");
        assert!(transcript.is_empty());

        // Audit entry landed after commit.
        let audit = fx.audit.entries(GuildId::new(GUILD), 10, 0).await.unwrap();
        assert_eq!(audit[0].action, "ticket_created");
    }

    #[tokio::test]
    async fn create_requires_matching_guild() {
        let fx = fixture().await;
        let err = actor::provide(
            opener(),
            fx.lifecycle.create_ticket(GuildId::new(OTHER_GUILD), None),
        )
        .await
        .expect_err("wrong guild");
        assert!(matches!(err, TicketdError::NotFound));
    }

    #[tokio::test]
    async fn ticket_limit_blocks_and_bypass_flag_lifts_it() {
        let fx = fixture_with_settings(GuildSettings {
            guild_id: GuildId::new(GUILD),
            owner_id: UserId::new(OWNER),
            max_open_tickets: 1,
            autoclose_hours: None,
        })
        .await;

        open_ticket(&fx).await;
        let err = actor::provide(
            opener(),
            fx.lifecycle.create_ticket(GuildId::new(GUILD), None),
        )
        .await
        .expect_err("limit hit");
        assert!(matches!(err, TicketdError::Conflict("ticket_limit_reached")));

        // The bypass flag ignores the limit.
        let privileged = member(OPENER, &[Permission::BypassTicketLimit]);
        actor::provide(
            privileged,
            fx.lifecycle.create_ticket(GuildId::new(GUILD), None),
        )
        .await
        .expect("bypass");
    }

    #[tokio::test]
    async fn claim_requires_permission_and_is_exclusive() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;
        let guild = GuildId::new(GUILD);

        // No claim permission.
        let err = actor::provide(opener(), fx.lifecycle.claim(guild, ticket.id, false))
            .await
            .expect_err("denied");
        assert!(matches!(err, TicketdError::PermissionDenied { .. }));

        let claimed = actor::provide(staff(), fx.lifecycle.claim(guild, ticket.id, false))
            .await
            .expect("claim");
        assert_eq!(claimed.status, TicketStatus::Claimed);
        assert_eq!(claimed.claimer_id, Some(UserId::new(STAFF)));

        // Second claim loses.
        let err = actor::provide(senior(), fx.lifecycle.claim(guild, ticket.id, false))
            .await
            .expect_err("already claimed");
        assert!(matches!(err, TicketdError::Conflict("already_claimed")));

        // Force takeover needs no extra capability beyond claim_tickets.
        let colleague = member(COLLEAGUE, &[Permission::ClaimTickets]);
        let stolen = actor::provide(colleague, fx.lifecycle.claim(guild, ticket.id, true))
            .await
            .expect("force claim");
        assert_eq!(stolen.claimer_id, Some(UserId::new(COLLEAGUE)));
    }

    #[tokio::test]
    async fn unclaim_is_for_the_claimer_or_staff() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;
        let guild = GuildId::new(GUILD);

        actor::provide(staff(), fx.lifecycle.claim(guild, ticket.id, false))
            .await
            .expect("claim");

        // The opener is neither the claimer nor staff.
        let err = actor::provide(opener(), fx.lifecycle.unclaim(guild, ticket.id))
            .await
            .expect_err("denied");
        assert!(matches!(err, TicketdError::PermissionDenied { .. }));

        let released = actor::provide(staff(), fx.lifecycle.unclaim(guild, ticket.id))
            .await
            .expect("own unclaim");
        assert_eq!(released.status, TicketStatus::Open);
        assert_eq!(released.claimer_id, None);

        let err = actor::provide(staff(), fx.lifecycle.unclaim(guild, ticket.id))
            .await
            .expect_err("not claimed");
        assert!(matches!(err, TicketdError::Conflict("not_claimed")));
    }

    #[tokio::test]
    async fn close_and_reopen_round_trip() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;
        let guild = GuildId::new(GUILD);

        actor::provide(staff(), fx.lifecycle.claim(guild, ticket.id, false))
            .await
            .expect("claim");

        // Opener closes their own ticket, even while claimed.
        let closed = actor::provide(opener(), fx.lifecycle.close(guild, ticket.id, Some("solved")))
            .await
            .expect("close");
        assert_eq!(closed.status, TicketStatus::Closed);
        assert_eq!(closed.claimer_id, None);
        assert!(closed.closed_at.is_some());

        let err = actor::provide(senior(), fx.lifecycle.close(guild, ticket.id, None))
            .await
            .expect_err("double close");
        assert!(matches!(err, TicketdError::Conflict("already_closed")));

        let reopened = actor::provide(opener(), fx.lifecycle.reopen(guild, ticket.id))
            .await
            .expect("reopen");
        assert_eq!(reopened.status, TicketStatus::Open);
        // The earlier claim did not survive the close.
        assert_eq!(reopened.claimer_id, None);
    }

    #[tokio::test]
    async fn close_by_stranger_requires_close_any() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;
        let guild = GuildId::new(GUILD);

        let err = actor::provide(staff(), fx.lifecycle.close(guild, ticket.id, None))
            .await
            .expect_err("denied");
        assert!(matches!(err, TicketdError::PermissionDenied { .. }));

        actor::provide(senior(), fx.lifecycle.close(guild, ticket.id, None))
            .await
            .expect("senior close");
    }

    #[tokio::test]
    async fn close_request_arms_a_timer_and_cancel_disarms_it() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;
        let guild = GuildId::new(GUILD);

        let pending = actor::provide(
            staff(),
            fx.lifecycle
                .request_close(guild, ticket.id, Some("resolved?"), Some(Duration::from_secs(60))),
        )
        .await
        .expect("request");
        let request = pending.close_request.expect("pending request");
        assert_eq!(request.requested_by, UserId::new(STAFF));
        assert!(request.deadline.is_some());
        assert_eq!(fx.scheduler.pending_jobs(), 1);

        // Only one pending request at a time.
        let err = actor::provide(
            staff(),
            fx.lifecycle.request_close(guild, ticket.id, None, None),
        )
        .await
        .expect_err("second request");
        assert!(matches!(err, TicketdError::Conflict("close_request_pending")));

        // Only the opener may withdraw it; not the requester, not senior staff.
        let err = actor::provide(staff(), fx.lifecycle.cancel_close_request(guild, ticket.id))
            .await
            .expect_err("requester cannot withdraw");
        assert!(matches!(err, TicketdError::PermissionDenied { .. }));
        let err = actor::provide(senior(), fx.lifecycle.cancel_close_request(guild, ticket.id))
            .await
            .expect_err("staff cannot withdraw");
        assert!(matches!(err, TicketdError::PermissionDenied { .. }));

        let cleared = actor::provide(opener(), fx.lifecycle.cancel_close_request(guild, ticket.id))
            .await
            .expect("cancel");
        assert!(cleared.close_request.is_none());
        assert_eq!(fx.scheduler.pending_jobs(), 0);

        let err = actor::provide(opener(), fx.lifecycle.cancel_close_request(guild, ticket.id))
            .await
            .expect_err("nothing pending");
        assert!(matches!(err, TicketdError::Conflict("no_close_request")));
    }

    #[tokio::test]
    async fn autoclose_fires_and_closes_the_ticket() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;
        let guild = GuildId::new(GUILD);

        actor::provide(
            staff(),
            fx.lifecycle
                .request_close(guild, ticket.id, None, Some(Duration::from_millis(20))),
        )
        .await
        .expect("request");

        tokio::time::sleep(Duration::from_millis(300)).await;

        let closed = actor::provide(opener(), fx.lifecycle.get_ticket(guild, ticket.id))
            .await
            .expect("read");
        assert_eq!(closed.status, TicketStatus::Closed);

        let events = actor::provide(opener(), fx.lifecycle.ticket_events(guild, ticket.id))
            .await
            .expect("events");
        let last = events.last().expect("events");
        assert_eq!(last.action, "auto_closed");
        assert_eq!(last.actor_kind, "system");
    }

    #[tokio::test]
    async fn exclusion_suppresses_autoclose() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;
        let guild = GuildId::new(GUILD);

        actor::provide(
            staff(),
            fx.lifecycle
                .request_close(guild, ticket.id, None, Some(Duration::from_millis(100))),
        )
        .await
        .expect("request");
        actor::provide(
            senior(),
            fx.lifecycle.set_autoclose_excluded(guild, ticket.id, true),
        )
        .await
        .expect("exclude");

        tokio::time::sleep(Duration::from_millis(400)).await;

        let ticket = actor::provide(opener(), fx.lifecycle.get_ticket(guild, ticket.id))
            .await
            .expect("read");
        assert_eq!(ticket.status, TicketStatus::Open, "exclusion must hold");
    }

    #[tokio::test]
    async fn stale_autoclose_job_is_a_no_op() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;
        let guild = GuildId::new(GUILD);

        actor::provide(
            staff(),
            fx.lifecycle
                .request_close(guild, ticket.id, None, Some(Duration::from_secs(3600))),
        )
        .await
        .expect("request");

        // A job id that is not the armed one must not close anything.
        fx.lifecycle
            .auto_close(ticket.id, guild, "stale-job")
            .await
            .expect("no-op");
        let ticket = actor::provide(opener(), fx.lifecycle.get_ticket(guild, ticket.id))
            .await
            .expect("read");
        assert_eq!(ticket.status, TicketStatus::Open);
    }

    #[tokio::test]
    async fn rearm_rebuilds_timers_lost_with_the_process() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;
        let guild = GuildId::new(GUILD);

        actor::provide(
            staff(),
            fx.lifecycle
                .request_close(guild, ticket.id, None, Some(Duration::from_millis(50))),
        )
        .await
        .expect("request");

        // Timers live only in process memory; drop them as a restart would.
        fx.scheduler.cancel_for_ticket(ticket.id);
        assert_eq!(fx.scheduler.pending_jobs(), 0);

        let rearmed = fx
            .lifecycle
            .rearm_autoclose_timers()
            .await
            .expect("rearm");
        assert_eq!(rearmed, 1);

        // The rebuilt timer still honors the persisted deadline.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let closed = actor::provide(opener(), fx.lifecycle.get_ticket(guild, ticket.id))
            .await
            .expect("read");
        assert_eq!(closed.status, TicketStatus::Closed);
    }

    #[tokio::test]
    async fn closing_disarms_the_pending_timer() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;
        let guild = GuildId::new(GUILD);

        actor::provide(
            staff(),
            fx.lifecycle
                .request_close(guild, ticket.id, None, Some(Duration::from_secs(3600))),
        )
        .await
        .expect("request");
        assert_eq!(fx.scheduler.pending_jobs(), 1);

        actor::provide(opener(), fx.lifecycle.close(guild, ticket.id, None))
            .await
            .expect("close");
        assert_eq!(fx.scheduler.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn tenant_isolation_reads_as_not_found() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;

        let foreign = Actor::Member {
            user_id: UserId::new(SENIOR),
            guild_id: GuildId::new(OTHER_GUILD),
            permissions: PermissionSet::universe(),
        };
        let err = actor::provide(
            foreign,
            fx.lifecycle.get_ticket(GuildId::new(OTHER_GUILD), ticket.id),
        )
        .await
        .expect_err("foreign ticket");
        // Full permissions elsewhere never reveal the ticket's existence.
        assert!(matches!(err, TicketdError::NotFound));
    }

    #[tokio::test]
    async fn soft_delete_hides_ticket_from_reads() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;
        let guild = GuildId::new(GUILD);

        let err = actor::provide(staff(), fx.lifecycle.soft_delete(guild, ticket.id))
            .await
            .expect_err("denied");
        assert!(matches!(err, TicketdError::PermissionDenied { .. }));

        actor::provide(senior(), fx.lifecycle.soft_delete(guild, ticket.id))
            .await
            .expect("delete");

        let err = actor::provide(opener(), fx.lifecycle.get_ticket(guild, ticket.id))
            .await
            .expect_err("gone");
        assert!(matches!(err, TicketdError::NotFound));
    }

    #[tokio::test]
    async fn blacklisted_user_cannot_open_tickets() {
        let fx = fixture().await;
        let guild = GuildId::new(GUILD);

        let moderator = member(SENIOR, &[Permission::ManageBlacklist]);
        actor::provide(moderator, async {
            fx.lifecycle
                .roles
                .blacklist_add(guild, UserId::new(OPENER))
                .await
        })
        .await
        .expect("blacklist");

        let err = actor::provide(opener(), fx.lifecycle.create_ticket(guild, None))
            .await
            .expect_err("blacklisted");
        assert!(matches!(err, TicketdError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn open_ticket_listing_is_permission_gated() {
        let fx = fixture().await;
        let guild = GuildId::new(GUILD);
        open_ticket(&fx).await;
        open_ticket(&fx).await;

        // Own list is always visible.
        let own = actor::provide(
            opener(),
            fx.lifecycle.open_tickets_for_user(guild, UserId::new(OPENER)),
        )
        .await
        .expect("own list");
        assert_eq!(own.len(), 2);
        assert!(own[0].number < own[1].number);

        // Someone else's list needs view_tickets.
        let nosy = member(STAFF, &[]);
        let err = actor::provide(
            nosy,
            fx.lifecycle.open_tickets_for_user(guild, UserId::new(OPENER)),
        )
        .await
        .expect_err("denied");
        assert!(matches!(err, TicketdError::PermissionDenied { .. }));

        actor::provide(
            staff(),
            fx.lifecycle.open_tickets_for_user(guild, UserId::new(OPENER)),
        )
        .await
        .expect("staff list");
    }

    #[tokio::test]
    async fn record_message_grows_transcript_and_participants() {
        let fx = fixture().await;
        let ticket = open_ticket(&fx).await;
        let guild = GuildId::new(GUILD);

        actor::provide(
            staff(),
            fx.lifecycle.record_message(guild, ticket.id, "on it"),
        )
        .await
        .expect("staff message");

        let transcript = actor::provide(opener(), fx.lifecycle.transcript(guild, ticket.id))
            .await
            .expect("transcript");
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0]["content"], "on it");

        // A closed ticket refuses new messages.
        actor::provide(opener(), fx.lifecycle.close(guild, ticket.id, None))
            .await
            .expect("close");
        let err = actor::provide(
            staff(),
            fx.lifecycle.record_message(guild, ticket.id, "too late"),
        )
        .await
        .expect_err("closed");
        assert!(matches!(err, TicketdError::Conflict("ticket_closed")));
    }
}
