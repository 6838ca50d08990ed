//! Support roles, additional grants, blacklist and guild settings.
//!
//! Also home of the effective-permission resolver. Resolution re-reads role
//! state on every call; there is deliberately no cache between checks.

use std::sync::Arc;

use chrono::Utc;
use serenity::model::id::{GuildId, UserId};
use sqlx::Row;

use crate::actor;
use crate::audit::AuditLog;
use crate::database::Database;
use crate::error::{Result, TicketdError};
use crate::permissions::{Permission, PermissionSet};
use crate::transaction::{after_transaction, use_transaction};

/// A tenant-scoped support role.
#[derive(Debug, Clone)]
pub struct SupportRole {
    pub id: i64,
    pub guild_id: GuildId,
    pub name: String,
    pub permissions: PermissionSet,
    pub position: i64,
    /// Default roles apply to every member of the guild without an explicit
    /// assignment row.
    pub is_default: bool,
    pub active: bool,
}

/// Per-guild ticket settings.
#[derive(Debug, Clone)]
pub struct GuildSettings {
    pub guild_id: GuildId,
    pub owner_id: UserId,
    /// Per-user open-ticket limit; 0 means unlimited.
    pub max_open_tickets: u32,
    /// Default auto-close delay for close requests, if configured.
    pub autoclose_hours: Option<u32>,
}

/// Store and resolver for everything permission-related.
pub struct RoleService {
    db: Arc<Database>,
    audit: Arc<AuditLog>,
    #[cfg(feature = "dev-permission-override")]
    override_set: Option<PermissionSet>,
}

impl RoleService {
    pub fn new(db: Arc<Database>, audit: Arc<AuditLog>) -> Self {
        Self {
            db,
            audit,
            #[cfg(feature = "dev-permission-override")]
            override_set: None,
        }
    }

    /// Install the development-only permission override. Compiled out of
    /// release builds entirely.
    #[cfg(feature = "dev-permission-override")]
    pub fn with_override(mut self, set: Option<PermissionSet>) -> Self {
        self.override_set = set;
        self
    }

    // ========== Effective permission resolution ==========

    /// Effective permissions of `user` in `guild`, with strict precedence:
    /// override (dev builds only), guild owner, OR of active roles, OR of the
    /// additional grant.
    pub async fn effective_permissions(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> Result<PermissionSet> {
        #[cfg(feature = "dev-permission-override")]
        if let Some(set) = self.override_set {
            return Ok(set);
        }

        if let Some(settings) = self.guild_settings(guild_id).await? {
            if settings.owner_id == user_id {
                return Ok(PermissionSet::universe());
            }
        }

        let handle = use_transaction(&self.db);
        let rows = handle
            .fetch_all(
                sqlx::query(
                    "SELECT r.permissions FROM support_roles r
                     LEFT JOIN role_members m ON m.role_id = r.id AND m.user_id = ?
                     WHERE r.guild_id = ? AND r.active = 1
                       AND (r.is_default = 1 OR m.user_id IS NOT NULL)",
                )
                .bind(user_id.get() as i64)
                .bind(guild_id.get() as i64),
            )
            .await?;

        let from_roles = PermissionSet::cumulative(
            rows.iter()
                .map(|row| parse_mask(row.get("permissions")))
                .collect::<Result<Vec<_>>>()?,
        );

        let grant = self.additional_grant(guild_id, user_id).await?;
        Ok(from_roles.union(grant.unwrap_or_else(PermissionSet::empty)))
    }

    // ========== Guild settings ==========

    pub async fn guild_settings(&self, guild_id: GuildId) -> Result<Option<GuildSettings>> {
        let row = use_transaction(&self.db)
            .fetch_optional(
                sqlx::query(
                    "SELECT guild_id, owner_id, max_open_tickets, autoclose_hours
                     FROM guild_settings WHERE guild_id = ?",
                )
                .bind(guild_id.get() as i64),
            )
            .await?;

        Ok(row.map(|row| GuildSettings {
            guild_id: GuildId::new(row.get::<i64, _>("guild_id") as u64),
            owner_id: UserId::new(row.get::<i64, _>("owner_id") as u64),
            max_open_tickets: row.get::<i64, _>("max_open_tickets") as u32,
            autoclose_hours: row
                .get::<Option<i64>, _>("autoclose_hours")
                .map(|h| h as u32),
        }))
    }

    /// Create or update guild settings. Requires `manage_guild_settings` once
    /// a settings row exists. First-time setup is restricted to the process
    /// itself or to the user being named owner; anyone else could otherwise
    /// bootstrap a guild with themselves as owner and inherit the owner's full
    /// permission set.
    pub async fn upsert_guild_settings(&self, settings: &GuildSettings) -> Result<()> {
        let acting = actor::current()?;
        if self.guild_settings(settings.guild_id).await?.is_some() {
            acting.require_permission(Permission::ManageGuildSettings)?;
        } else {
            let is_owner = acting.user_id().ok() == Some(settings.owner_id);
            if !matches!(acting, actor::Actor::System { .. }) && !is_owner {
                return Err(TicketdError::PermissionDenied {
                    permission: Permission::ManageGuildSettings.as_str().to_string(),
                    actor_kind: acting.kind(),
                });
            }
        }

        use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "INSERT INTO guild_settings (guild_id, owner_id, max_open_tickets, autoclose_hours, updated_at)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT(guild_id) DO UPDATE SET
                        owner_id = excluded.owner_id,
                        max_open_tickets = excluded.max_open_tickets,
                        autoclose_hours = excluded.autoclose_hours,
                        updated_at = excluded.updated_at",
                )
                .bind(settings.guild_id.get() as i64)
                .bind(settings.owner_id.get() as i64)
                .bind(settings.max_open_tickets as i64)
                .bind(settings.autoclose_hours.map(|h| h as i64))
                .bind(Utc::now().to_rfc3339()),
            )
            .await?;

        self.audit_after_commit(settings.guild_id, "guild_settings_updated", None)
            .await;
        Ok(())
    }

    // ========== Roles ==========

    /// Create a role. Requires `manage_roles`.
    pub async fn create_role(
        &self,
        guild_id: GuildId,
        name: &str,
        permissions: PermissionSet,
        position: i64,
        is_default: bool,
    ) -> Result<SupportRole> {
        actor::current()?.require_permission(Permission::ManageRoles)?;
        if name.trim().is_empty() {
            return Err(TicketdError::Validation("role name is empty".to_string()));
        }

        let result = use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "INSERT INTO support_roles (guild_id, name, permissions, position, is_default, created_at)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(guild_id.get() as i64)
                .bind(name)
                .bind(permissions.to_hex())
                .bind(position)
                .bind(is_default as i64)
                .bind(Utc::now().to_rfc3339()),
            )
            .await?;

        self.audit_after_commit(guild_id, "role_created", Some(name.to_string()))
            .await;

        Ok(SupportRole {
            id: result.last_insert_rowid(),
            guild_id,
            name: name.to_string(),
            permissions,
            position,
            is_default,
            active: true,
        })
    }

    /// Replace a role's permission mask. Requires `manage_roles`.
    pub async fn update_role_permissions(
        &self,
        guild_id: GuildId,
        role_id: i64,
        permissions: PermissionSet,
    ) -> Result<()> {
        actor::current()?.require_permission(Permission::ManageRoles)?;

        let result = use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "UPDATE support_roles SET permissions = ? WHERE id = ? AND guild_id = ?",
                )
                .bind(permissions.to_hex())
                .bind(role_id)
                .bind(guild_id.get() as i64),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(TicketdError::NotFound);
        }

        self.audit_after_commit(guild_id, "role_permissions_updated", Some(role_id.to_string()))
            .await;
        Ok(())
    }

    /// Activate or deactivate a role. Inactive roles are ignored by the
    /// resolver but keep their membership rows. Requires `manage_roles`.
    pub async fn set_role_active(
        &self,
        guild_id: GuildId,
        role_id: i64,
        active: bool,
    ) -> Result<()> {
        actor::current()?.require_permission(Permission::ManageRoles)?;

        let result = use_transaction(&self.db)
            .execute(
                sqlx::query("UPDATE support_roles SET active = ? WHERE id = ? AND guild_id = ?")
                    .bind(active as i64)
                    .bind(role_id)
                    .bind(guild_id.get() as i64),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(TicketdError::NotFound);
        }
        Ok(())
    }

    pub async fn guild_roles(&self, guild_id: GuildId) -> Result<Vec<SupportRole>> {
        let rows = use_transaction(&self.db)
            .fetch_all(
                sqlx::query(
                    "SELECT id, guild_id, name, permissions, position, is_default, active
                     FROM support_roles WHERE guild_id = ?
                     ORDER BY position DESC, id",
                )
                .bind(guild_id.get() as i64),
            )
            .await?;

        rows.iter()
            .map(|row| {
                Ok(SupportRole {
                    id: row.get("id"),
                    guild_id: GuildId::new(row.get::<i64, _>("guild_id") as u64),
                    name: row.get("name"),
                    permissions: parse_mask(row.get("permissions"))?,
                    position: row.get("position"),
                    is_default: row.get::<i64, _>("is_default") != 0,
                    active: row.get::<i64, _>("active") != 0,
                })
            })
            .collect()
    }

    /// Assign a role to a user. Requires `manage_roles`.
    pub async fn assign_member(
        &self,
        guild_id: GuildId,
        role_id: i64,
        user_id: UserId,
    ) -> Result<()> {
        let acting = actor::current()?;
        acting.require_permission(Permission::ManageRoles)?;

        let handle = use_transaction(&self.db);
        let exists = handle
            .fetch_optional(
                sqlx::query("SELECT id FROM support_roles WHERE id = ? AND guild_id = ?")
                    .bind(role_id)
                    .bind(guild_id.get() as i64),
            )
            .await?;
        if exists.is_none() {
            return Err(TicketdError::NotFound);
        }

        handle
            .execute(
                sqlx::query(
                    "INSERT INTO role_members (role_id, guild_id, user_id, assigned_by, assigned_at)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT(role_id, user_id) DO UPDATE SET
                        assigned_by = excluded.assigned_by,
                        assigned_at = excluded.assigned_at",
                )
                .bind(role_id)
                .bind(guild_id.get() as i64)
                .bind(user_id.get() as i64)
                .bind(acting.user_id().map(|u| u.get() as i64).unwrap_or(0))
                .bind(Utc::now().to_rfc3339()),
            )
            .await?;

        self.audit_after_commit(
            guild_id,
            "role_assigned",
            Some(format!("role {} -> user {}", role_id, user_id)),
        )
        .await;
        Ok(())
    }

    /// Remove a role from a user. Requires `manage_roles`.
    pub async fn remove_member(
        &self,
        guild_id: GuildId,
        role_id: i64,
        user_id: UserId,
    ) -> Result<()> {
        actor::current()?.require_permission(Permission::ManageRoles)?;

        use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "DELETE FROM role_members WHERE role_id = ? AND guild_id = ? AND user_id = ?",
                )
                .bind(role_id)
                .bind(guild_id.get() as i64)
                .bind(user_id.get() as i64),
            )
            .await?;
        Ok(())
    }

    // ========== Additional grants ==========

    pub async fn additional_grant(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> Result<Option<PermissionSet>> {
        let row = use_transaction(&self.db)
            .fetch_optional(
                sqlx::query(
                    "SELECT permissions FROM additional_grants WHERE guild_id = ? AND user_id = ?",
                )
                .bind(guild_id.get() as i64)
                .bind(user_id.get() as i64),
            )
            .await?;

        row.map(|row| parse_mask(row.get("permissions"))).transpose()
    }

    /// Layer extra permission bits over a user's role-derived set.
    /// Requires `manage_roles`.
    pub async fn set_additional_grant(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        permissions: PermissionSet,
    ) -> Result<()> {
        let acting = actor::current()?;
        acting.require_permission(Permission::ManageRoles)?;

        use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "INSERT INTO additional_grants (guild_id, user_id, permissions, granted_by, granted_at)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT(guild_id, user_id) DO UPDATE SET
                        permissions = excluded.permissions,
                        granted_by = excluded.granted_by,
                        granted_at = excluded.granted_at",
                )
                .bind(guild_id.get() as i64)
                .bind(user_id.get() as i64)
                .bind(permissions.to_hex())
                .bind(acting.user_id().map(|u| u.get() as i64).unwrap_or(0))
                .bind(Utc::now().to_rfc3339()),
            )
            .await?;

        self.audit_after_commit(guild_id, "grant_updated", Some(user_id.to_string()))
            .await;
        Ok(())
    }

    /// Remove a user's additional grant. Requires `manage_roles`.
    pub async fn clear_additional_grant(&self, guild_id: GuildId, user_id: UserId) -> Result<()> {
        actor::current()?.require_permission(Permission::ManageRoles)?;

        use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "DELETE FROM additional_grants WHERE guild_id = ? AND user_id = ?",
                )
                .bind(guild_id.get() as i64)
                .bind(user_id.get() as i64),
            )
            .await?;
        Ok(())
    }

    // ========== Blacklist ==========

    pub async fn is_blacklisted(&self, guild_id: GuildId, user_id: UserId) -> Result<bool> {
        let row = use_transaction(&self.db)
            .fetch_optional(
                sqlx::query("SELECT 1 FROM blacklist WHERE guild_id = ? AND user_id = ?")
                    .bind(guild_id.get() as i64)
                    .bind(user_id.get() as i64),
            )
            .await?;
        Ok(row.is_some())
    }

    /// Bar a user from opening tickets. Requires `manage_blacklist`;
    /// duplicates are a conflict.
    pub async fn blacklist_add(&self, guild_id: GuildId, user_id: UserId) -> Result<()> {
        let acting = actor::current()?;
        acting.require_permission(Permission::ManageBlacklist)?;

        let result = use_transaction(&self.db)
            .execute(
                sqlx::query(
                    "INSERT OR IGNORE INTO blacklist (guild_id, user_id, added_by, added_at)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(guild_id.get() as i64)
                .bind(user_id.get() as i64)
                .bind(acting.user_id().map(|u| u.get() as i64).unwrap_or(0))
                .bind(Utc::now().to_rfc3339()),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(TicketdError::Conflict("already_blacklisted"));
        }

        self.audit_after_commit(guild_id, "blacklist_added", Some(user_id.to_string()))
            .await;
        Ok(())
    }

    /// Remove a blacklist entry. Requires `manage_blacklist`.
    pub async fn blacklist_remove(&self, guild_id: GuildId, user_id: UserId) -> Result<()> {
        actor::current()?.require_permission(Permission::ManageBlacklist)?;

        let result = use_transaction(&self.db)
            .execute(
                sqlx::query("DELETE FROM blacklist WHERE guild_id = ? AND user_id = ?")
                    .bind(guild_id.get() as i64)
                    .bind(user_id.get() as i64),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(TicketdError::NotFound);
        }

        self.audit_after_commit(guild_id, "blacklist_removed", Some(user_id.to_string()))
            .await;
        Ok(())
    }

    async fn audit_after_commit(&self, guild_id: GuildId, action: &'static str, details: Option<String>) {
        let audit = self.audit.clone();
        let acting = actor::maybe_current();
        after_transaction(async move {
            audit.append(guild_id, acting.as_ref(), action, details.as_deref()).await
        })
        .await;
    }
}

fn parse_mask(raw: String) -> Result<PermissionSet> {
    PermissionSet::from_hex(&raw)
        .ok_or_else(|| TicketdError::Transaction(format!("invalid permission mask '{}'", raw)))
}
