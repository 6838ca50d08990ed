//! Ambient request-scoped actor context.
//!
//! Every inbound operation runs inside [`provide`], which binds the acting
//! identity to a tokio task-local for exactly the duration of that call tree.
//! The value survives `.await` suspension points within the scoped future, and
//! concurrently in-flight operations never observe each other's actor. Actors
//! are never persisted.

use serenity::model::id::{GuildId, UserId};

use crate::error::{Result, TicketdError};
use crate::permissions::{Permission, PermissionSet};

tokio::task_local! {
    static CURRENT_ACTOR: Actor;
}

/// The authenticated identity executing one operation.
#[derive(Debug, Clone)]
pub enum Actor {
    /// Human acting through their platform (Discord) identity.
    Member {
        user_id: UserId,
        guild_id: GuildId,
        permissions: PermissionSet,
    },
    /// Human acting through a web dashboard session.
    WebUser {
        user_id: UserId,
        guild_id: GuildId,
        session_id: String,
        permissions: PermissionSet,
    },
    /// Internal process (scheduler, cleanup). Holds the full permission
    /// universe and has no user identity.
    System {
        process: &'static str,
        guild_id: GuildId,
    },
}

impl Actor {
    /// Actor variant name for diagnostics and audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Member { .. } => "member",
            Self::WebUser { .. } => "web",
            Self::System { .. } => "system",
        }
    }

    /// The acting user, if this actor has one. System actors do not.
    pub fn user_id(&self) -> Result<UserId> {
        match self {
            Self::Member { user_id, .. } | Self::WebUser { user_id, .. } => Ok(*user_id),
            Self::System { process, .. } => Err(TicketdError::Validation(format!(
                "system actor '{}' has no user id",
                process
            ))),
        }
    }

    /// The tenant this actor is resolved to. Always present.
    pub fn guild_id(&self) -> GuildId {
        match self {
            Self::Member { guild_id, .. }
            | Self::WebUser { guild_id, .. }
            | Self::System { guild_id, .. } => *guild_id,
        }
    }

    /// Effective permission set. System actors hold the universe.
    pub fn permissions(&self) -> PermissionSet {
        match self {
            Self::Member { permissions, .. } | Self::WebUser { permissions, .. } => *permissions,
            Self::System { .. } => PermissionSet::universe(),
        }
    }

    pub fn has_permission(&self, flag: Permission) -> bool {
        self.permissions().contains(flag)
    }

    /// Fail with `PermissionDenied` naming the missing capability and actor kind.
    pub fn require_permission(&self, flag: Permission) -> Result<()> {
        if self.has_permission(flag) {
            Ok(())
        } else {
            Err(TicketdError::PermissionDenied {
                permission: flag.as_str().to_string(),
                actor_kind: self.kind(),
            })
        }
    }
}

/// Run `fut` with `actor` as the ambient identity for its whole call graph.
pub async fn provide<F>(actor: Actor, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_ACTOR.scope(actor, fut).await
}

/// Synchronous variant of [`provide`] for non-async call trees.
pub fn provide_sync<F, T>(actor: Actor, f: F) -> T
where
    F: FnOnce() -> T,
{
    CURRENT_ACTOR.sync_scope(actor, f)
}

/// The ambient actor, or `ContextNotFound` when called outside [`provide`].
pub fn current() -> Result<Actor> {
    CURRENT_ACTOR
        .try_with(Actor::clone)
        .map_err(|_| TicketdError::ContextNotFound("actor"))
}

/// The ambient actor, if one is established.
pub fn maybe_current() -> Option<Actor> {
    CURRENT_ACTOR.try_with(Actor::clone).ok()
}
