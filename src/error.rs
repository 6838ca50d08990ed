//! Error types for the ticketd backend.
//!
//! All errors are explicitly typed using thiserror. No panics in production code.
//! The boundary layer maps this taxonomy onto HTTP status codes via
//! [`TicketdError::http_status`].

use thiserror::Error;

/// Central error type for all ticketd operations.
#[derive(Debug, Error)]
pub enum TicketdError {
    /// Entity missing, soft-deleted, or owned by another guild.
    ///
    /// Cross-tenant lookups deliberately collapse into this variant so a
    /// foreign guild cannot distinguish "exists elsewhere" from "never existed".
    #[error("not found")]
    NotFound,

    /// Actor lacks a required permission bit.
    #[error("permission denied: {actor_kind} actor missing {permission}")]
    PermissionDenied {
        /// Name of the missing capability.
        permission: String,
        /// Actor variant that attempted the operation.
        actor_kind: &'static str,
    },

    /// Malformed or unresolvable input, caught before any mutation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Guard failed because of concurrent or duplicate state.
    #[error("conflict: {0}")]
    Conflict(&'static str),

    /// Store failure, lock wait expiry, or overall transaction timeout.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Operation invoked with no ambient Actor or transaction established.
    /// A programming error in the boundary layer, not a user condition.
    #[error("no ambient context: {0}")]
    ContextNotFound(&'static str),

    /// Configuration error (missing env vars, invalid values).
    #[error("configuration error: {0}")]
    Config(String),
}

impl TicketdError {
    /// HTTP status code the boundary layer renders for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::PermissionDenied { .. } => 403,
            Self::Conflict(_) => 409,
            Self::Validation(_) => 400,
            Self::Transaction(_) | Self::ContextNotFound(_) | Self::Config(_) => 500,
        }
    }

    /// Whether this error indicates an internal fault that must be logged
    /// server-side rather than shown to the caller.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Transaction(_) | Self::ContextNotFound(_) | Self::Config(_)
        )
    }

    /// User-facing message (hides internal details in production).
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NotFound => "Ticket or resource not found",
            Self::PermissionDenied { .. } => "You do not have permission to do that",
            Self::Validation(_) => "Invalid request",
            Self::Conflict(reason) => reason,
            Self::Transaction(_) => "Storage temporarily unavailable",
            Self::ContextNotFound(_) => "Internal service error",
            Self::Config(_) => "Service configuration error",
        }
    }

    /// Log this error with structured fields for the given operation.
    pub fn log(&self, operation: &str) {
        if self.is_internal() {
            tracing::error!(error = %self, operation = operation, "internal error");
        } else {
            tracing::debug!(error = %self, operation = operation, "request rejected");
        }
    }
}

/// Result type alias for ticketd operations.
pub type Result<T> = std::result::Result<T, TicketdError>;

impl From<sqlx::Error> for TicketdError {
    fn from(err: sqlx::Error) -> Self {
        TicketdError::Transaction(err.to_string())
    }
}
