//! Error taxonomy for lifecycle operations.
//!
//! Every failure carries a stable [`ErrorKind`] so callers can decide whether
//! to retry, correct their input, or reconcile a partially applied change.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Stable classification of a [`LifecycleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input. Never retried automatically.
    Validation,
    /// Entity absent.
    NotFound,
    /// One-group-per-user, terminal re-mutation, period ordering.
    InvariantViolation,
    /// Optimistic check-and-set lost a race. Safe to retry.
    ConcurrentModification,
    /// A multi-step mutation was only partly applied.
    PartialFailure,
    /// Document store or copy engine unreachable. Retry with backoff.
    CollaboratorUnavailable,
    /// Caller lacks the capability for this operation.
    Unauthorized,
    /// Corrupt stored data or an unexpected store response.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvariantViolation => "invariant_violation",
            ErrorKind::ConcurrentModification => "concurrent_modification",
            ErrorKind::PartialFailure => "partial_failure",
            ErrorKind::CollaboratorUnavailable => "collaborator_unavailable",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("No group matches referral code or API key '{0}'")]
    GroupNotFound(String),

    #[error("User {0} must have an approved IB change before joining a group")]
    IbNotApproved(String),

    #[error("User {user_id} already holds open membership {member_id}")]
    AlreadyInGroup { user_id: String, member_id: String },

    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Settlement {0} is already finalized")]
    AlreadyFinalized(String),

    #[error("Invalid period: end {end} is before start {start}")]
    InvalidPeriod {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Group {group_id} still has {open_members} open memberships")]
    GroupHasMembers { group_id: String, open_members: i64 },

    #[error("Group {group_id} stays paused until settlement {settlement_id} is decided")]
    AwaitingSettlement {
        group_id: String,
        settlement_id: String,
    },

    #[error("Insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    #[error("Concurrent modification of {entity} {id}")]
    ConcurrentModification { entity: &'static str, id: String },

    #[error("Partial failure: '{completed}' succeeded but '{failed}' failed: {reason}")]
    PartialFailure {
        completed: String,
        failed: String,
        reason: String,
    },

    #[error("{collaborator} unavailable: {message}")]
    CollaboratorUnavailable {
        collaborator: &'static str,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::Validation(_) => ErrorKind::Validation,
            LifecycleError::NotFound { .. } | LifecycleError::GroupNotFound(_) => {
                ErrorKind::NotFound
            }
            LifecycleError::IbNotApproved(_)
            | LifecycleError::AlreadyInGroup { .. }
            | LifecycleError::InvalidTransition { .. }
            | LifecycleError::AlreadyFinalized(_)
            | LifecycleError::InvalidPeriod { .. }
            | LifecycleError::GroupHasMembers { .. }
            | LifecycleError::AwaitingSettlement { .. } => ErrorKind::InvariantViolation,
            LifecycleError::InsufficientPrivilege(_) => ErrorKind::Unauthorized,
            LifecycleError::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            LifecycleError::PartialFailure { .. } => ErrorKind::PartialFailure,
            LifecycleError::CollaboratorUnavailable { .. } => ErrorKind::CollaboratorUnavailable,
            LifecycleError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may blindly retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConcurrentModification | ErrorKind::CollaboratorUnavailable
        )
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        LifecycleError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn conflict(entity: &'static str, id: impl Into<String>) -> Self {
        LifecycleError::ConcurrentModification {
            entity,
            id: id.into(),
        }
    }
}

impl From<sqlx::Error> for LifecycleError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                LifecycleError::CollaboratorUnavailable {
                    collaborator: "document store",
                    message: err.to_string(),
                }
            }
            // SQLITE_BUSY / SQLITE_LOCKED: another writer holds the database.
            sqlx::Error::Database(db)
                if matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517")) =>
            {
                LifecycleError::CollaboratorUnavailable {
                    collaborator: "document store",
                    message: err.to_string(),
                }
            }
            _ => LifecycleError::Internal(err.to_string()),
        }
    }
}
