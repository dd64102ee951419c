//! Error types for ticketq.
//!
//! Every error classifies into an [`ErrorKind`] whose ordinal is stable
//! across every outer protocol (process exit code, response status).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Status, TicketId};
use crate::state_machine::Event;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgs(String),

    #[error("dependency {dependent} -> {prerequisite} would create a cycle")]
    Cycle {
        dependent: TicketId,
        prerequisite: TicketId,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot {event} ticket {id} while it is {from}")]
    InvalidTransition {
        id: TicketId,
        from: Status,
        event: Event,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("ticket {ticket} is claimed by {holder}, not {requester}")]
    NotHolder {
        ticket: TicketId,
        holder: String,
        requester: String,
    },

    #[error("claim on {ticket} expired at {expired_at}")]
    LeaseExpired {
        ticket: TicketId,
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure classification shared by every caller-facing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    General,
    InvalidArgs,
    NotFound,
    StateError,
    ConcurrentConflict,
    Internal,
}

impl ErrorKind {
    /// Stable ordinal. Never renumber.
    pub fn code(self) -> u8 {
        match self {
            ErrorKind::General => 1,
            ErrorKind::InvalidArgs => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::StateError => 4,
            ErrorKind::ConcurrentConflict => 5,
            ErrorKind::Internal => 6,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::General => "general",
            ErrorKind::InvalidArgs => "invalid_args",
            ErrorKind::NotFound => "not_found",
            ErrorKind::StateError => "state_error",
            ErrorKind::ConcurrentConflict => "concurrent_conflict",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgs(_) | Error::Cycle { .. } => ErrorKind::InvalidArgs,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidTransition { .. } => ErrorKind::StateError,
            Error::Conflict(_) | Error::NotHolder { .. } | Error::LeaseExpired { .. } => {
                ErrorKind::ConcurrentConflict
            }
            Error::Storage(e) if is_busy(e) => ErrorKind::ConcurrentConflict,
            Error::Storage(_) | Error::Internal(_) => ErrorKind::Internal,
            Error::Config(_) | Error::Other(_) => ErrorKind::General,
        }
    }

    /// Optional remediation suggestion shown next to the message.
    pub fn hint(&self) -> Option<String> {
        match self {
            Error::Cycle { prerequisite, .. } => Some(format!(
                "inspect the prerequisites of {prerequisite} before adding this edge"
            )),
            Error::InvalidTransition {
                from: Status::Blocked,
                ..
            } => Some("resolve or remove its prerequisites first".to_string()),
            Error::InvalidTransition { from, .. } if from.is_terminal() => {
                Some("reopen the ticket first".to_string())
            }
            Error::Conflict(_) => Some("another worker won the race; pick another ticket".into()),
            Error::NotHolder { .. } => {
                Some("only the claim holder or an operator may do this".to_string())
            }
            Error::LeaseExpired { .. } => {
                Some("the lease lapsed; claim the ticket again once it is requeued".into())
            }
            Error::Storage(e) if is_busy(e) => Some("the store is busy; retry shortly".into()),
            Error::Config(_) => Some("check ticketq.toml and TICKETQ_* variables".to_string()),
            _ => None,
        }
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_stable() {
        assert_eq!(ErrorKind::General.code(), 1);
        assert_eq!(ErrorKind::InvalidArgs.code(), 2);
        assert_eq!(ErrorKind::NotFound.code(), 3);
        assert_eq!(ErrorKind::StateError.code(), 4);
        assert_eq!(ErrorKind::ConcurrentConflict.code(), 5);
        assert_eq!(ErrorKind::Internal.code(), 6);
    }

    #[test]
    fn cycle_is_an_invalid_argument_with_hint() {
        let err = Error::Cycle {
            dependent: TicketId::new("TEST", 1),
            prerequisite: TicketId::new("TEST", 2),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidArgs);
        assert!(err.hint().unwrap().contains("TEST-2"));
    }

    #[test]
    fn transition_error_names_event_and_status() {
        let err = Error::InvalidTransition {
            id: TicketId::new("TEST", 7),
            from: Status::Done,
            event: Event::Claim,
        };
        assert_eq!(err.kind(), ErrorKind::StateError);
        assert_eq!(err.to_string(), "cannot claim ticket TEST-7 while it is done");
        assert_eq!(err.hint().as_deref(), Some("reopen the ticket first"));
    }
}
