//! Append-only activity log.
//!
//! Every state change appends one or more entries. Entries are an audit
//! trail for observers; no invariant reads them back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::TicketId;

/// A recorded activity entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Monotonic sequence number assigned by the store.
    pub seq: u64,
    pub ticket_id: TicketId,
    pub action: Action,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// An entry not yet written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewActivity {
    pub ticket_id: TicketId,
    pub action: Action,
    pub actor: Actor,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl NewActivity {
    pub fn new(ticket_id: TicketId, action: Action, actor: Actor, timestamp: DateTime<Utc>) -> Self {
        Self {
            ticket_id,
            action,
            actor,
            details: None,
            timestamp,
        }
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub(crate) fn into_entry(self, seq: u64) -> ActivityEntry {
        ActivityEntry {
            seq,
            ticket_id: self.ticket_id,
            action: self.action,
            actor: self.actor,
            details: self.details,
            timestamp: self.timestamp,
        }
    }
}

/// Stable action vocabulary rendered by audit consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Created,
    Validated,
    Blocked,
    Claimed,
    Renewed,
    Released,
    Expired,
    Escalated,
    Completed,
    Flagged,
    Responded,
    Accepted,
    Rejected,
    Cancelled,
    Reopened,
    Unblocked,
    DependencyAdded,
    DependencyRemoved,
    ChildrenCompleted,
}

impl Action {
    pub const ALL: [Action; 19] = [
        Action::Created,
        Action::Validated,
        Action::Blocked,
        Action::Claimed,
        Action::Renewed,
        Action::Released,
        Action::Expired,
        Action::Escalated,
        Action::Completed,
        Action::Flagged,
        Action::Responded,
        Action::Accepted,
        Action::Rejected,
        Action::Cancelled,
        Action::Reopened,
        Action::Unblocked,
        Action::DependencyAdded,
        Action::DependencyRemoved,
        Action::ChildrenCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Validated => "validated",
            Action::Blocked => "blocked",
            Action::Claimed => "claimed",
            Action::Renewed => "renewed",
            Action::Released => "released",
            Action::Expired => "expired",
            Action::Escalated => "escalated",
            Action::Completed => "completed",
            Action::Flagged => "flagged",
            Action::Responded => "responded",
            Action::Accepted => "accepted",
            Action::Rejected => "rejected",
            Action::Cancelled => "cancelled",
            Action::Reopened => "reopened",
            Action::Unblocked => "unblocked",
            Action::DependencyAdded => "dependency_added",
            Action::DependencyRemoved => "dependency_removed",
            Action::ChildrenCompleted => "children_completed",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| Error::Internal(format!("unknown activity action: {s}")))
    }
}

/// Who caused an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Actor {
    Human(String),
    Agent(String),
    System,
}

impl Actor {
    pub fn human(name: impl Into<String>) -> Self {
        Actor::Human(name.into())
    }

    pub fn agent(name: impl Into<String>) -> Self {
        Actor::Agent(name.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Actor::Human(_) => "human",
            Actor::Agent(_) => "agent",
            Actor::System => "system",
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Actor::Human(name) | Actor::Agent(name) => Some(name),
            Actor::System => None,
        }
    }

    /// Rebuild from the `(kind, name)` pair stores persist.
    pub fn from_parts(kind: &str, name: Option<String>) -> Result<Self> {
        match (kind, name) {
            ("human", Some(name)) => Ok(Actor::Human(name)),
            ("agent", Some(name)) => Ok(Actor::Agent(name)),
            ("system", _) => Ok(Actor::System),
            (kind, _) => Err(Error::Internal(format!("malformed actor: {kind}"))),
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::Human(name) => write!(f, "human:{name}"),
            Actor::Agent(name) => write!(f, "agent:{name}"),
            Actor::System => f.write_str("system"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_vocabulary_is_snake_case_and_parses_back() {
        for action in Action::ALL {
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
    }

    #[test]
    fn actor_round_trips_through_parts() {
        for actor in [Actor::human("ana"), Actor::agent("bot-7"), Actor::System] {
            let rebuilt = Actor::from_parts(actor.kind(), actor.name().map(str::to_string));
            assert_eq!(rebuilt.unwrap(), actor);
        }
        assert!(Actor::from_parts("human", None).is_err());
    }
}
