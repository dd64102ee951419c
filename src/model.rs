//! Core data model.
//!
//! A ticket is a unit of work. It has identity (project key + sequence
//! number), a lifecycle status, a priority, and retry accounting. Claims
//! are time-bounded leases on tickets; dependency edges order tickets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

/// A unit of work tracked by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub title: String,
    pub description: String,

    /// Current lifecycle status. Only changed through validated transitions.
    pub status: Status,
    pub priority: Priority,

    /// Expirations so far. Reset only by reopen.
    pub retry_count: u32,
    pub max_retries: u32,

    /// Back-pointer to the parent ticket. No ownership.
    pub parent: Option<TicketId>,

    /// Set iff the status is terminal.
    pub resolution: Option<Resolution>,

    /// Why the ticket needs a human. Set on flag, escalation, or failed prerequisite.
    pub human_flag_reason: Option<String>,

    /// Status held before entering `needs_human`.
    pub flagged_from: Option<Status>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Is this ticket closed with the `completed` resolution?
    pub fn is_successfully_closed(&self) -> bool {
        self.status == Status::Done && self.resolution == Some(Resolution::Completed)
    }

    /// Is this ticket closed with anything other than `completed`?
    pub fn is_unsuccessfully_closed(&self) -> bool {
        self.status.is_terminal() && !self.is_successfully_closed()
    }
}

/// Project-scoped ticket identity, rendered as `PROJECT-N`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TicketId {
    pub project: String,
    pub number: u32,
}

impl TicketId {
    pub fn new(project: impl Into<String>, number: u32) -> Self {
        Self {
            project: project.into(),
            number,
        }
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.project, self.number)
    }
}

impl std::str::FromStr for TicketId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (project, number) = s
            .rsplit_once('-')
            .ok_or_else(|| Error::InvalidArgs(format!("malformed ticket id: {s:?}")))?;
        validate_project_key(project)?;
        let number = number
            .parse::<u32>()
            .map_err(|_| Error::InvalidArgs(format!("malformed ticket number in {s:?}")))?;
        Ok(Self::new(project, number))
    }
}

impl TryFrom<String> for TicketId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TicketId> for String {
    fn from(id: TicketId) -> Self {
        id.to_string()
    }
}

/// Project keys are short upper-case alphanumerics starting with a letter.
pub fn validate_project_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        && key.len() <= 16;
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgs(format!(
            "project key must be 1-16 upper-case alphanumerics starting with a letter, got {key:?}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Just created, not yet validated against its prerequisites.
    Created,
    /// Workable; waiting for a worker.
    Ready,
    /// Waiting on unresolved prerequisites.
    Blocked,
    /// Held by exactly one active claim.
    InProgress,
    /// Waiting on a human answer.
    NeedsHuman,
    /// Work reported done, waiting on a reviewer.
    Review,
    /// Accepted. Terminal.
    Done,
    /// Abandoned. Terminal.
    Cancelled,
}

impl Status {
    pub const ALL: [Status; 8] = [
        Status::Created,
        Status::Ready,
        Status::Blocked,
        Status::InProgress,
        Status::NeedsHuman,
        Status::Review,
        Status::Done,
        Status::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Ready => "ready",
            Status::Blocked => "blocked",
            Status::InProgress => "in_progress",
            Status::NeedsHuman => "needs_human",
            Status::Review => "review",
            Status::Done => "done",
            Status::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidArgs(format!("unknown status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Priority / Resolution
// ---------------------------------------------------------------------------

/// Ticket priority. Declaration order is claim order: `Highest` first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Highest,
    High,
    #[default]
    Medium,
    Low,
    Lowest,
}

impl Priority {
    /// Sort rank, 0 = most urgent. Stored as-is.
    pub fn rank(self) -> i64 {
        self as i64
    }

    pub fn from_rank(rank: i64) -> Result<Self> {
        match rank {
            0 => Ok(Priority::Highest),
            1 => Ok(Priority::High),
            2 => Ok(Priority::Medium),
            3 => Ok(Priority::Low),
            4 => Ok(Priority::Lowest),
            _ => Err(Error::Internal(format!("unknown priority rank: {rank}"))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Highest => "highest",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Lowest => "lowest",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "highest" => Ok(Priority::Highest),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            "lowest" => Ok(Priority::Lowest),
            _ => Err(Error::InvalidArgs(format!("unknown priority: {s}"))),
        }
    }
}

/// How a closed ticket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Completed,
    WontDo,
    Duplicate,
    Invalid,
    Obsolete,
}

impl Resolution {
    pub fn is_success(self) -> bool {
        self == Resolution::Completed
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Resolution::Completed => "completed",
            Resolution::WontDo => "wont_do",
            Resolution::Duplicate => "duplicate",
            Resolution::Invalid => "invalid",
            Resolution::Obsolete => "obsolete",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(Resolution::Completed),
            "wont_do" => Ok(Resolution::WontDo),
            "duplicate" => Ok(Resolution::Duplicate),
            "invalid" => Ok(Resolution::Invalid),
            "obsolete" => Ok(Resolution::Obsolete),
            _ => Err(Error::InvalidArgs(format!("unknown resolution: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

/// A time-bounded lease binding one worker to one ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub ticket_id: TicketId,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ClaimStatus,
    /// When the claim left `active`.
    pub ended_at: Option<DateTime<Utc>>,
    /// Why the claim ended (release reason, escalation note).
    pub reason: Option<String>,
}

impl Claim {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ClaimStatus::Active && self.expires_at < now
    }

    /// Leave `active`. Claims are never mutated afterwards.
    pub(crate) fn end(
        &mut self,
        status: ClaimStatus,
        now: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<()> {
        if self.status != ClaimStatus::Active {
            return Err(Error::Conflict(format!(
                "claim {} on {} already {}",
                self.id, self.ticket_id, self.status
            )));
        }
        self.status = status;
        self.ended_at = Some(now);
        self.reason = reason;
        Ok(())
    }
}

/// Newtype for claim IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimId(pub Uuid);

impl ClaimId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClaimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Active,
    Completed,
    Expired,
    Released,
}

impl ClaimStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Active => "active",
            ClaimStatus::Completed => "completed",
            ClaimStatus::Expired => "expired",
            ClaimStatus::Released => "released",
        }
    }
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClaimStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ClaimStatus::Active),
            "completed" => Ok(ClaimStatus::Completed),
            "expired" => Ok(ClaimStatus::Expired),
            "released" => Ok(ClaimStatus::Released),
            _ => Err(Error::Internal(format!("unknown claim status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Dependency
// ---------------------------------------------------------------------------

/// Directed edge: `dependent` cannot proceed until `prerequisite` succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub dependent: TicketId,
    pub prerequisite: TicketId,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filter for listing tickets. Results are ordered by priority, then age.
#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub project: Option<String>,
    pub statuses: Vec<Status>,
    pub parent: Option<TicketId>,
    pub priority: Option<Priority>,
    pub limit: Option<usize>,
}

impl TicketFilter {
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn parent(mut self, parent: TicketId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, ticket: &Ticket) -> bool {
        self.project
            .as_ref()
            .is_none_or(|p| *p == ticket.id.project)
            && (self.statuses.is_empty() || self.statuses.contains(&ticket.status))
            && self
                .parent
                .as_ref()
                .is_none_or(|p| ticket.parent.as_ref() == Some(p))
            && self.priority.is_none_or(|p| p == ticket.priority)
    }
}

/// Queue order: priority first, then oldest, then lowest number.
pub fn queue_order(a: &Ticket, b: &Ticket) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for creating new tickets. The engine's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub(crate) project: String,
    pub(crate) title: String,
    pub(crate) description: String,
    pub(crate) priority: Priority,
    pub(crate) parent: Option<TicketId>,
    pub(crate) max_retries: Option<u32>,
}

impl NewTicket {
    pub fn new(project: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            title: title.into(),
            description: String::new(),
            priority: Priority::default(),
            parent: None,
            max_retries: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn parent(mut self, parent: TicketId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }
}
