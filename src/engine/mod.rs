//! Core engine. The public API for creating, claiming and closing tickets.
//!
//! The engine owns no state of its own: every operation opens one store
//! transaction, re-reads what it needs, validates through the state
//! machine and writes back. Activity entries, logs and metrics are
//! collected in a [`Journal`] and published only after the commit.

pub mod claims;
pub mod deps;
pub mod lifecycle;
pub mod sweep;

pub use claims::{ExpireDecision, ExpireOutcome, ExpireReport, ReleaseBy};
pub use deps::{CloseReport, DependentOutcome, ItemError, ParentOutcome, ResolveReport};
pub use lifecycle::Closed;
pub use sweep::{SweepConfig, Sweeper};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{Span, info, warn};

use crate::activity::{Action, ActivityEntry, Actor, NewActivity};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::*;
use crate::state_machine::{self, Event};
use crate::store::{MemoryStore, SqliteStore, StoreTx, TicketStore};
use crate::telemetry::{metrics, ticket::record_state_transition};

/// Whether a parent may auto-complete around children that closed
/// unsuccessfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentPolicy {
    /// Every child must close as `completed`.
    #[default]
    RequireSuccess,
    /// Any terminal child counts toward completion.
    AllowClosed,
}

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `max_retries` for tickets created without one.
    pub default_max_retries: u32,
    /// Lease length used when a caller does not pass one.
    pub default_lease: Duration,
    /// Close parents straight to `done` when all children succeed.
    pub auto_accept_parent: bool,
    pub parent_policy: ParentPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_lease: Duration::seconds(claims::DEFAULT_LEASE_SECONDS),
            auto_accept_parent: false,
            parent_policy: ParentPolicy::RequireSuccess,
        }
    }
}

/// The ticket engine. Enforces every lifecycle invariant.
pub struct Engine<S> {
    store: S,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine<MemoryStore> {
    /// Create an engine with in-memory storage (for testing).
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }
}

impl Engine<SqliteStore> {
    /// Create an engine backed by a SQLite file.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(SqliteStore::open(path)?))
    }
}

impl<S: TicketStore> Engine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create a ticket. It is validated immediately and lands in `ready`.
    pub fn create_ticket(&self, new: NewTicket, actor: &Actor) -> Result<Ticket> {
        let _span = tracing::info_span!("ticket.create", "ticket.project" = %new.project).entered();
        validate_project_key(&new.project)?;
        if new.title.trim().is_empty() {
            return Err(Error::InvalidArgs("title must not be empty".into()));
        }
        let now = self.now();
        let max_retries = new.max_retries.unwrap_or(self.config.default_max_retries);

        let ticket = self.run(|tx, journal| {
            if let Some(ref parent) = new.parent {
                let parent = tx.get_ticket(parent)?;
                if parent.status.is_terminal() {
                    return Err(Error::InvalidArgs(format!(
                        "parent {} is already {}",
                        parent.id, parent.status
                    )));
                }
            }

            let number = tx.next_ticket_number(&new.project)?;
            let mut ticket = Ticket {
                id: TicketId::new(new.project.clone(), number),
                title: new.title.clone(),
                description: new.description.clone(),
                status: Status::Created,
                priority: new.priority,
                retry_count: 0,
                max_retries,
                parent: new.parent.clone(),
                resolution: None,
                human_flag_reason: None,
                flagged_from: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            };
            // A new ticket has no edges yet, so it can never start blocked.
            apply(&mut ticket, Event::Validate { blocked: false }, now, journal)?;
            tx.insert_ticket(&ticket)?;

            journal.note(
                &ticket.id,
                Action::Created,
                actor,
                now,
                Some(serde_json::json!({
                    "priority": ticket.priority,
                    "parent": ticket.parent,
                })),
            );
            journal.note(
                &ticket.id,
                Action::Validated,
                &Actor::System,
                now,
                Some(serde_json::json!({ "status": ticket.status })),
            );
            Ok(ticket)
        })?;

        metrics::tickets_created().add(1, &[KeyValue::new("project", new.project)]);
        Ok(ticket)
    }

    /// Get a ticket by ID.
    pub fn get_ticket(&self, id: &TicketId) -> Result<Ticket> {
        self.store.transaction(|tx| tx.get_ticket(id))
    }

    /// List tickets in queue order (priority, then age).
    pub fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        self.store.transaction(|tx| tx.list_tickets(filter))
    }

    /// The active claim on a ticket, if any.
    pub fn active_claim(&self, id: &TicketId) -> Result<Option<Claim>> {
        self.store.transaction(|tx| {
            tx.get_ticket(id)?;
            tx.active_claim(id)
        })
    }

    /// Direct prerequisites of a ticket.
    pub fn prerequisites(&self, id: &TicketId) -> Result<Vec<TicketId>> {
        self.store.transaction(|tx| {
            tx.get_ticket(id)?;
            tx.prerequisites_of(id)
        })
    }

    /// Audit trail for a ticket, oldest first.
    pub fn activity(&self, id: &TicketId) -> Result<Vec<ActivityEntry>> {
        self.store.activity_for(id)
    }

    /// Run `f` in one transaction, publishing its journal after commit.
    pub(crate) fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx, &mut Journal) -> Result<T>,
    {
        let mut journal = Journal::default();
        let out = self.store.transaction(|tx| f(tx, &mut journal))?;
        self.publish(journal);
        Ok(out)
    }

    /// Emit logs, metrics and activity for committed work.
    ///
    /// Activity append failures are logged and swallowed: the state change
    /// has already committed and must stand.
    pub(crate) fn publish(&self, journal: Journal) {
        let span = Span::current();
        for t in &journal.transitions {
            record_state_transition(&span, &t.ticket, t.from, t.to);
            metrics::state_transitions().add(
                1,
                &[
                    KeyValue::new("from", t.from.as_str()),
                    KeyValue::new("to", t.to.as_str()),
                ],
            );
        }
        for entry in journal.activity {
            let (ticket, action) = (entry.ticket_id.clone(), entry.action);
            if let Err(e) = self.store.append_activity(entry) {
                warn!(%ticket, %action, error = %e, "failed to append activity entry");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Side effects produced inside a transaction, published after commit.
#[derive(Debug, Default)]
pub(crate) struct Journal {
    activity: Vec<NewActivity>,
    transitions: Vec<Transition>,
}

#[derive(Debug)]
struct Transition {
    ticket: TicketId,
    from: Status,
    to: Status,
}

impl Journal {
    pub(crate) fn note(
        &mut self,
        ticket: &TicketId,
        action: Action,
        actor: &Actor,
        now: DateTime<Utc>,
        details: Option<serde_json::Value>,
    ) {
        let mut entry = NewActivity::new(ticket.clone(), action, actor.clone(), now);
        if let Some(details) = details {
            entry = entry.details(details);
        }
        self.activity.push(entry);
    }
}

// ---------------------------------------------------------------------------
// Shared transition helpers
// ---------------------------------------------------------------------------

/// Validate `event` and move `ticket` in memory. Returns the prior status.
/// The caller writes the ticket back.
pub(crate) fn apply(
    ticket: &mut Ticket,
    event: Event,
    now: DateTime<Utc>,
    journal: &mut Journal,
) -> Result<Status> {
    let from = ticket.status;
    let to = state_machine::transition(&ticket.id, from, event)?;
    ticket.status = to;
    ticket.updated_at = now;
    journal.transitions.push(Transition {
        ticket: ticket.id.clone(),
        from,
        to,
    });
    Ok(from)
}

/// Prerequisites of `id` that have not closed successfully.
pub(crate) fn unresolved_prerequisites(
    tx: &mut dyn StoreTx,
    id: &TicketId,
) -> Result<Vec<TicketId>> {
    let mut unresolved = Vec::new();
    for prerequisite in tx.prerequisites_of(id)? {
        if !tx.get_ticket(&prerequisite)?.is_successfully_closed() {
            unresolved.push(prerequisite);
        }
    }
    Ok(unresolved)
}

/// A ticket that just landed in `ready` but still has unresolved
/// prerequisites goes straight on to `blocked`.
pub(crate) fn settle_ready(
    tx: &mut dyn StoreTx,
    ticket: &mut Ticket,
    now: DateTime<Utc>,
    journal: &mut Journal,
) -> Result<()> {
    if ticket.status != Status::Ready {
        return Ok(());
    }
    let unresolved = unresolved_prerequisites(tx, &ticket.id)?;
    if unresolved.is_empty() {
        return Ok(());
    }
    apply(ticket, Event::AddDependency, now, journal)?;
    journal.note(
        &ticket.id,
        Action::Blocked,
        &Actor::System,
        now,
        Some(serde_json::json!({ "unresolved": unresolved })),
    );
    Ok(())
}

/// End the active claim on `id`, if any.
pub(crate) fn end_active_claim(
    tx: &mut dyn StoreTx,
    id: &TicketId,
    status: ClaimStatus,
    now: DateTime<Utc>,
    reason: &str,
) -> Result<Option<Claim>> {
    let Some(mut claim) = tx.active_claim(id)? else {
        return Ok(None);
    };
    claim.end(status, now, Some(reason.to_string()))?;
    tx.update_claim(&claim)?;
    info!(ticket = %id, claim = %claim.id, status = %status, reason, "claim ended");
    Ok(Some(claim))
}
