//! Persistence seam.
//!
//! The engine never touches storage directly. It borrows a [`StoreTx`]
//! for the duration of one operation; everything done through it commits
//! together or not at all. Activity entries are appended outside the
//! transaction so a failed audit write never rolls back a state change.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::activity::{ActivityEntry, NewActivity};
use crate::error::Result;
use crate::model::{Claim, ClaimId, Dependency, Ticket, TicketFilter, TicketId};

/// Operations available inside one transaction.
pub trait StoreTx {
    /// Allocate the next sequence number for a project, starting at 1.
    fn next_ticket_number(&mut self, project: &str) -> Result<u32>;
    fn insert_ticket(&mut self, ticket: &Ticket) -> Result<()>;
    /// `Error::NotFound` for an unknown id.
    fn get_ticket(&mut self, id: &TicketId) -> Result<Ticket>;
    /// Overwrite every mutable field of an existing ticket.
    fn update_ticket(&mut self, ticket: &Ticket) -> Result<()>;
    /// Matching tickets in queue order.
    fn list_tickets(&mut self, filter: &TicketFilter) -> Result<Vec<Ticket>>;

    /// Insert a claim. An active claim on a ticket that already has one
    /// fails with `Error::Conflict`; the check belongs to the store.
    fn insert_claim(&mut self, claim: &Claim) -> Result<()>;
    fn get_claim(&mut self, id: ClaimId) -> Result<Claim>;
    fn active_claim(&mut self, ticket: &TicketId) -> Result<Option<Claim>>;
    fn update_claim(&mut self, claim: &Claim) -> Result<()>;
    /// Active claims with `expires_at < now`, oldest expiry first.
    fn expired_claims(&mut self, now: DateTime<Utc>) -> Result<Vec<Claim>>;

    /// Returns false if the edge already existed.
    fn insert_dependency(&mut self, dep: &Dependency) -> Result<bool>;
    /// Returns false if there was no such edge.
    fn delete_dependency(&mut self, dependent: &TicketId, prerequisite: &TicketId)
    -> Result<bool>;
    fn prerequisites_of(&mut self, id: &TicketId) -> Result<Vec<TicketId>>;
    fn dependents_of(&mut self, id: &TicketId) -> Result<Vec<TicketId>>;
}

/// A durable (or fake) home for tickets, claims, edges and activity.
pub trait TicketStore: Send + Sync {
    /// Run `f` in one serializable unit. Commits on `Ok`, rolls back on `Err`.
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>;

    /// Append one audit entry, assigning its sequence number.
    fn append_activity(&self, entry: NewActivity) -> Result<ActivityEntry>;

    /// Entries for one ticket in sequence order.
    fn activity_for(&self, ticket: &TicketId) -> Result<Vec<ActivityEntry>>;
}

impl<S: TicketStore> TicketStore for std::sync::Arc<S> {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>,
    {
        (**self).transaction(f)
    }

    fn append_activity(&self, entry: NewActivity) -> Result<ActivityEntry> {
        (**self).append_activity(entry)
    }

    fn activity_for(&self, ticket: &TicketId) -> Result<Vec<ActivityEntry>> {
        (**self).activity_for(ticket)
    }
}
