//! In-process store.
//!
//! One mutex serializes every transaction. A transaction works on a copy
//! of the state and swaps it in only on success, so an `Err` anywhere in
//! the closure leaves nothing behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{StoreTx, TicketStore};
use crate::activity::{ActivityEntry, NewActivity};
use crate::error::{Error, Result};
use crate::model::{
    Claim, ClaimId, ClaimStatus, Dependency, Ticket, TicketFilter, TicketId, queue_order,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    activity: Mutex<Vec<ActivityEntry>>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    sequences: HashMap<String, u32>,
    tickets: BTreeMap<TicketId, Ticket>,
    claims: BTreeMap<ClaimId, Claim>,
    /// (dependent, prerequisite) -> created_at
    edges: BTreeMap<(TicketId, TicketId), DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryTx {
    state: MemoryState,
}

impl TicketStore for MemoryStore {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>,
    {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".into()))?;
        let mut tx = MemoryTx {
            state: guard.clone(),
        };
        let out = f(&mut tx)?;
        *guard = tx.state;
        Ok(out)
    }

    fn append_activity(&self, entry: NewActivity) -> Result<ActivityEntry> {
        let mut log = self
            .activity
            .lock()
            .map_err(|_| Error::Internal("activity log lock poisoned".into()))?;
        let entry = entry.into_entry(log.len() as u64 + 1);
        log.push(entry.clone());
        Ok(entry)
    }

    fn activity_for(&self, ticket: &TicketId) -> Result<Vec<ActivityEntry>> {
        let log = self
            .activity
            .lock()
            .map_err(|_| Error::Internal("activity log lock poisoned".into()))?;
        Ok(log
            .iter()
            .filter(|e| e.ticket_id == *ticket)
            .cloned()
            .collect())
    }
}

impl StoreTx for MemoryTx {
    fn next_ticket_number(&mut self, project: &str) -> Result<u32> {
        let seq = self.state.sequences.entry(project.to_string()).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }

    fn insert_ticket(&mut self, ticket: &Ticket) -> Result<()> {
        if self.state.tickets.contains_key(&ticket.id) {
            return Err(Error::Conflict(format!("ticket {} already exists", ticket.id)));
        }
        self.state.tickets.insert(ticket.id.clone(), ticket.clone());
        Ok(())
    }

    fn get_ticket(&mut self, id: &TicketId) -> Result<Ticket> {
        self.state
            .tickets
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("ticket {id}")))
    }

    fn update_ticket(&mut self, ticket: &Ticket) -> Result<()> {
        let slot = self
            .state
            .tickets
            .get_mut(&ticket.id)
            .ok_or_else(|| Error::NotFound(format!("ticket {}", ticket.id)))?;
        *slot = ticket.clone();
        Ok(())
    }

    fn list_tickets(&mut self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        let mut out: Vec<Ticket> = self
            .state
            .tickets
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        out.sort_by(queue_order);
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn insert_claim(&mut self, claim: &Claim) -> Result<()> {
        if claim.status == ClaimStatus::Active && self.active_claim(&claim.ticket_id)?.is_some() {
            return Err(Error::Conflict(format!(
                "ticket {} already has an active claim",
                claim.ticket_id
            )));
        }
        self.state.claims.insert(claim.id, claim.clone());
        Ok(())
    }

    fn get_claim(&mut self, id: ClaimId) -> Result<Claim> {
        self.state
            .claims
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("claim {id}")))
    }

    fn active_claim(&mut self, ticket: &TicketId) -> Result<Option<Claim>> {
        Ok(self
            .state
            .claims
            .values()
            .find(|c| c.ticket_id == *ticket && c.status == ClaimStatus::Active)
            .cloned())
    }

    fn update_claim(&mut self, claim: &Claim) -> Result<()> {
        let slot = self
            .state
            .claims
            .get_mut(&claim.id)
            .ok_or_else(|| Error::NotFound(format!("claim {}", claim.id)))?;
        *slot = claim.clone();
        Ok(())
    }

    fn expired_claims(&mut self, now: DateTime<Utc>) -> Result<Vec<Claim>> {
        let mut out: Vec<Claim> = self
            .state
            .claims
            .values()
            .filter(|c| c.is_expired_at(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(out)
    }

    fn insert_dependency(&mut self, dep: &Dependency) -> Result<bool> {
        let key = (dep.dependent.clone(), dep.prerequisite.clone());
        if self.state.edges.contains_key(&key) {
            return Ok(false);
        }
        self.state.edges.insert(key, dep.created_at);
        Ok(true)
    }

    fn delete_dependency(
        &mut self,
        dependent: &TicketId,
        prerequisite: &TicketId,
    ) -> Result<bool> {
        Ok(self
            .state
            .edges
            .remove(&(dependent.clone(), prerequisite.clone()))
            .is_some())
    }

    fn prerequisites_of(&mut self, id: &TicketId) -> Result<Vec<TicketId>> {
        Ok(self
            .state
            .edges
            .keys()
            .filter(|(dependent, _)| dependent == id)
            .map(|(_, prerequisite)| prerequisite.clone())
            .collect())
    }

    fn dependents_of(&mut self, id: &TicketId) -> Result<Vec<TicketId>> {
        Ok(self
            .state
            .edges
            .keys()
            .filter(|(_, prerequisite)| prerequisite == id)
            .map(|(dependent, _)| dependent.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, Status};

    fn ticket(number: u32) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: TicketId::new("MEM", number),
            title: format!("ticket {number}"),
            description: String::new(),
            status: Status::Ready,
            priority: Priority::Medium,
            retry_count: 0,
            max_retries: 3,
            parent: None,
            resolution: None,
            human_flag_reason: None,
            flagged_from: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn active_claim(ticket: &TicketId) -> Claim {
        let now = Utc::now();
        Claim {
            id: ClaimId::new(),
            ticket_id: ticket.clone(),
            worker_id: "w".into(),
            claimed_at: now,
            expires_at: now + chrono::Duration::minutes(5),
            status: ClaimStatus::Active,
            ended_at: None,
            reason: None,
        }
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        let result: Result<()> = store.transaction(|tx| {
            tx.insert_ticket(&ticket(1))?;
            Err(Error::Other("boom".into()))
        });
        assert!(result.is_err());

        let found = store.transaction(|tx| tx.get_ticket(&TicketId::new("MEM", 1)));
        assert!(matches!(found, Err(Error::NotFound(_))));
    }

    #[test]
    fn second_active_claim_conflicts() {
        let store = MemoryStore::new();
        let t = ticket(1);
        store
            .transaction(|tx| {
                tx.insert_ticket(&t)?;
                tx.insert_claim(&active_claim(&t.id))
            })
            .unwrap();

        let second = store.transaction(|tx| tx.insert_claim(&active_claim(&t.id)));
        assert!(matches!(second, Err(Error::Conflict(_))));
    }

    #[test]
    fn sequences_are_per_project() {
        let store = MemoryStore::new();
        let numbers = store
            .transaction(|tx| {
                Ok((
                    tx.next_ticket_number("A")?,
                    tx.next_ticket_number("A")?,
                    tx.next_ticket_number("B")?,
                ))
            })
            .unwrap();
        assert_eq!(numbers, (1, 2, 1));
    }
}
