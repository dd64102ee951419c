//! Dependency resolution: edges, cycle rejection and close propagation.
//!
//! Edges point from a dependent to its prerequisite and must form a DAG.
//! Cycles are rejected when an edge is inserted, never detected later.
//! Propagation re-checks every precondition inside its own transaction,
//! so running it twice for the same close changes nothing the second time.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::{
    Engine, Journal, ParentPolicy, apply, end_active_claim, unresolved_prerequisites,
};
use crate::activity::{Action, Actor};
use crate::error::{Error, ErrorKind, Result};
use crate::model::*;
use crate::state_machine::Event;
use crate::store::{StoreTx, TicketStore};
use crate::telemetry::{metrics, ticket::op_span};

/// A failure on one item of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    pub ticket_id: TicketId,
    pub kind: ErrorKind,
    pub message: String,
}

impl ItemError {
    fn new(ticket_id: &TicketId, error: &Error) -> Self {
        Self {
            ticket_id: ticket_id.clone(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DependentOutcome {
    /// Last prerequisite resolved; moved to `ready`.
    Unblocked,
    StillBlocked { remaining: usize },
    /// A prerequisite failed; `human_flag_reason` set, status unchanged.
    Flagged,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ParentOutcome {
    Waiting { done: usize, total: usize },
    /// Every child finished but the parent still waits on prerequisites.
    Blocked { remaining: usize },
    /// Every child finished; parent moved to `review`.
    Review,
    /// Every child finished and the parent was accepted straight to `done`.
    Accepted,
    /// Parent already in review or closed.
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependentResult {
    pub ticket_id: TicketId,
    pub outcome: DependentOutcome,
    /// Re-check of the dependent's own children after it was unblocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<ParentOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParentResult {
    pub ticket_id: TicketId,
    pub outcome: ParentOutcome,
}

/// What closing one ticket set in motion.
#[derive(Debug, Clone, Serialize)]
pub struct CloseReport {
    pub ticket_id: TicketId,
    pub resolution: Option<Resolution>,
    pub dependents: Vec<DependentResult>,
    pub parent: Option<ParentResult>,
    /// Propagation from a parent that this close auto-accepted.
    pub cascaded: Vec<CloseReport>,
    pub errors: Vec<ItemError>,
}

impl CloseReport {
    fn new(ticket: &Ticket) -> Self {
        Self {
            ticket_id: ticket.id.clone(),
            resolution: ticket.resolution,
            dependents: Vec::new(),
            parent: None,
            cascaded: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// A report for a close whose propagation could not even start.
    pub(crate) fn failed(id: &TicketId, error: &Error) -> Self {
        Self {
            ticket_id: id.clone(),
            resolution: None,
            dependents: Vec::new(),
            parent: None,
            cascaded: Vec::new(),
            errors: vec![ItemError::new(id, error)],
        }
    }

    /// Tickets unblocked here and in cascaded closes.
    pub fn unblocked(&self) -> usize {
        self.count(DependentOutcome::Unblocked)
    }

    /// Dependents flagged here and in cascaded closes.
    pub fn flagged(&self) -> usize {
        self.count(DependentOutcome::Flagged)
    }

    pub fn error_count(&self) -> usize {
        self.errors.len() + self.cascaded.iter().map(|c| c.error_count()).sum::<usize>()
    }

    fn count(&self, outcome: DependentOutcome) -> usize {
        self.dependents.iter().filter(|d| d.outcome == outcome).count()
            + self.cascaded.iter().map(|c| c.count(outcome)).sum::<usize>()
    }
}

/// Result of a full re-scan of blocked tickets.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolveReport {
    pub examined: usize,
    pub unblocked: usize,
    pub still_blocked: usize,
    /// Unblocked parents whose children had all finished.
    pub parents_completed: usize,
    pub cascaded: Vec<CloseReport>,
    pub errors: Vec<ItemError>,
}

impl<S: TicketStore> Engine<S> {
    /// Make `dependent` wait on `prerequisite`.
    ///
    /// Rejects self-edges and cycles. Adding an existing edge is a no-op.
    /// If the prerequisite is still open, a `ready` or `in_progress`
    /// dependent becomes `blocked` (releasing its claim).
    pub fn add_dependency(
        &self,
        dependent: &TicketId,
        prerequisite: &TicketId,
        actor: &Actor,
    ) -> Result<Ticket> {
        let span = op_span("add_dependency", dependent);
        let _enter = span.enter();
        if dependent == prerequisite {
            return Err(Error::InvalidArgs(format!("{dependent} cannot depend on itself")));
        }
        let now = self.now();

        self.run(|tx, journal| {
            let mut ticket = tx.get_ticket(dependent)?;
            let pre = tx.get_ticket(prerequisite)?;
            if ticket.status.is_terminal() {
                return Err(Error::InvalidTransition {
                    id: dependent.clone(),
                    from: ticket.status,
                    event: Event::AddDependency,
                });
            }
            if reaches(tx, prerequisite, dependent)? {
                return Err(Error::Cycle {
                    dependent: dependent.clone(),
                    prerequisite: prerequisite.clone(),
                });
            }
            let edge = Dependency {
                dependent: dependent.clone(),
                prerequisite: prerequisite.clone(),
                created_at: now,
            };
            if !tx.insert_dependency(&edge)? {
                return Ok(ticket);
            }
            journal.note(
                dependent,
                Action::DependencyAdded,
                actor,
                now,
                Some(json!({ "prerequisite": prerequisite })),
            );

            if pre.is_unsuccessfully_closed() {
                let reason = failed_prerequisite_reason(&pre);
                ticket.human_flag_reason = Some(reason.clone());
                ticket.updated_at = now;
                journal.note(
                    dependent,
                    Action::Escalated,
                    &Actor::System,
                    now,
                    Some(json!({ "prerequisite": prerequisite, "reason": reason })),
                );
            }
            if !pre.is_successfully_closed()
                && matches!(ticket.status, Status::Ready | Status::InProgress)
            {
                if ticket.status == Status::InProgress {
                    let reason = format!("blocked by {prerequisite}");
                    end_active_claim(tx, dependent, ClaimStatus::Released, now, &reason)?;
                }
                apply(&mut ticket, Event::AddDependency, now, journal)?;
                journal.note(
                    dependent,
                    Action::Blocked,
                    &Actor::System,
                    now,
                    Some(json!({ "prerequisite": prerequisite })),
                );
            }
            tx.update_ticket(&ticket)?;
            Ok(ticket)
        })
    }

    /// Drop an edge. A blocked dependent with nothing left to wait on
    /// becomes `ready`.
    pub fn remove_dependency(
        &self,
        dependent: &TicketId,
        prerequisite: &TicketId,
        actor: &Actor,
    ) -> Result<Ticket> {
        let span = op_span("remove_dependency", dependent);
        let _enter = span.enter();
        let now = self.now();

        let (ticket, outcome) = self.run(|tx, journal| {
            let mut ticket = tx.get_ticket(dependent)?;
            tx.get_ticket(prerequisite)?;
            if !tx.delete_dependency(dependent, prerequisite)? {
                return Err(Error::NotFound(format!(
                    "dependency {dependent} -> {prerequisite}"
                )));
            }
            journal.note(
                dependent,
                Action::DependencyRemoved,
                actor,
                now,
                Some(json!({ "prerequisite": prerequisite })),
            );
            let outcome = try_unblock(tx, &mut ticket, None, now, journal)?;
            Ok((ticket, outcome))
        })?;
        if outcome != DependentOutcome::Unblocked {
            return Ok(ticket);
        }
        metrics::tickets_unblocked().add(1, &[]);
        let (mut cascaded, mut errors) = (Vec::new(), Vec::new());
        match self.settle_parent(
            dependent,
            self.config.auto_accept_parent,
            now,
            &mut cascaded,
            &mut errors,
        ) {
            Some(ParentOutcome::Review | ParentOutcome::Accepted) => self.get_ticket(dependent),
            _ => Ok(ticket),
        }
    }

    /// Propagate the close of `id` to its dependents and its parent.
    ///
    /// Each dependent and the parent are updated in their own transaction;
    /// a failure on one is recorded and the rest still run. Only failing to
    /// read the closed ticket itself is returned as an error.
    pub fn on_ticket_closed(&self, id: &TicketId, auto_accept_parent: bool) -> Result<CloseReport> {
        let span = op_span("close", id);
        let _enter = span.enter();
        let now = self.now();

        let (closed, dependents) =
            self.store.transaction(|tx| Ok((tx.get_ticket(id)?, tx.dependents_of(id)?)))?;
        if !closed.status.is_terminal() {
            return Err(Error::InvalidArgs(format!(
                "ticket {id} is {}, not closed",
                closed.status
            )));
        }

        let mut report = CloseReport::new(&closed);
        for dependent in dependents {
            match self.run(|tx, journal| propagate_to_dependent(tx, id, &dependent, now, journal)) {
                Ok(outcome) => {
                    let mut children = None;
                    if outcome == DependentOutcome::Unblocked {
                        metrics::tickets_unblocked().add(1, &[]);
                        children = self
                            .settle_parent(
                                &dependent,
                                auto_accept_parent,
                                now,
                                &mut report.cascaded,
                                &mut report.errors,
                            )
                            .filter(|o| *o != ParentOutcome::Unchanged);
                    }
                    report.dependents.push(DependentResult {
                        ticket_id: dependent,
                        outcome,
                        children,
                    });
                }
                Err(e) => {
                    warn!(ticket = %dependent, error = %e, "failed to propagate close to dependent");
                    report.errors.push(ItemError::new(&dependent, &e));
                }
            }
        }

        if let Some(parent) = closed.parent {
            let outcome = self.settle_parent(
                &parent,
                auto_accept_parent,
                now,
                &mut report.cascaded,
                &mut report.errors,
            );
            if let Some(outcome) = outcome {
                report.parent = Some(ParentResult {
                    ticket_id: parent,
                    outcome,
                });
            }
        }

        info!(
            ticket = %id,
            unblocked = report.unblocked(),
            flagged = report.flagged(),
            errors = report.error_count(),
            "close propagated"
        );
        Ok(report)
    }

    /// Re-check every `blocked` ticket and unblock those whose
    /// prerequisites have all closed successfully.
    pub fn resolve_all(&self) -> Result<ResolveReport> {
        let now = self.now();
        let auto_accept_parent = self.config.auto_accept_parent;
        let blocked = self.list_tickets(&TicketFilter::default().status(Status::Blocked))?;

        let mut report = ResolveReport::default();
        for ticket in blocked {
            report.examined += 1;
            let result = self.run(|tx, journal| {
                let mut current = tx.get_ticket(&ticket.id)?;
                try_unblock(tx, &mut current, None, now, journal)
            });
            match result {
                Ok(DependentOutcome::Unblocked) => {
                    metrics::tickets_unblocked().add(1, &[]);
                    report.unblocked += 1;
                    let outcome = self.settle_parent(
                        &ticket.id,
                        auto_accept_parent,
                        now,
                        &mut report.cascaded,
                        &mut report.errors,
                    );
                    if matches!(outcome, Some(ParentOutcome::Review | ParentOutcome::Accepted)) {
                        report.parents_completed += 1;
                    }
                }
                Ok(DependentOutcome::StillBlocked { .. }) => report.still_blocked += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(ticket = %ticket.id, error = %e, "failed to re-check blocked ticket");
                    report.errors.push(ItemError::new(&ticket.id, &e));
                }
            }
        }
        info!(
            examined = report.examined,
            unblocked = report.unblocked,
            parents_completed = report.parents_completed,
            errors = report.errors.len(),
            "resolve pass finished"
        );
        Ok(report)
    }

    /// Re-check `parent` against its children, propagating its own close
    /// when it is auto-accepted. Returns `None` if the check failed; the
    /// failure is pushed to `errors`.
    pub(super) fn settle_parent(
        &self,
        parent: &TicketId,
        auto_accept_parent: bool,
        now: DateTime<Utc>,
        cascaded: &mut Vec<CloseReport>,
        errors: &mut Vec<ItemError>,
    ) -> Option<ParentOutcome> {
        let policy = self.config.parent_policy;
        let result = self.run(|tx, journal| {
            propagate_to_parent(tx, parent, policy, auto_accept_parent, now, journal)
        });
        match result {
            Ok(outcome) => {
                if outcome == ParentOutcome::Accepted {
                    match self.on_ticket_closed(parent, auto_accept_parent) {
                        Ok(report) => cascaded.push(report),
                        Err(e) => errors.push(ItemError::new(parent, &e)),
                    }
                }
                Some(outcome)
            }
            Err(e) => {
                warn!(ticket = %parent, error = %e, "failed to propagate to parent");
                errors.push(ItemError::new(parent, &e));
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies
// ---------------------------------------------------------------------------

/// Depth-first search over prerequisite edges from `from` looking for `target`.
fn reaches(tx: &mut dyn StoreTx, from: &TicketId, target: &TicketId) -> Result<bool> {
    let mut stack = vec![from.clone()];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == *target {
            return Ok(true);
        }
        if seen.insert(node.clone()) {
            stack.extend(tx.prerequisites_of(&node)?);
        }
    }
    Ok(false)
}

fn failed_prerequisite_reason(prerequisite: &Ticket) -> String {
    match prerequisite.resolution {
        Some(resolution) => format!("prerequisite {} closed as {resolution}", prerequisite.id),
        None => format!("prerequisite {} was {}", prerequisite.id, prerequisite.status),
    }
}

/// The prerequisite named by a reason from [`failed_prerequisite_reason`].
fn flagged_prerequisite(reason: &str) -> Option<TicketId> {
    let (id, _) = reason.strip_prefix("prerequisite ")?.split_once(' ')?;
    id.parse().ok()
}

/// Clear a failed-prerequisite flag that no longer holds, or point it at
/// another prerequisite that is still failed. Tickets in `needs_human` are
/// left for the human to answer. Returns whether the flag changed; the
/// caller writes the ticket back.
pub(crate) fn refresh_prerequisite_flag(
    tx: &mut dyn StoreTx,
    ticket: &mut Ticket,
    now: DateTime<Utc>,
) -> Result<bool> {
    if ticket.status == Status::NeedsHuman {
        return Ok(false);
    }
    let Some(flagged) = ticket
        .human_flag_reason
        .as_deref()
        .and_then(flagged_prerequisite)
    else {
        return Ok(false);
    };

    let mut failed = None;
    for id in tx.prerequisites_of(&ticket.id)? {
        let prerequisite = tx.get_ticket(&id)?;
        if !prerequisite.is_unsuccessfully_closed() {
            continue;
        }
        if prerequisite.id == flagged {
            return Ok(false);
        }
        failed.get_or_insert(prerequisite);
    }
    ticket.human_flag_reason = failed.as_ref().map(failed_prerequisite_reason);
    ticket.updated_at = now;
    info!(
        ticket = %ticket.id,
        cleared = %flagged,
        reason = ticket.human_flag_reason.as_deref(),
        "failed-prerequisite flag refreshed"
    );
    Ok(true)
}

/// Unblock `ticket` if it is blocked and nothing is left unresolved.
fn try_unblock(
    tx: &mut dyn StoreTx,
    ticket: &mut Ticket,
    cause: Option<&TicketId>,
    now: DateTime<Utc>,
    journal: &mut Journal,
) -> Result<DependentOutcome> {
    let reflagged = refresh_prerequisite_flag(tx, ticket, now)?;
    if ticket.status != Status::Blocked {
        if reflagged {
            tx.update_ticket(ticket)?;
        }
        return Ok(DependentOutcome::Unchanged);
    }
    let unresolved = unresolved_prerequisites(tx, &ticket.id)?;
    if !unresolved.is_empty() {
        if reflagged {
            tx.update_ticket(ticket)?;
        }
        return Ok(DependentOutcome::StillBlocked {
            remaining: unresolved.len(),
        });
    }
    apply(ticket, Event::DependencyResolved, now, journal)?;
    tx.update_ticket(ticket)?;
    journal.note(
        &ticket.id,
        Action::Unblocked,
        &Actor::System,
        now,
        Some(json!({ "prerequisite": cause })),
    );
    Ok(DependentOutcome::Unblocked)
}

fn propagate_to_dependent(
    tx: &mut dyn StoreTx,
    closed: &TicketId,
    dependent: &TicketId,
    now: DateTime<Utc>,
    journal: &mut Journal,
) -> Result<DependentOutcome> {
    let closed = tx.get_ticket(closed)?;
    let mut ticket = tx.get_ticket(dependent)?;
    if closed.is_successfully_closed() {
        return try_unblock(tx, &mut ticket, Some(&closed.id), now, journal);
    }
    if !closed.is_unsuccessfully_closed() || ticket.status.is_terminal() {
        return Ok(DependentOutcome::Unchanged);
    }

    let reason = failed_prerequisite_reason(&closed);
    if ticket.human_flag_reason.as_deref() == Some(reason.as_str()) {
        return Ok(DependentOutcome::Unchanged);
    }
    ticket.human_flag_reason = Some(reason.clone());
    ticket.updated_at = now;
    tx.update_ticket(&ticket)?;
    journal.note(
        dependent,
        Action::Escalated,
        &Actor::System,
        now,
        Some(json!({
            "prerequisite": closed.id,
            "resolution": closed.resolution,
            "reason": reason,
        })),
    );
    Ok(DependentOutcome::Flagged)
}

fn propagate_to_parent(
    tx: &mut dyn StoreTx,
    parent: &TicketId,
    policy: ParentPolicy,
    auto_accept: bool,
    now: DateTime<Utc>,
    journal: &mut Journal,
) -> Result<ParentOutcome> {
    let mut ticket = tx.get_ticket(parent)?;
    if ticket.status.is_terminal() || ticket.status == Status::Review {
        return Ok(ParentOutcome::Unchanged);
    }

    let children = tx.list_tickets(&TicketFilter::default().parent(parent.clone()))?;
    let total = children.len();
    if total == 0 {
        return Ok(ParentOutcome::Unchanged);
    }
    let done = children
        .iter()
        .filter(|c| match policy {
            ParentPolicy::RequireSuccess => c.is_successfully_closed(),
            ParentPolicy::AllowClosed => c.status.is_terminal(),
        })
        .count();
    if done < total {
        return Ok(ParentOutcome::Waiting { done, total });
    }
    let unresolved = unresolved_prerequisites(tx, parent)?;
    if !unresolved.is_empty() || ticket.status == Status::Blocked {
        return Ok(ParentOutcome::Blocked {
            remaining: unresolved.len(),
        });
    }

    end_active_claim(tx, parent, ClaimStatus::Completed, now, "children completed")?;
    apply(&mut ticket, Event::ChildrenCompleted, now, journal)?;
    journal.note(
        parent,
        Action::ChildrenCompleted,
        &Actor::System,
        now,
        Some(json!({ "children": total })),
    );
    let outcome = if auto_accept {
        apply(&mut ticket, Event::Accept, now, journal)?;
        ticket.resolution = Some(Resolution::Completed);
        ticket.completed_at = Some(now);
        journal.note(parent, Action::Accepted, &Actor::System, now, None);
        ParentOutcome::Accepted
    } else {
        ParentOutcome::Review
    };
    tx.update_ticket(&ticket)?;
    Ok(outcome)
}
