//! Work and review transitions: complete, flag, respond, accept, reject,
//! cancel and reopen.

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use super::claims::check_holder;
use super::deps::{CloseReport, ParentOutcome, refresh_prerequisite_flag};
use super::{Engine, apply, end_active_claim, settle_ready, unresolved_prerequisites};
use crate::activity::{Action, Actor};
use crate::error::{Error, Result};
use crate::model::*;
use crate::state_machine::Event;
use crate::store::TicketStore;
use crate::telemetry::ticket::op_span;

/// A ticket that just closed, with what closing it set in motion.
#[derive(Debug, Clone, Serialize)]
pub struct Closed {
    pub ticket: Ticket,
    pub propagation: CloseReport,
}

impl<S: TicketStore> Engine<S> {
    /// The holder finished work; the ticket moves to `review` and the claim
    /// is marked completed.
    pub fn complete(&self, id: &TicketId, worker: &str, summary: Option<&str>) -> Result<Ticket> {
        let span = op_span("complete", id);
        let _enter = span.enter();
        let now = self.now();

        self.run(|tx, journal| {
            let mut ticket = tx.get_ticket(id)?;
            apply(&mut ticket, Event::Complete, now, journal)?;
            let mut claim = tx.active_claim(id)?.ok_or_else(|| {
                Error::Internal(format!("ticket {id} is in progress without an active claim"))
            })?;
            check_holder(&claim, worker)?;
            if claim.is_expired_at(now) {
                return Err(Error::LeaseExpired {
                    ticket: id.clone(),
                    expired_at: claim.expires_at,
                });
            }
            claim.end(ClaimStatus::Completed, now, summary.map(str::to_string))?;
            tx.update_claim(&claim)?;
            tx.update_ticket(&ticket)?;
            journal.note(
                id,
                Action::Completed,
                &Actor::agent(worker),
                now,
                Some(json!({ "claim_id": claim.id, "summary": summary })),
            );
            Ok(ticket)
        })
    }

    /// Route a ticket to human attention. Any claim is kept so the holder
    /// can resume once answered.
    pub fn flag(&self, id: &TicketId, actor: &Actor, reason: &str) -> Result<Ticket> {
        let span = op_span("flag", id);
        let _enter = span.enter();
        if reason.trim().is_empty() {
            return Err(Error::InvalidArgs("flag reason must not be empty".into()));
        }
        let now = self.now();

        self.run(|tx, journal| {
            let mut ticket = tx.get_ticket(id)?;
            let from = apply(&mut ticket, Event::Flag, now, journal)?;
            // Re-flagging keeps where the ticket originally came from.
            if from != Status::NeedsHuman {
                ticket.flagged_from = Some(from);
            }
            ticket.human_flag_reason = Some(reason.to_string());
            tx.update_ticket(&ticket)?;
            journal.note(
                id,
                Action::Flagged,
                actor,
                now,
                Some(json!({ "reason": reason, "from": from })),
            );
            Ok(ticket)
        })
    }

    /// Answer a flagged ticket.
    ///
    /// It goes back to `in_progress` only while its holder still has a live
    /// lease and nothing blocks it; otherwise the claim is ended and the
    /// ticket returns to the queue (or to `blocked`). A parent whose children
    /// all finished while it was flagged moves on to `review`.
    pub fn respond(&self, id: &TicketId, actor: &Actor, answer: &str) -> Result<Ticket> {
        let span = op_span("respond", id);
        let _enter = span.enter();
        let now = self.now();

        let ticket = self.run(|tx, journal| {
            let mut ticket = tx.get_ticket(id)?;
            if ticket.status != Status::NeedsHuman {
                return Err(Error::InvalidTransition {
                    id: id.clone(),
                    from: ticket.status,
                    event: Event::Respond {
                        resume: Status::Ready,
                    },
                });
            }

            let unresolved = unresolved_prerequisites(tx, id)?;
            let resume = match tx.active_claim(id)? {
                Some(claim) if claim.is_expired_at(now) => {
                    end_active_claim(tx, id, ClaimStatus::Expired, now, "lease expired")?;
                    Status::Ready
                }
                Some(_) if !unresolved.is_empty() => {
                    end_active_claim(tx, id, ClaimStatus::Released, now, "blocked by prerequisites")?;
                    Status::Ready
                }
                Some(_) => Status::InProgress,
                None => Status::Ready,
            };

            apply(&mut ticket, Event::Respond { resume }, now, journal)?;
            ticket.human_flag_reason = None;
            ticket.flagged_from = None;
            settle_ready(tx, &mut ticket, now, journal)?;
            tx.update_ticket(&ticket)?;
            journal.note(
                id,
                Action::Responded,
                actor,
                now,
                Some(json!({ "answer": answer, "resume": resume })),
            );
            Ok(ticket)
        })?;
        if ticket.status == Status::Blocked {
            return Ok(ticket);
        }
        let (mut cascaded, mut errors) = (Vec::new(), Vec::new());
        match self.settle_parent(
            id,
            self.config.auto_accept_parent,
            now,
            &mut cascaded,
            &mut errors,
        ) {
            Some(ParentOutcome::Review | ParentOutcome::Accepted) => self.get_ticket(id),
            _ => Ok(ticket),
        }
    }

    /// Accept reviewed work. Closes the ticket as `completed` and
    /// propagates to dependents and the parent.
    pub fn accept(&self, id: &TicketId, actor: &Actor) -> Result<Closed> {
        let span = op_span("accept", id);
        let _enter = span.enter();
        let now = self.now();

        let ticket = self.run(|tx, journal| {
            let mut ticket = tx.get_ticket(id)?;
            apply(&mut ticket, Event::Accept, now, journal)?;
            ticket.resolution = Some(Resolution::Completed);
            ticket.completed_at = Some(now);
            tx.update_ticket(&ticket)?;
            journal.note(id, Action::Accepted, actor, now, None);
            Ok(ticket)
        })?;
        Ok(self.closed(ticket))
    }

    /// Send reviewed work back to the queue.
    pub fn reject(&self, id: &TicketId, actor: &Actor, reason: &str) -> Result<Ticket> {
        let span = op_span("reject", id);
        let _enter = span.enter();
        let now = self.now();

        self.run(|tx, journal| {
            let mut ticket = tx.get_ticket(id)?;
            apply(&mut ticket, Event::Reject, now, journal)?;
            settle_ready(tx, &mut ticket, now, journal)?;
            tx.update_ticket(&ticket)?;
            journal.note(
                id,
                Action::Rejected,
                actor,
                now,
                Some(json!({ "reason": reason })),
            );
            Ok(ticket)
        })
    }

    /// Close a ticket without completing it. Releases any claim.
    pub fn cancel(&self, id: &TicketId, actor: &Actor, resolution: Resolution) -> Result<Closed> {
        let span = op_span("cancel", id);
        let _enter = span.enter();
        if resolution.is_success() {
            return Err(Error::InvalidArgs(
                "a cancelled ticket cannot resolve as completed".into(),
            ));
        }
        let now = self.now();

        let ticket = self.run(|tx, journal| {
            let mut ticket = tx.get_ticket(id)?;
            apply(&mut ticket, Event::Cancel, now, journal)?;
            end_active_claim(tx, id, ClaimStatus::Released, now, "cancelled")?;
            ticket.resolution = Some(resolution);
            ticket.completed_at = Some(now);
            tx.update_ticket(&ticket)?;
            journal.note(
                id,
                Action::Cancelled,
                actor,
                now,
                Some(json!({ "resolution": resolution })),
            );
            Ok(ticket)
        })?;
        Ok(self.closed(ticket))
    }

    /// Reopen a closed ticket. Retries reset, the resolution is cleared and
    /// the ticket is validated again, so it lands in `ready` or `blocked`.
    /// Dependents that had moved on are blocked again.
    pub fn reopen(&self, id: &TicketId, actor: &Actor) -> Result<Ticket> {
        let span = op_span("reopen", id);
        let _enter = span.enter();
        let now = self.now();

        self.run(|tx, journal| {
            let mut ticket = tx.get_ticket(id)?;
            let from = apply(&mut ticket, Event::Reopen, now, journal)?;
            ticket.retry_count = 0;
            ticket.resolution = None;
            ticket.completed_at = None;
            ticket.human_flag_reason = None;
            ticket.flagged_from = None;

            let unresolved = unresolved_prerequisites(tx, id)?;
            apply(
                &mut ticket,
                Event::Validate {
                    blocked: !unresolved.is_empty(),
                },
                now,
                journal,
            )?;
            tx.update_ticket(&ticket)?;
            journal.note(
                id,
                Action::Reopened,
                actor,
                now,
                Some(json!({ "from": from })),
            );
            journal.note(
                id,
                Action::Validated,
                &Actor::System,
                now,
                Some(json!({ "status": ticket.status, "unresolved": unresolved })),
            );

            for dependent in tx.dependents_of(id)? {
                let mut dependent = tx.get_ticket(&dependent)?;
                if dependent.status.is_terminal() {
                    continue;
                }
                let reflagged = refresh_prerequisite_flag(tx, &mut dependent, now)?;
                if !matches!(dependent.status, Status::Ready | Status::InProgress) {
                    if reflagged {
                        tx.update_ticket(&dependent)?;
                    }
                    continue;
                }
                if dependent.status == Status::InProgress {
                    let reason = format!("prerequisite {id} reopened");
                    end_active_claim(tx, &dependent.id, ClaimStatus::Released, now, &reason)?;
                }
                apply(&mut dependent, Event::AddDependency, now, journal)?;
                tx.update_ticket(&dependent)?;
                journal.note(
                    &dependent.id,
                    Action::Blocked,
                    &Actor::System,
                    now,
                    Some(json!({ "prerequisite": id, "reason": "prerequisite reopened" })),
                );
            }
            Ok(ticket)
        })
    }

    /// Propagate a committed close. Propagation failures do not undo the
    /// close; they are logged and reported, and `resolve_all` repairs them.
    fn closed(&self, ticket: Ticket) -> Closed {
        let propagation = match self.on_ticket_closed(&ticket.id, self.config.auto_accept_parent) {
            Ok(report) => report,
            Err(e) => {
                warn!(ticket = %ticket.id, error = %e, "close propagation failed");
                CloseReport::failed(&ticket.id, &e)
            }
        };
        Closed {
            ticket,
            propagation,
        }
    }
}
