//! Leases: claim, renew, release and expiry.
//!
//! At most one active claim per ticket. The engine checks for one first
//! so a losing caller gets a conflict rather than a state error, but the
//! guarantee itself comes from the store: the in-memory store serializes
//! transactions and SQLite carries a partial unique index.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::{Engine, Journal, apply, settle_ready};
use crate::activity::{Action, Actor};
use crate::error::{Error, ErrorKind, Result};
use crate::model::*;
use crate::state_machine::Event;
use crate::store::{StoreTx, TicketStore};
use crate::telemetry::{metrics, ticket::op_span};

pub const MIN_LEASE_SECONDS: i64 = 30;
pub const MAX_LEASE_SECONDS: i64 = 24 * 60 * 60;
pub const DEFAULT_LEASE_SECONDS: i64 = 60 * 60;

/// `human_flag_reason` set when a ticket runs out of retries.
pub const MAX_RETRIES_EXCEEDED: &str = "max_retries_exceeded";

/// Who is releasing a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseBy {
    /// The worker that holds the claim.
    Holder(String),
    /// A human overriding the holder.
    Operator(String),
}

impl ReleaseBy {
    fn actor(&self) -> Actor {
        match self {
            ReleaseBy::Holder(worker) => Actor::agent(worker.clone()),
            ReleaseBy::Operator(name) => Actor::human(name.clone()),
        }
    }
}

/// What expiry did (or, in a dry run, would do) with one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpireDecision {
    /// Back to `ready` with one more retry on the clock.
    Requeued,
    /// Out of retries; routed to `needs_human`.
    Escalated,
    /// Claim expired but the ticket was not `in_progress`; ticket untouched.
    Skipped,
    /// The lease had been renewed or ended by the time it was examined.
    Superseded,
}

impl ExpireDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpireDecision::Requeued => "requeued",
            ExpireDecision::Escalated => "escalated",
            ExpireDecision::Skipped => "skipped",
            ExpireDecision::Superseded => "superseded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpireOutcome {
    pub ticket_id: TicketId,
    pub claim_id: ClaimId,
    pub worker_id: String,
    pub decision: Option<ExpireDecision>,
    pub error: Option<String>,
}

/// Result of one expiry pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpireReport {
    pub dry_run: bool,
    pub examined: usize,
    pub requeued: usize,
    pub escalated: usize,
    pub skipped: usize,
    pub superseded: usize,
    pub errors: usize,
    /// The pass stopped early on request.
    pub cancelled: bool,
    pub outcomes: Vec<ExpireOutcome>,
}

impl ExpireReport {
    /// Leases that were (or would be) marked expired.
    pub fn expired(&self) -> usize {
        self.requeued + self.escalated + self.skipped
    }

    fn count(&mut self, decision: ExpireDecision) {
        match decision {
            ExpireDecision::Requeued => self.requeued += 1,
            ExpireDecision::Escalated => self.escalated += 1,
            ExpireDecision::Skipped => self.skipped += 1,
            ExpireDecision::Superseded => self.superseded += 1,
        }
    }
}

impl<S: TicketStore> Engine<S> {
    /// Claim a `ready` ticket for `worker`.
    ///
    /// Fails with `Conflict` if someone else holds an unexpired lease.
    /// A lapsed lease the sweeper has not reached yet is expired first.
    pub fn claim(&self, id: &TicketId, worker: &str, lease: Option<Duration>) -> Result<Claim> {
        let span = op_span("claim", id);
        let _enter = span.enter();
        check_worker(worker)?;
        let lease = self.lease(lease)?;
        let now = self.now();

        let result = self.run(|tx, journal| {
            let ticket = tx.get_ticket(id)?;
            claim_in(tx, ticket, worker, lease, now, journal)
        });
        record_claim_attempt(result.as_ref().err().map(Error::kind));
        result
    }

    /// Claim the first unclaimed `ready` ticket in queue order.
    pub fn claim_next(
        &self,
        project: Option<&str>,
        worker: &str,
        lease: Option<Duration>,
    ) -> Result<Option<Claim>> {
        check_worker(worker)?;
        let lease = self.lease(lease)?;
        let now = self.now();

        let result = self.run(|tx, journal| {
            let mut filter = TicketFilter::default().status(Status::Ready);
            if let Some(project) = project {
                filter = filter.project(project);
            }
            for ticket in tx.list_tickets(&filter)? {
                if tx.active_claim(&ticket.id)?.is_some() {
                    continue;
                }
                return claim_in(tx, ticket, worker, lease, now, journal).map(Some);
            }
            Ok(None)
        });
        match &result {
            Ok(Some(claim)) => {
                info!(ticket = %claim.ticket_id, worker, "claimed next ticket");
                record_claim_attempt(None);
            }
            Ok(None) => {}
            Err(e) => record_claim_attempt(Some(e.kind())),
        }
        result
    }

    /// Extend the holder's lease to `now + lease`.
    pub fn renew(&self, id: &TicketId, worker: &str, lease: Option<Duration>) -> Result<Claim> {
        let span = op_span("renew", id);
        let _enter = span.enter();
        let lease = self.lease(lease)?;
        let now = self.now();

        self.run(|tx, journal| {
            tx.get_ticket(id)?;
            let mut claim = require_active(tx, id)?;
            check_holder(&claim, worker)?;
            if claim.is_expired_at(now) {
                return Err(Error::LeaseExpired {
                    ticket: id.clone(),
                    expired_at: claim.expires_at,
                });
            }
            claim.expires_at = now + lease;
            tx.update_claim(&claim)?;
            journal.note(
                id,
                Action::Renewed,
                &Actor::agent(worker),
                now,
                Some(json!({ "claim_id": claim.id, "expires_at": claim.expires_at })),
            );
            Ok(claim)
        })
    }

    /// Give a claimed ticket back to the queue. Does not touch `retry_count`.
    pub fn release(&self, id: &TicketId, by: &ReleaseBy, reason: Option<&str>) -> Result<Ticket> {
        let span = op_span("release", id);
        let _enter = span.enter();
        let now = self.now();

        self.run(|tx, journal| {
            let mut ticket = tx.get_ticket(id)?;
            apply(&mut ticket, Event::Release, now, journal)?;
            let mut claim = require_active(tx, id)?;
            if let ReleaseBy::Holder(worker) = by {
                check_holder(&claim, worker)?;
            }
            claim.end(ClaimStatus::Released, now, reason.map(str::to_string))?;
            tx.update_claim(&claim)?;
            settle_ready(tx, &mut ticket, now, journal)?;
            tx.update_ticket(&ticket)?;
            journal.note(
                id,
                Action::Released,
                &by.actor(),
                now,
                Some(json!({ "claim_id": claim.id, "reason": reason })),
            );
            Ok(ticket)
        })
    }

    /// Expire the lapsed lease on one ticket.
    pub fn expire_one(&self, id: &TicketId) -> Result<ExpireDecision> {
        let span = op_span("expire", id);
        let _enter = span.enter();
        let now = self.now();

        let decision = self.run(|tx, journal| {
            tx.get_ticket(id)?;
            let claim = require_active(tx, id)?;
            if !claim.is_expired_at(now) {
                return Err(Error::InvalidArgs(format!(
                    "claim on {id} has not expired (expires at {})",
                    claim.expires_at
                )));
            }
            expire_in(tx, claim, now, false, journal)
        })?;
        metrics::claims_expired().add(1, &[KeyValue::new("outcome", decision.as_str())]);
        Ok(decision)
    }

    /// Expire every lapsed lease. Each lease is its own transaction; a
    /// failure on one is recorded and the pass moves on.
    pub fn expire_all(&self, dry_run: bool) -> Result<ExpireReport> {
        self.expire_all_until(dry_run, &AtomicBool::new(false))
    }

    /// [`Engine::expire_all`], checking `cancel` between leases.
    pub fn expire_all_until(&self, dry_run: bool, cancel: &AtomicBool) -> Result<ExpireReport> {
        let started = Instant::now();
        let now = self.now();
        let candidates = self.store.transaction(|tx| tx.expired_claims(now))?;

        let mut report = ExpireReport {
            dry_run,
            ..Default::default()
        };
        for claim in candidates {
            if cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                break;
            }
            report.examined += 1;
            let mut outcome = ExpireOutcome {
                ticket_id: claim.ticket_id.clone(),
                claim_id: claim.id,
                worker_id: claim.worker_id.clone(),
                decision: None,
                error: None,
            };
            match self.run(|tx, journal| expire_in(tx, claim, now, dry_run, journal)) {
                Ok(decision) => {
                    report.count(decision);
                    if !dry_run && decision != ExpireDecision::Superseded {
                        metrics::claims_expired()
                            .add(1, &[KeyValue::new("outcome", decision.as_str())]);
                    }
                    outcome.decision = Some(decision);
                }
                Err(e) => {
                    warn!(ticket = %outcome.ticket_id, error = %e, "failed to expire claim");
                    report.errors += 1;
                    outcome.error = Some(e.to_string());
                }
            }
            report.outcomes.push(outcome);
        }

        metrics::sweep_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("dry_run", dry_run)],
        );
        info!(
            dry_run,
            examined = report.examined,
            requeued = report.requeued,
            escalated = report.escalated,
            skipped = report.skipped,
            errors = report.errors,
            "expiry pass finished"
        );
        Ok(report)
    }

    fn lease(&self, lease: Option<Duration>) -> Result<Duration> {
        let lease = lease.unwrap_or(self.config.default_lease);
        let secs = lease.num_seconds();
        if !(MIN_LEASE_SECONDS..=MAX_LEASE_SECONDS).contains(&secs) {
            return Err(Error::InvalidArgs(format!(
                "lease must be between {MIN_LEASE_SECONDS}s and {MAX_LEASE_SECONDS}s, got {secs}s"
            )));
        }
        Ok(lease)
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies
// ---------------------------------------------------------------------------

fn claim_in(
    tx: &mut dyn StoreTx,
    mut ticket: Ticket,
    worker: &str,
    lease: Duration,
    now: DateTime<Utc>,
    journal: &mut Journal,
) -> Result<Claim> {
    if let Some(active) = tx.active_claim(&ticket.id)? {
        if !active.is_expired_at(now) {
            return Err(Error::Conflict(format!(
                "ticket {} is already claimed by {}",
                ticket.id, active.worker_id
            )));
        }
        expire_in(tx, active, now, false, journal)?;
        ticket = tx.get_ticket(&ticket.id)?;
    }

    apply(&mut ticket, Event::Claim, now, journal)?;
    let claim = Claim {
        id: ClaimId::new(),
        ticket_id: ticket.id.clone(),
        worker_id: worker.to_string(),
        claimed_at: now,
        expires_at: now + lease,
        status: ClaimStatus::Active,
        ended_at: None,
        reason: None,
    };
    tx.insert_claim(&claim)?;
    tx.update_ticket(&ticket)?;
    journal.note(
        &ticket.id,
        Action::Claimed,
        &Actor::agent(worker),
        now,
        Some(json!({ "claim_id": claim.id, "expires_at": claim.expires_at })),
    );
    Ok(claim)
}

/// Decide and (unless `dry_run`) apply expiry for one lease. Re-reads the
/// claim so a lease renewed since it was listed is left alone.
fn expire_in(
    tx: &mut dyn StoreTx,
    claim: Claim,
    now: DateTime<Utc>,
    dry_run: bool,
    journal: &mut Journal,
) -> Result<ExpireDecision> {
    let mut claim = tx.get_claim(claim.id)?;
    if !claim.is_expired_at(now) {
        return Ok(ExpireDecision::Superseded);
    }
    let mut ticket = tx.get_ticket(&claim.ticket_id)?;
    let decision = if ticket.status != Status::InProgress {
        ExpireDecision::Skipped
    } else if ticket.retry_count.saturating_add(1) >= ticket.max_retries {
        ExpireDecision::Escalated
    } else {
        ExpireDecision::Requeued
    };
    if dry_run {
        return Ok(decision);
    }

    claim.end(ClaimStatus::Expired, now, Some("lease expired".into()))?;
    tx.update_claim(&claim)?;

    match decision {
        ExpireDecision::Requeued => {
            ticket.retry_count += 1;
            apply(&mut ticket, Event::Expire, now, journal)?;
            settle_ready(tx, &mut ticket, now, journal)?;
            tx.update_ticket(&ticket)?;
        }
        ExpireDecision::Escalated => {
            ticket.retry_count += 1;
            let from = apply(&mut ticket, Event::Flag, now, journal)?;
            ticket.flagged_from = Some(from);
            ticket.human_flag_reason = Some(MAX_RETRIES_EXCEEDED.to_string());
            tx.update_ticket(&ticket)?;
        }
        ExpireDecision::Skipped | ExpireDecision::Superseded => {}
    }

    journal.note(
        &ticket.id,
        Action::Expired,
        &Actor::System,
        now,
        Some(json!({
            "claim_id": claim.id,
            "worker_id": claim.worker_id,
            "retry_count": ticket.retry_count,
            "status": ticket.status,
        })),
    );
    if decision == ExpireDecision::Escalated {
        journal.note(
            &ticket.id,
            Action::Escalated,
            &Actor::System,
            now,
            Some(json!({
                "reason": MAX_RETRIES_EXCEEDED,
                "retry_count": ticket.retry_count,
                "max_retries": ticket.max_retries,
            })),
        );
    }
    Ok(decision)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn require_active(tx: &mut dyn StoreTx, id: &TicketId) -> Result<Claim> {
    tx.active_claim(id)?
        .ok_or_else(|| Error::NotFound(format!("active claim on {id}")))
}

pub(crate) fn check_holder(claim: &Claim, worker: &str) -> Result<()> {
    if claim.worker_id != worker {
        return Err(Error::NotHolder {
            ticket: claim.ticket_id.clone(),
            holder: claim.worker_id.clone(),
            requester: worker.to_string(),
        });
    }
    Ok(())
}

fn check_worker(worker: &str) -> Result<()> {
    if worker.trim().is_empty() {
        return Err(Error::InvalidArgs("worker id must not be empty".into()));
    }
    Ok(())
}

fn record_claim_attempt(error: Option<ErrorKind>) {
    let label = match error {
        None => "ok",
        Some(ErrorKind::ConcurrentConflict) => "conflict",
        Some(ErrorKind::StateError | ErrorKind::NotFound | ErrorKind::InvalidArgs) => "rejected",
        Some(_) => "error",
    };
    metrics::claim_attempts().add(1, &[KeyValue::new("result", label)]);
}
