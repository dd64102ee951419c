//! Ticket operation span helpers.

use tracing::Span;

use crate::model::{Status, TicketId};

/// Start a span for one engine operation on a ticket.
///
/// `ticket.status` is declared empty and filled in by
/// [`record_state_transition`].
pub fn op_span(op: &str, id: &TicketId) -> Span {
    tracing::info_span!(
        "ticket.op",
        "ticket.op" = op,
        "ticket.id" = %id,
        "ticket.status" = tracing::field::Empty,
    )
}

/// Record a committed transition on `span`.
pub fn record_state_transition(span: &Span, id: &TicketId, from: Status, to: Status) {
    span.record("ticket.status", to.as_str());
    span.in_scope(|| {
        tracing::info!(ticket = %id, from = from.as_str(), to = to.as_str(), "state_transition");
    });
}
