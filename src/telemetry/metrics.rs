//! Metric instrument factories for ticketq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider the instruments are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("ticketq")
}

/// Counter: tickets created.
/// Labels: `project`.
pub fn tickets_created() -> Counter<u64> {
    meter()
        .u64_counter("ticketq.tickets.created")
        .with_description("Number of tickets created")
        .build()
}

/// Counter: committed ticket state transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("ticketq.tickets.state_transitions")
        .with_description("Number of ticket state transitions")
        .build()
}

/// Counter: claim attempts.
/// Labels: `result` ("ok" | "conflict" | "rejected" | "error").
pub fn claim_attempts() -> Counter<u64> {
    meter()
        .u64_counter("ticketq.claims.attempts")
        .with_description("Number of claim attempts by result")
        .build()
}

/// Counter: leases processed by expiry.
/// Labels: `outcome` ("requeued" | "escalated" | "skipped").
pub fn claims_expired() -> Counter<u64> {
    meter()
        .u64_counter("ticketq.claims.expired")
        .with_description("Number of expired leases by outcome")
        .build()
}

/// Counter: blocked tickets released by dependency resolution.
pub fn tickets_unblocked() -> Counter<u64> {
    meter()
        .u64_counter("ticketq.tickets.unblocked")
        .with_description("Number of tickets unblocked")
        .build()
}

/// Histogram: expiry sweep duration in milliseconds.
/// Labels: `dry_run`.
pub fn sweep_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("ticketq.sweep.duration_ms")
        .with_description("Expiry sweep duration in milliseconds")
        .with_unit("ms")
        .build()
}
