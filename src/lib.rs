//! # ticketq
//!
//! Ticket lifecycle engine for mixed human/agent work queues.
//!
//! Tickets move through a validated state machine, workers take
//! time-bounded leases on them, and closing a ticket unblocks its
//! dependents and completes its parent. Storage is pluggable: an
//! in-memory store for tests and a SQLite store for real use.

pub mod activity;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod state_machine;
pub mod store;
pub mod telemetry;

pub use error::{Error, ErrorKind, Result};
