//! Periodic expiry sweep.
//!
//! Each tick runs one expiry pass (and optionally a resolve pass) on the
//! blocking pool. Shutdown wakes the loop and also raises the cancel flag,
//! so a pass in flight stops between leases.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use super::{Engine, ExpireReport};
use crate::error::{Error, Result};
use crate::store::TicketStore;

/// Configuration for the sweeper.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Also re-check blocked tickets on every pass.
    pub resolve: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            resolve: false,
        }
    }
}

pub struct Sweeper<S> {
    engine: Arc<Engine<S>>,
    config: SweepConfig,
    shutdown: Arc<Notify>,
    cancel: Arc<AtomicBool>,
}

impl<S> Clone for Sweeper<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            cancel: Arc::clone(&self.cancel),
        }
    }
}

impl<S: TicketStore + 'static> Sweeper<S> {
    pub fn new(engine: Arc<Engine<S>>, config: SweepConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop the loop and cancel any pass in flight.
    pub fn shutdown(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.shutdown.notify_one();
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(interval_secs = self.config.interval.as_secs(), "sweeper started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("sweeper shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            if let Err(e) = self.sweep_once().await {
                error!("sweep failed: {e}");
            }
        }
    }

    /// Run one pass now.
    pub async fn sweep_once(&self) -> Result<ExpireReport> {
        let engine = Arc::clone(&self.engine);
        let cancel = Arc::clone(&self.cancel);
        let resolve = self.config.resolve;

        tokio::task::spawn_blocking(move || {
            let report = engine.expire_all_until(false, &cancel)?;
            if resolve && !cancel.load(Ordering::Relaxed) {
                engine.resolve_all()?;
            }
            Ok(report)
        })
        .await
        .map_err(|e| Error::Internal(format!("sweep task failed: {e}")))?
    }
}
