//! Background reconciliation: balance refresh and durable flush on fixed timers.

use crate::config::LedgerConfig;
use crate::ledger::facade::{CapitalLedger, FlushOutcome, RefreshOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handles to the two reconciliation tasks.
pub struct ReconciliationLoops {
    refresh: JoinHandle<()>,
    flush: JoinHandle<()>,
}

impl ReconciliationLoops {
    /// Start both loops. They run until `shutdown` flips to `true` or its sender drops.
    pub fn spawn(
        ledger: Arc<CapitalLedger>,
        config: &LedgerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let refresh = tokio::spawn(refresh_loop(
            ledger.clone(),
            config.refresh_interval(),
            shutdown.clone(),
        ));
        let flush = tokio::spawn(flush_loop(ledger, config.flush_interval(), shutdown));

        info!(
            refresh_secs = config.refresh_interval_secs,
            flush_secs = config.flush_interval_secs,
            "Reconciliation loops started"
        );
        Self { refresh, flush }
    }

    /// Wait for both loops to exit.
    pub async fn join(self) {
        if let Err(e) = self.refresh.await {
            warn!(error = %e, "Balance refresh loop ended abnormally");
        }
        if let Err(e) = self.flush.await {
            warn!(error = %e, "Flush loop ended abnormally");
        }
    }
}

async fn refresh_loop(
    ledger: Arc<CapitalLedger>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match ledger.refresh_if_stale().await {
                    RefreshOutcome::Halted => {
                        info!("Trading halted; balance refresh loop stopping");
                        break;
                    }
                    outcome => debug!(?outcome, "Refresh tick"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Balance refresh loop stopped");
}

async fn flush_loop(
    ledger: Arc<CapitalLedger>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let FlushOutcome::Flushed { version } = ledger.flush_if_dirty().await {
                    debug!(version, "Flush tick");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Flush loop stopped");
}
