//! Reservation lifecycle over the shared ledger.
//!
//! A strategy moves capital through four steps:
//! 1. `reserve` at signal time holds the strategy's entire headroom
//! 2. `insert_order` swaps that hold for the exact order amount
//! 3. `accept_order` turns the hold into committed capital on fill
//! 4. `free_up` releases committed capital when the position closes
//!
//! Every mutation runs under the store's single write permit and ends with a
//! reconciliation, so the invariants hold after each committed snapshot.

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::halt::{HaltReason, TradingController};
use crate::ledger::engine::{AllocationEngine, ReconcileMode};
use crate::ledger::store::{LedgerStore, LedgerWrite};
use crate::ledger::types::{
    LedgerSnapshot, LedgerView, OrderAck, ReserveDecision, StrategyAllocation, StrategyConfigRow,
};
use crate::persistence::DurableStore;
use crate::source::CapitalSource;
use anyhow::Context;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Transient fault and boundary-clamp counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct LedgerCounters {
    pub balance_refresh_failures: u64,
    /// Reset by the next successful flush
    pub consecutive_flush_failures: u64,
    pub total_flush_failures: u64,
    pub clamped_open_orders: u64,
    pub rejected_reservations: u64,
}

#[derive(Default)]
struct AtomicCounters {
    balance_refresh_failures: AtomicU64,
    consecutive_flush_failures: AtomicU64,
    total_flush_failures: AtomicU64,
    clamped_open_orders: AtomicU64,
    rejected_reservations: AtomicU64,
}

impl AtomicCounters {
    fn load(&self) -> LedgerCounters {
        LedgerCounters {
            balance_refresh_failures: self.balance_refresh_failures.load(Ordering::Relaxed),
            consecutive_flush_failures: self.consecutive_flush_failures.load(Ordering::Relaxed),
            total_flush_failures: self.total_flush_failures.load(Ordering::Relaxed),
            clamped_open_orders: self.clamped_open_orders.load(Ordering::Relaxed),
            rejected_reservations: self.rejected_reservations.load(Ordering::Relaxed),
        }
    }
}

/// Result of one balance-refresh tick.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Balance was not stale
    Skipped,
    Refreshed(Decimal),
    /// Balance adopted, but current exposure exceeds it; headroom is zero
    Overcommitted(Decimal),
    /// Capital source failed or timed out; still stale
    Failed,
    Halted,
}

/// Result of one flush tick.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    Clean,
    Flushed { version: u64 },
    Failed,
}

/// Validation a mutation must pass before it is committed.
#[derive(Debug, Clone, Copy)]
enum Check<'a> {
    /// Recompute only; the change cannot add exposure
    Relaxed,
    /// Reject if the change pushes this strategy or the ledger past its limit
    Change(&'a str),
}

/// The capital allocation ledger. One instance per process.
pub struct CapitalLedger {
    engine: AllocationEngine,
    store: LedgerStore,
    source: Arc<dyn CapitalSource>,
    durable: Arc<dyn DurableStore>,
    controller: Arc<dyn TradingController>,
    timeout: Duration,
    dirty: AtomicBool,
    stale: AtomicBool,
    halted: AtomicBool,
    counters: AtomicCounters,
}

impl CapitalLedger {
    /// Build the ledger from durable configuration and a first balance read.
    ///
    /// A missing balance is tolerated (the ledger starts at zero and stale);
    /// unreadable or malformed configuration is not.
    pub async fn bootstrap(
        config: &LedgerConfig,
        source: Arc<dyn CapitalSource>,
        durable: Arc<dyn DurableStore>,
        controller: Arc<dyn TradingController>,
    ) -> anyhow::Result<Self> {
        let timeout = config.collaborator_timeout();

        let rows = tokio::time::timeout(timeout, durable.load_strategy_config())
            .await
            .context("Timed out loading strategy configuration")?
            .context("Failed to load strategy configuration")?;
        validate_config(&rows)?;

        if rows.is_empty() {
            warn!("No strategies configured; every reservation will be rejected");
        }

        let strategies: Vec<StrategyAllocation> = rows.into_iter().map(Into::into).collect();
        let ledger = Self {
            engine: AllocationEngine::from_config(config),
            store: LedgerStore::new(LedgerSnapshot::new(strategies, Decimal::ZERO)),
            source,
            durable,
            controller,
            timeout,
            dirty: AtomicBool::new(true),
            stale: AtomicBool::new(true),
            halted: AtomicBool::new(false),
            counters: AtomicCounters::default(),
        };

        let txn = ledger.store.begin().await;
        let observed = ledger.fetch_balance("bootstrap").await;
        let balance = match observed {
            Some(balance) if balance < Decimal::ZERO => {
                ledger.escalate("bootstrap", balance);
                Decimal::ZERO
            }
            Some(balance) => balance,
            None => Decimal::ZERO,
        };

        // Persisted exposure already exists in the market; adopt it and report breaches.
        let initial = ledger
            .engine
            .reconcile(txn.current(), balance, ReconcileMode::Relaxed)?;
        if let Err(breach) = ledger.engine.validate(&initial) {
            warn!(%breach, "Ledger starts over-committed; reservations blocked until exposure drops");
        }
        let committed = txn.commit(initial).await;

        if matches!(observed, Some(b) if b >= Decimal::ZERO) {
            ledger.stale.store(false, Ordering::SeqCst);
        }

        let totals = committed.totals();
        info!(
            strategies = committed.strategies.len(),
            balance = %committed.external_balance,
            total_capital = %totals.total_capital,
            available = %totals.available_capital,
            stale = ledger.is_stale(),
            "Capital ledger bootstrapped"
        );

        Ok(ledger)
    }

    // ==================== Reservation lifecycle ====================

    /// Pre-trade check at signal time.
    ///
    /// Approves by holding the strategy's whole headroom, since the order size is
    /// unknown until submission. An estimated cost the strategy cannot cover
    /// cancels any speculative hold it already had.
    #[instrument(skip(self))]
    pub async fn reserve(
        &self,
        strategy_id: &str,
        estimated_cost: Option<Decimal>,
    ) -> LedgerResult<ReserveDecision> {
        self.ensure_active()?;
        if let Some(cost) = estimated_cost {
            check_amount("estimated_cost", cost)?;
        }

        let txn = self.store.begin().await;
        let current = txn.current();
        lookup(current, strategy_id)?;

        let fresh =
            self.engine
                .reconcile(current, current.external_balance, ReconcileMode::Relaxed)?;
        let row = lookup(&fresh, strategy_id)?;
        let coverable = row.open_orders + row.headroom;

        let insufficient = match estimated_cost {
            Some(cost) => cost > coverable,
            None => row.headroom.is_zero(),
        };

        if insufficient {
            let reason = match estimated_cost {
                Some(cost) => format!("estimated cost {cost} exceeds available {coverable}"),
                None => "strategy budget fully reserved or deployed".to_string(),
            };

            // Only a priced request the hold cannot cover cancels the hold; a
            // repeated signal leaves the in-flight reservation alone.
            if estimated_cost.is_some() && !row.open_orders.is_zero() {
                let mut next = fresh.clone();
                if let Some(row) = next.strategy_mut(strategy_id) {
                    row.open_orders = Decimal::ZERO;
                }
                self.commit(txn, next, fresh.external_balance, Check::Relaxed, "reserve")
                    .await?;
                self.mark_dirty();
            }

            self.counters
                .rejected_reservations
                .fetch_add(1, Ordering::Relaxed);
            info!(%strategy_id, %reason, "Reservation rejected");
            return Ok(ReserveDecision::rejected(reason));
        }

        let headroom = row.headroom;
        let mut next = fresh.clone();
        if let Some(row) = next.strategy_mut(strategy_id) {
            row.open_orders += headroom;
        }

        match self
            .commit(txn, next, fresh.external_balance, Check::Change(strategy_id), "reserve")
            .await
        {
            Ok(committed) => {
                self.mark_dirty();
                let granted = lookup(&committed, strategy_id)?.open_orders;
                info!(%strategy_id, %granted, added = %headroom, "Reservation approved");
                Ok(ReserveDecision::approved(granted, committed))
            }
            Err(violation @ LedgerError::InvariantViolation { .. }) => {
                self.counters
                    .rejected_reservations
                    .fetch_add(1, Ordering::Relaxed);
                Ok(ReserveDecision::rejected(violation.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the speculative hold with the exact amount of the submitted order.
    #[instrument(skip(self))]
    pub async fn insert_order(
        &self,
        strategy_id: &str,
        requested: Decimal,
        approved: Decimal,
    ) -> LedgerResult<OrderAck> {
        self.ensure_active()?;
        check_amount("requested", requested)?;
        check_amount("approved", approved)?;
        if approved > requested {
            warn!(%strategy_id, %requested, %approved, "Order approved above requested amount");
        }

        let txn = self.store.begin().await;
        let current = txn.current();
        let previous = lookup(current, strategy_id)?.open_orders;

        let mut next = current.clone();
        if let Some(row) = next.strategy_mut(strategy_id) {
            row.open_orders = approved;
        }
        let balance = current.external_balance;
        let snapshot = self
            .commit(txn, next, balance, Check::Change(strategy_id), "insert_order")
            .await?;
        self.mark_dirty();

        info!(%strategy_id, %previous, open_orders = %approved, "Order hold fixed");
        Ok(OrderAck { snapshot })
    }

    /// Record a fill: the position now uses `used`, and `approved` leaves the hold.
    ///
    /// One position per strategy, so committed capital is assigned, not added.
    #[instrument(skip(self))]
    pub async fn accept_order(
        &self,
        strategy_id: &str,
        approved: Decimal,
        used: Decimal,
    ) -> LedgerResult<OrderAck> {
        self.ensure_active()?;
        check_amount("approved", approved)?;
        check_amount("used", used)?;

        let txn = self.store.begin().await;
        lookup(txn.current(), strategy_id)?;

        // A fill moves the real balance; read it before booking.
        let balance = self
            .fetch_balance("accept_order")
            .await
            .unwrap_or(txn.current().external_balance);

        let mut next = txn.current().clone();
        if let Some(row) = next.strategy_mut(strategy_id) {
            let remaining = row.open_orders - approved;
            if remaining < Decimal::ZERO {
                warn!(
                    %strategy_id,
                    open_orders = %row.open_orders,
                    %approved,
                    "Fill exceeds held amount; clamping open orders at zero"
                );
                self.counters
                    .clamped_open_orders
                    .fetch_add(1, Ordering::Relaxed);
            }
            row.open_orders = remaining.max(Decimal::ZERO);
            row.committed_capital = used;
        }

        let result = self
            .commit(txn, next, balance, Check::Change(strategy_id), "accept_order")
            .await;
        // Settlement can lag the fill; refresh again on the next tick either way.
        self.stale.store(true, Ordering::SeqCst);
        let snapshot = result?;
        self.mark_dirty();

        info!(%strategy_id, committed = %used, %balance, "Fill accepted");
        Ok(OrderAck { snapshot })
    }

    /// Release capital when a position closes. Never rejected for exposure,
    /// and still available after a halt so closes keep being booked.
    #[instrument(skip(self))]
    pub async fn free_up(
        &self,
        strategy_id: &str,
        residual_committed: Decimal,
    ) -> LedgerResult<OrderAck> {
        check_amount("residual_committed", residual_committed)?;

        let txn = self.store.begin().await;
        lookup(txn.current(), strategy_id)?;
        let last_known = txn.current().external_balance;

        let balance = if self.is_halted() {
            last_known
        } else {
            match self.fetch_balance("free_up").await {
                Some(balance) if balance < Decimal::ZERO => {
                    self.escalate("free_up", balance);
                    last_known
                }
                Some(balance) => balance,
                None => last_known,
            }
        };

        let mut next = txn.current().clone();
        if let Some(row) = next.strategy_mut(strategy_id) {
            row.committed_capital = residual_committed;
        }
        let snapshot = self
            .commit(txn, next, balance, Check::Relaxed, "free_up")
            .await?;
        self.mark_dirty();
        self.stale.store(true, Ordering::SeqCst);

        info!(%strategy_id, residual = %residual_committed, %balance, "Capital freed");
        Ok(OrderAck { snapshot })
    }

    /// Latest committed state. Does not wait for in-flight mutations.
    pub async fn snapshot(&self) -> LedgerView {
        let snapshot = self.store.read().await;
        LedgerView {
            strategies: snapshot.strategies.values().cloned().collect(),
            totals: snapshot.totals(),
            external_balance: snapshot.external_balance,
            version: snapshot.version,
            dirty: self.is_dirty(),
            stale: self.is_stale(),
            halted: self.is_halted(),
            observed_at: Utc::now(),
        }
    }

    // ==================== Reconciliation ticks ====================

    /// Pull the external balance if it is stale and reconcile against it.
    pub async fn refresh_if_stale(&self) -> RefreshOutcome {
        if self.is_halted() {
            return RefreshOutcome::Halted;
        }
        if !self.is_stale() {
            return RefreshOutcome::Skipped;
        }

        let txn = self.store.begin().await;
        let Some(balance) = self.fetch_balance("refresh").await else {
            return RefreshOutcome::Failed;
        };

        let (next, outcome) =
            match self
                .engine
                .reconcile(txn.current(), balance, ReconcileMode::Strict)
            {
                Ok(next) => (next, RefreshOutcome::Refreshed(balance)),
                Err(LedgerError::InvariantViolation { .. }) => {
                    // The balance is a fact; adopt it so headroom collapses instead of
                    // lending against capital that is gone.
                    match self
                        .engine
                        .reconcile(txn.current(), balance, ReconcileMode::Relaxed)
                    {
                        Ok(next) => {
                            warn!(%balance, "Balance refresh left the ledger over-committed");
                            (next, RefreshOutcome::Overcommitted(balance))
                        }
                        Err(e) => {
                            error!(error = %e, "Relaxed reconciliation failed after refresh");
                            return RefreshOutcome::Failed;
                        }
                    }
                }
                Err(LedgerError::FatalExternalFault { balance }) => {
                    drop(txn);
                    self.escalate("refresh", balance);
                    return RefreshOutcome::Halted;
                }
                Err(e) => {
                    error!(error = %e, "Balance refresh rejected");
                    return RefreshOutcome::Failed;
                }
            };
        // Cleared while the permit is held, so a fill booked right after this
        // commit re-marks the balance stale.
        self.stale.store(false, Ordering::SeqCst);
        txn.commit(next).await;
        self.mark_dirty();
        debug!(?outcome, "Balance refreshed");
        outcome
    }

    /// Write the committed snapshot to the durable store if it changed.
    pub async fn flush_if_dirty(&self) -> FlushOutcome {
        // Cleared before reading so a mutation racing the save re-dirties the ledger.
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return FlushOutcome::Clean;
        }

        let snapshot = self.store.read().await;
        let saved = tokio::time::timeout(self.timeout, self.durable.save_snapshot(&snapshot))
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("save timed out after {:?}", self.timeout)));

        match saved {
            Ok(()) => {
                self.counters
                    .consecutive_flush_failures
                    .store(0, Ordering::Relaxed);
                debug!(version = snapshot.version, "Ledger flushed");
                FlushOutcome::Flushed {
                    version: snapshot.version,
                }
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                let consecutive = self
                    .counters
                    .consecutive_flush_failures
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                self.counters
                    .total_flush_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, consecutive, "Ledger flush failed; will retry");
                FlushOutcome::Failed
            }
        }
    }

    /// Flush regardless of the dirty flag, e.g. on shutdown.
    pub async fn flush_now(&self) -> FlushOutcome {
        self.mark_dirty();
        self.flush_if_dirty().await
    }

    // ==================== Flags ====================

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> LedgerCounters {
        self.counters.load()
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn ensure_active(&self) -> LedgerResult<()> {
        if self.is_halted() {
            return Err(LedgerError::Halted);
        }
        Ok(())
    }

    /// Read the balance with a bounded wait. Failures are transient: counted,
    /// logged and reported as `None`.
    async fn fetch_balance(&self, operation: &str) -> Option<Decimal> {
        let result = tokio::time::timeout(self.timeout, self.source.available_balance()).await;
        match result {
            Ok(Ok(balance)) => Some(balance),
            Ok(Err(e)) => {
                self.balance_unavailable(operation, &e.to_string());
                None
            }
            Err(_) => {
                self.balance_unavailable(operation, "timed out");
                None
            }
        }
    }

    fn balance_unavailable(&self, operation: &str, error: &str) {
        self.stale.store(true, Ordering::SeqCst);
        let failures = self
            .counters
            .balance_refresh_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        warn!(%operation, %error, failures, "Capital source unavailable");
    }

    /// Halt trading on the first fatal fault only.
    fn escalate(&self, operation: &str, balance: Decimal) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(%operation, %balance, "Negative external balance; halting trading");
        self.controller
            .halt_trading(&HaltReason::negative_balance(operation, balance));
    }

    /// Reconcile `next` against `balance` and publish it, or drop the write.
    async fn commit(
        &self,
        txn: LedgerWrite<'_>,
        next: LedgerSnapshot,
        balance: Decimal,
        check: Check<'_>,
        operation: &str,
    ) -> LedgerResult<LedgerSnapshot> {
        let reconciled = match check {
            Check::Relaxed => self.engine.reconcile(&next, balance, ReconcileMode::Relaxed),
            Check::Change(strategy_id) => {
                self.engine
                    .reconcile_change(txn.current(), &next, balance, strategy_id)
            }
        };

        match reconciled {
            Ok(reconciled) => Ok(txn.commit(reconciled).await),
            Err(LedgerError::FatalExternalFault { balance }) => {
                drop(txn);
                self.escalate(operation, balance);
                Err(LedgerError::FatalExternalFault { balance })
            }
            Err(e) => Err(e),
        }
    }
}

fn lookup<'a>(snapshot: &'a LedgerSnapshot, strategy_id: &str) -> LedgerResult<&'a StrategyAllocation> {
    snapshot
        .strategy(strategy_id)
        .ok_or_else(|| LedgerError::UnknownStrategy(strategy_id.to_string()))
}

fn check_amount(field: &'static str, value: Decimal) -> LedgerResult<()> {
    if value < Decimal::ZERO {
        return Err(LedgerError::InvalidAmount { field, value });
    }
    Ok(())
}

fn validate_config(rows: &[StrategyConfigRow]) -> LedgerResult<()> {
    for row in rows {
        if row.share < Decimal::ZERO || row.share > Decimal::ONE {
            return Err(LedgerError::MalformedSnapshot(format!(
                "{} share {} outside [0, 1]",
                row.strategy_id, row.share
            )));
        }
        if row.committed_capital < Decimal::ZERO || row.open_orders < Decimal::ZERO {
            return Err(LedgerError::MalformedSnapshot(format!(
                "{} has negative exposure",
                row.strategy_id
            )));
        }
    }

    let total_share: Decimal = rows.iter().map(|r| r.share).sum();
    if total_share > Decimal::ONE {
        return Err(LedgerError::MalformedSnapshot(format!(
            "strategy shares sum to {total_share}"
        )));
    }
    Ok(())
}
