//! Pure reconciliation of derived ledger quantities.
//!
//! Every mutation and every reconciliation tick ends here: totals, budgets and
//! headroom are recomputed from scratch from the strategy rows and the external
//! balance, then the invariants are checked. Nothing in this module touches shared
//! state; committing the returned snapshot is the caller's job.

use crate::config::LedgerConfig;
use crate::error::{Invariant, LedgerError, LedgerResult};
use crate::ledger::types::{LedgerSnapshot, LedgerTotals, StrategyAllocation};
use crate::utils::decimal::{non_negative, round_half_up, with_tolerance};
use rust_decimal::Decimal;
use tracing::{debug, warn};

/// How strictly a reconciliation validates exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Reject anything that breaches the budget or global capital invariants.
    Strict,
    /// Recompute only. Used on paths that can only reduce exposure (close
    /// free-ups, cancelled reservations) and when adopting a balance as fact.
    Relaxed,
}

/// Recomputes budgets and headroom and validates ledger invariants.
#[derive(Debug, Clone)]
pub struct AllocationEngine {
    tolerance: Decimal,
    budget_precision: u32,
}

impl AllocationEngine {
    pub fn new(tolerance: Decimal, budget_precision: u32) -> Self {
        Self {
            tolerance,
            budget_precision,
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(config.tolerance, config.budget_precision)
    }

    pub fn tolerance(&self) -> Decimal {
        self.tolerance
    }

    /// Reconcile `snapshot` against a freshly observed balance.
    ///
    /// Returns the recomputed snapshot (same version) or the first fault found.
    /// The input is never modified, so a rejection leaves the ledger untouched.
    pub fn reconcile(
        &self,
        snapshot: &LedgerSnapshot,
        external_balance: Decimal,
        mode: ReconcileMode,
    ) -> LedgerResult<LedgerSnapshot> {
        if external_balance < Decimal::ZERO {
            return Err(LedgerError::FatalExternalFault {
                balance: external_balance,
            });
        }

        if let Some(row) = snapshot
            .strategies
            .values()
            .find(|s| s.committed_capital < Decimal::ZERO || s.open_orders < Decimal::ZERO)
        {
            return Err(LedgerError::MalformedSnapshot(format!(
                "{} has negative exposure (committed {}, open {})",
                row.strategy_id, row.committed_capital, row.open_orders
            )));
        }

        let mut next = snapshot.clone();
        next.external_balance = external_balance;

        // Committed values are assigned, never accumulated, so a row reset by a
        // free-up already carries its authoritative value into the sum.
        let totals = next.totals();
        let available = totals.available_capital;

        for row in next.strategies.values_mut() {
            row.strategy_budget =
                round_half_up(totals.total_capital * row.share, self.budget_precision);
            row.headroom = non_negative((row.strategy_budget - row.exposure()).min(available));
        }

        if mode == ReconcileMode::Strict {
            self.validate(&next)?;
        }

        debug!(
            balance = %external_balance,
            total_capital = %totals.total_capital,
            available = %available,
            ?mode,
            "Ledger reconciled"
        );

        Ok(next)
    }

    /// Reconcile a change to one strategy's exposure.
    ///
    /// Breaches already present elsewhere in `base` do not block the change. The
    /// budget invariant is checked for `strategy_id` only when its exposure grows,
    /// and global capital only when total exposure grows.
    pub fn reconcile_change(
        &self,
        base: &LedgerSnapshot,
        next: &LedgerSnapshot,
        external_balance: Decimal,
        strategy_id: &str,
    ) -> LedgerResult<LedgerSnapshot> {
        let reconciled = self.reconcile(next, external_balance, ReconcileMode::Relaxed)?;

        if let Some(row) = reconciled.strategy(strategy_id) {
            let before = base
                .strategy(strategy_id)
                .map(|r| r.exposure())
                .unwrap_or_default();
            if row.exposure() > before {
                self.check_budget(row)?;
            }
        }

        let before = base.totals();
        let after = reconciled.totals();
        if after.total_committed + after.total_open > before.total_committed + before.total_open {
            self.check_global(&after)?;
        }

        Ok(reconciled)
    }

    /// Check the per-strategy budget and global capital invariants.
    pub fn validate(&self, snapshot: &LedgerSnapshot) -> LedgerResult<()> {
        for row in snapshot.strategies.values() {
            self.check_budget(row)?;
        }
        self.check_global(&snapshot.totals())
    }

    fn check_budget(&self, row: &StrategyAllocation) -> LedgerResult<()> {
        let limit = with_tolerance(row.strategy_budget, self.tolerance);
        if row.exposure() > limit {
            warn!(
                strategy_id = %row.strategy_id,
                exposure = %row.exposure(),
                %limit,
                "Strategy budget invariant violated"
            );
            return Err(LedgerError::InvariantViolation {
                invariant: Invariant::StrategyBudget,
                scope: row.strategy_id.clone(),
                exposure: row.exposure(),
                limit,
            });
        }
        Ok(())
    }

    fn check_global(&self, totals: &LedgerTotals) -> LedgerResult<()> {
        let exposure = totals.total_committed + totals.total_open;
        if exposure > totals.total_capital {
            warn!(
                %exposure,
                total_capital = %totals.total_capital,
                "Global capital invariant violated"
            );
            return Err(LedgerError::InvariantViolation {
                invariant: Invariant::GlobalCapital,
                scope: "ledger".to_string(),
                exposure,
                limit: totals.total_capital,
            });
        }
        Ok(())
    }
}
