//! Ledger data model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capital accounting for one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyAllocation {
    pub strategy_id: String,
    /// Configured fraction of total capital (0.0-1.0)
    #[serde(with = "rust_decimal::serde::str")]
    pub share: Decimal,
    /// Capital deployed in the open position
    #[serde(with = "rust_decimal::serde::str")]
    pub committed_capital: Decimal,
    /// Capital reserved for orders that have not filled yet
    #[serde(with = "rust_decimal::serde::str")]
    pub open_orders: Decimal,
    /// Derived: round(total capital * share)
    #[serde(with = "rust_decimal::serde::str")]
    pub strategy_budget: Decimal,
    /// Derived: capital the strategy may still reserve
    #[serde(with = "rust_decimal::serde::str")]
    pub headroom: Decimal,
}

impl StrategyAllocation {
    /// Create a row from configuration; derived fields are filled by reconciliation.
    pub fn new(strategy_id: impl Into<String>, share: Decimal) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            share,
            committed_capital: Decimal::ZERO,
            open_orders: Decimal::ZERO,
            strategy_budget: Decimal::ZERO,
            headroom: Decimal::ZERO,
        }
    }

    pub fn with_exposure(mut self, committed_capital: Decimal, open_orders: Decimal) -> Self {
        self.committed_capital = committed_capital;
        self.open_orders = open_orders;
        self
    }

    /// Committed plus reserved capital.
    pub fn exposure(&self) -> Decimal {
        self.committed_capital + self.open_orders
    }
}

/// The authoritative ledger state: every strategy row plus the last observed balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub strategies: BTreeMap<String, StrategyAllocation>,
    /// Liquid balance last reported by the capital source
    #[serde(with = "rust_decimal::serde::str")]
    pub external_balance: Decimal,
    /// Incremented on every committed write
    pub version: u64,
}

impl LedgerSnapshot {
    pub fn new(strategies: Vec<StrategyAllocation>, external_balance: Decimal) -> Self {
        Self {
            strategies: strategies
                .into_iter()
                .map(|s| (s.strategy_id.clone(), s))
                .collect(),
            external_balance,
            version: 0,
        }
    }

    pub fn strategy(&self, strategy_id: &str) -> Option<&StrategyAllocation> {
        self.strategies.get(strategy_id)
    }

    pub fn strategy_mut(&mut self, strategy_id: &str) -> Option<&mut StrategyAllocation> {
        self.strategies.get_mut(strategy_id)
    }

    /// Ledger-wide aggregates. Always recomputed, never stored.
    pub fn totals(&self) -> LedgerTotals {
        let total_committed: Decimal = self
            .strategies
            .values()
            .map(|s| s.committed_capital)
            .sum();
        let total_open: Decimal = self.strategies.values().map(|s| s.open_orders).sum();

        LedgerTotals {
            total_committed,
            total_open,
            total_capital: self.external_balance + total_committed,
            available_capital: self.external_balance - total_open,
        }
    }
}

/// Aggregates derived from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    #[serde(with = "rust_decimal::serde::str")]
    pub total_committed: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_open: Decimal,
    /// external balance + total committed
    #[serde(with = "rust_decimal::serde::str")]
    pub total_capital: Decimal,
    /// external balance - total open
    #[serde(with = "rust_decimal::serde::str")]
    pub available_capital: Decimal,
}

/// Read-only view returned by `CapitalLedger::snapshot`.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerView {
    pub strategies: Vec<StrategyAllocation>,
    pub totals: LedgerTotals,
    #[serde(with = "rust_decimal::serde::str")]
    pub external_balance: Decimal,
    pub version: u64,
    /// Changes not yet flushed to the durable store
    pub dirty: bool,
    /// External balance needs a refresh
    pub stale: bool,
    pub halted: bool,
    pub observed_at: DateTime<Utc>,
}

impl LedgerView {
    pub fn strategy(&self, strategy_id: &str) -> Option<&StrategyAllocation> {
        self.strategies.iter().find(|s| s.strategy_id == strategy_id)
    }
}

/// Outcome of a reservation request.
#[derive(Debug, Clone)]
pub struct ReserveDecision {
    pub approved: bool,
    /// Total capital now held for the strategy (its open orders)
    pub granted_amount: Option<Decimal>,
    pub reason: Option<String>,
    pub snapshot: Option<LedgerSnapshot>,
}

impl ReserveDecision {
    pub fn approved(granted_amount: Decimal, snapshot: LedgerSnapshot) -> Self {
        Self {
            approved: true,
            granted_amount: Some(granted_amount),
            reason: None,
            snapshot: Some(snapshot),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            granted_amount: None,
            reason: Some(reason.into()),
            snapshot: None,
        }
    }
}

/// Acknowledgement of an order lifecycle mutation.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub snapshot: LedgerSnapshot,
}

/// Per-strategy row loaded from the durable store at bootstrap.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfigRow {
    pub strategy_id: String,
    pub share: Decimal,
    pub committed_capital: Decimal,
    pub open_orders: Decimal,
}

impl From<StrategyConfigRow> for StrategyAllocation {
    fn from(row: StrategyConfigRow) -> Self {
        StrategyAllocation::new(row.strategy_id, row.share)
            .with_exposure(row.committed_capital, row.open_orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_totals_follow_definitions() {
        let snapshot = LedgerSnapshot::new(
            vec![
                StrategyAllocation::new("a", dec!(0.5)).with_exposure(dec!(3000), dec!(500)),
                StrategyAllocation::new("b", dec!(0.5)).with_exposure(dec!(1000), dec!(0)),
            ],
            dec!(6000),
        );

        let totals = snapshot.totals();
        assert_eq!(totals.total_committed, dec!(4000));
        assert_eq!(totals.total_open, dec!(500));
        assert_eq!(totals.total_capital, dec!(10000));
        assert_eq!(totals.available_capital, dec!(5500));
    }

    #[test]
    fn test_config_row_conversion() {
        let row = StrategyConfigRow {
            strategy_id: "mean-revert".to_string(),
            share: dec!(0.25),
            committed_capital: dec!(100),
            open_orders: dec!(20),
        };
        let alloc: StrategyAllocation = row.into();
        assert_eq!(alloc.strategy_id, "mean-revert");
        assert_eq!(alloc.exposure(), dec!(120));
        assert_eq!(alloc.headroom, Decimal::ZERO);
    }

    #[test]
    fn test_rejected_decision_has_no_grant() {
        let decision = ReserveDecision::rejected("budget exhausted");
        assert!(!decision.approved);
        assert!(decision.granted_amount.is_none());
        assert_eq!(decision.reason.as_deref(), Some("budget exhausted"));
    }
}
