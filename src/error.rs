//! Caller-visible ledger faults.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors returned by ledger operations.
///
/// Collaborator outages never show up here: they are retried by the
/// reconciliation loops and only surface through `LedgerCounters`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// The strategy id is not configured in the ledger.
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    /// An amount argument was negative.
    #[error("invalid amount for {field}: {value}")]
    InvalidAmount { field: &'static str, value: Decimal },

    /// Stored rows or configuration cannot form a valid ledger.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    /// Reconciling the mutation would breach a ledger invariant.
    #[error("invariant violation ({invariant}) for {scope}: exposure {exposure} exceeds limit {limit}")]
    InvariantViolation {
        invariant: Invariant,
        scope: String,
        exposure: Decimal,
        limit: Decimal,
    },

    /// The balance source reported a negative balance. Trading was halted.
    #[error("fatal external data fault: observed balance {balance}")]
    FatalExternalFault { balance: Decimal },

    /// Trading has been halted; the ledger accepts no new exposure.
    #[error("ledger halted, no new exposure accepted")]
    Halted,
}

/// Invariant named by an `InvariantViolation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invariant {
    /// Per strategy: committed + open <= budget * (1 + tolerance)
    StrategyBudget,
    /// Ledger-wide: total committed + total open <= total capital
    GlobalCapital,
}

impl std::fmt::Display for Invariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invariant::StrategyBudget => write!(f, "strategy budget"),
            Invariant::GlobalCapital => write!(f, "global capital"),
        }
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;
