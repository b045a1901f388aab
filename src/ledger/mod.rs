//! Capital allocation ledger.
//!
//! Tracks, per strategy, capital deployed in positions and capital held by
//! pending orders, and derives how much each strategy may still reserve.

mod engine;
mod facade;
mod reconcile;
mod store;
mod types;

pub use engine::{AllocationEngine, ReconcileMode};
pub use facade::{CapitalLedger, FlushOutcome, LedgerCounters, RefreshOutcome};
pub use reconcile::ReconciliationLoops;
pub use store::{LedgerStore, LedgerWrite};
pub use types::{
    LedgerSnapshot, LedgerTotals, LedgerView, OrderAck, ReserveDecision, StrategyAllocation,
    StrategyConfigRow,
};
