//! # Capital Ledger
//!
//! Shared capital allocation ledger for multi-strategy trading on one
//! exchange account.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `error`: Caller-visible ledger faults
//! - `ledger`: Allocation engine, committed snapshot store, reservation lifecycle
//!   and reconciliation loops
//! - `source`: External balance readers (Binance futures, paper)
//! - `persistence`: SQLite-backed strategy configuration and snapshots
//! - `halt`: Trading halt escalation
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod error;
pub mod halt;
pub mod ledger;
pub mod persistence;
pub mod source;
pub mod utils;

pub use config::Config;
pub use error::{LedgerError, LedgerResult};
pub use ledger::CapitalLedger;
