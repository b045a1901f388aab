//! Sources of the trading account's liquid balance.
//!
//! The ledger polls a [`CapitalSource`] on every balance refresh, fill and
//! close. Implementations are read-only.
//!
//! ## Binance
//! Signed USDⓈ-M futures balance endpoint.
//!
//! ## Paper
//! In-process balance for paper trading and tests.

mod binance;
mod paper;

pub use binance::BinanceBalanceSource;
pub use paper::PaperBalanceSource;

use async_trait::async_trait;
use rust_decimal::Decimal;

/// Read-only view of the account's liquid balance.
///
/// A negative value is passed through unchanged: the ledger treats it as a
/// fatal data fault rather than clamping it here.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CapitalSource: Send + Sync {
    /// Current available balance.
    async fn available_balance(&self) -> anyhow::Result<Decimal>;
}
