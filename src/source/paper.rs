//! Paper balance source for simulated trading.

use super::CapitalSource;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Balance held in memory. Fills and closes are simulated by setting it.
pub struct PaperBalanceSource {
    balance: RwLock<Decimal>,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl PaperBalanceSource {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            balance: RwLock::new(initial_balance),
            failing: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub async fn set_balance(&self, balance: Decimal) {
        *self.balance.write().await = balance;
        debug!(%balance, "Paper balance updated");
    }

    /// Apply a signed change, e.g. `-cost` when an order fills.
    pub async fn adjust(&self, delta: Decimal) {
        let mut balance = self.balance.write().await;
        *balance += delta;
        debug!(balance = %*balance, %delta, "Paper balance adjusted");
    }

    /// Make subsequent reads fail, simulating an unreachable account API.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of balance reads served or refused.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapitalSource for PaperBalanceSource {
    async fn available_balance(&self) -> Result<Decimal> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("paper balance source unavailable");
        }
        Ok(*self.balance.read().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_adjust_and_read() {
        let source = PaperBalanceSource::new(dec!(10000));
        source.adjust(dec!(-4750)).await;
        assert_eq!(source.available_balance().await.unwrap(), dec!(5250));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let source = PaperBalanceSource::new(dec!(10000));
        source.set_failing(true);
        assert!(source.available_balance().await.is_err());
        source.set_failing(false);
        assert!(source.available_balance().await.is_ok());
        assert_eq!(source.calls(), 2);
    }
}
