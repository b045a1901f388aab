//! Escalation to the platform when the ledger can no longer trust its inputs.
//!
//! The ledger calls [`TradingController::halt_trading`] at most once per
//! process. The controller owns the platform-wide stop; the ledger only stops
//! accepting new exposure.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::error;

/// Why trading was halted.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HaltReason {
    pub timestamp: DateTime<Utc>,
    /// Operation that observed the fault
    pub operation: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub observed_balance: Decimal,
    pub message: String,
}

impl HaltReason {
    pub fn negative_balance(operation: impl Into<String>, observed_balance: Decimal) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            observed_balance,
            message: format!("capital source reported negative balance {observed_balance}"),
        }
    }
}

/// Platform component able to stop all trading. Fire-and-forget.
#[cfg_attr(test, mockall::automock)]
pub trait TradingController: Send + Sync {
    fn halt_trading(&self, reason: &HaltReason);
}

/// Controller that raises a structured alert and wakes anyone waiting on `halted()`.
#[derive(Default)]
pub struct AlertingController {
    halted: AtomicBool,
    notify: Notify,
}

impl AlertingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Resolve once trading has been halted.
    pub async fn halted(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_halted() {
                return;
            }
            notified.await;
        }
    }
}

impl TradingController for AlertingController {
    fn halt_trading(&self, reason: &HaltReason) {
        let json = serde_json::to_string(reason).unwrap_or_default();
        error!(target: "ledger_alert", "LEDGER_ALERT: {}", json);

        self.halted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_reason_serializes_balance_as_string() {
        let reason = HaltReason::negative_balance("refresh", dec!(-100));
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["observed_balance"], "-100");
        assert_eq!(json["operation"], "refresh");
    }

    #[tokio::test]
    async fn test_halted_wakes_waiter() {
        let controller = Arc::new(AlertingController::new());
        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.halted().await })
        };

        tokio::task::yield_now().await;
        controller.halt_trading(&HaltReason::negative_balance("test", dec!(-1)));

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(controller.is_halted());
    }

    #[tokio::test]
    async fn test_halted_returns_immediately_after_halt() {
        let controller = AlertingController::new();
        controller.halt_trading(&HaltReason::negative_balance("test", dec!(-1)));
        tokio::time::timeout(Duration::from_millis(100), controller.halted())
            .await
            .expect("already halted");
    }
}
