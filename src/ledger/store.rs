//! In-memory home of the authoritative ledger snapshot.
//!
//! Writers go through [`LedgerStore::begin`], which hands out a single write
//! permit: a read-modify-write always starts from the latest committed snapshot
//! and no two writers interleave. Readers never wait for the permit; they see the
//! last committed snapshot.

use crate::ledger::types::LedgerSnapshot;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::trace;

pub struct LedgerStore {
    writer: Mutex<()>,
    committed: RwLock<Arc<LedgerSnapshot>>,
}

/// Exclusive write access to the ledger. Dropping it without `commit` discards
/// the pending change.
pub struct LedgerWrite<'a> {
    _permit: MutexGuard<'a, ()>,
    store: &'a LedgerStore,
    base: Arc<LedgerSnapshot>,
}

impl LedgerStore {
    pub fn new(initial: LedgerSnapshot) -> Self {
        Self {
            writer: Mutex::new(()),
            committed: RwLock::new(Arc::new(initial)),
        }
    }

    /// Latest committed snapshot.
    pub async fn read(&self) -> Arc<LedgerSnapshot> {
        self.committed.read().await.clone()
    }

    /// Wait for the write permit and load the latest committed snapshot.
    pub async fn begin(&self) -> LedgerWrite<'_> {
        let permit = self.writer.lock().await;
        let base = self.read().await;
        LedgerWrite {
            _permit: permit,
            store: self,
            base,
        }
    }
}

impl LedgerWrite<'_> {
    /// Snapshot the pending change starts from.
    pub fn current(&self) -> &LedgerSnapshot {
        &self.base
    }

    /// Publish `next` as the new committed snapshot in one write.
    pub async fn commit(self, mut next: LedgerSnapshot) -> LedgerSnapshot {
        next.version = self.base.version + 1;
        *self.store.committed.write().await = Arc::new(next.clone());
        trace!(version = next.version, "Ledger snapshot committed");
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::StrategyAllocation;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn store() -> LedgerStore {
        LedgerStore::new(LedgerSnapshot::new(
            vec![StrategyAllocation::new("a", Decimal::ONE)],
            dec!(100),
        ))
    }

    #[tokio::test]
    async fn test_commit_bumps_version() {
        let store = store();
        let txn = store.begin().await;
        let mut next = txn.current().clone();
        next.external_balance = dec!(200);
        let committed = txn.commit(next).await;

        assert_eq!(committed.version, 1);
        let read = store.read().await;
        assert_eq!(read.version, 1);
        assert_eq!(read.external_balance, dec!(200));
    }

    #[tokio::test]
    async fn test_dropped_write_changes_nothing() {
        let store = store();
        {
            let txn = store.begin().await;
            let _ = txn.current().clone();
        }
        assert_eq!(store.read().await.version, 0);
    }

    #[tokio::test]
    async fn test_readers_not_blocked_by_writer() {
        let store = store();
        let _txn = store.begin().await;

        let read = tokio::time::timeout(Duration::from_millis(100), store.read()).await;
        assert!(read.is_ok());
    }

    #[tokio::test]
    async fn test_writers_are_serialized() {
        let store = Arc::new(store());
        let mut handles = Vec::new();

        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let txn = store.begin().await;
                let mut next = txn.current().clone();
                tokio::task::yield_now().await;
                next.external_balance += Decimal::ONE;
                txn.commit(next).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let read = store.read().await;
        assert_eq!(read.external_balance, dec!(132));
        assert_eq!(read.version, 32);
    }
}
