//! SQLite persistence for the capital ledger.
//!
//! Persists ledger state to survive restarts:
//! - Per-strategy configuration (share) and exposure (committed, open)
//! - Last observed external balance and snapshot version

use crate::ledger::{LedgerSnapshot, StrategyAllocation, StrategyConfigRow};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Durable home of strategy configuration and flushed snapshots.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Static configuration plus last flushed exposure, one row per strategy.
    async fn load_strategy_config(&self) -> Result<Vec<StrategyConfigRow>>;

    /// Idempotent full upsert of a snapshot.
    async fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()>;
}

/// Snapshot as last flushed, for offline inspection.
#[derive(Debug, Clone)]
pub struct PersistedLedger {
    pub snapshot: LedgerSnapshot,
    pub saved_at: DateTime<Utc>,
}

/// SQLite-backed durable store.
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

fn parse_decimal(raw: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl SqliteLedgerStore {
    /// Open the database, initializing the schema if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Ledger store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("ledger database connection poisoned"))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            -- One row per configured strategy
            CREATE TABLE IF NOT EXISTS strategy_allocations (
                strategy_id TEXT PRIMARY KEY,
                share TEXT NOT NULL,
                committed_capital TEXT NOT NULL DEFAULT '0',
                open_orders TEXT NOT NULL DEFAULT '0',
                strategy_budget TEXT NOT NULL DEFAULT '0',
                headroom TEXT NOT NULL DEFAULT '0',
                updated_at TEXT NOT NULL
            );

            -- Ledger-wide state (singleton row)
            CREATE TABLE IF NOT EXISTS ledger_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                external_balance TEXT NOT NULL,
                version INTEGER NOT NULL,
                saved_at TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Add a strategy or change its share. Exposure of an existing row is kept.
    pub fn configure_strategy(&self, strategy_id: &str, share: Decimal) -> Result<()> {
        anyhow::ensure!(
            share >= Decimal::ZERO && share <= Decimal::ONE,
            "share must be between 0 and 1"
        );

        self.conn()?.execute(
            r#"
            INSERT INTO strategy_allocations (strategy_id, share, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(strategy_id) DO UPDATE SET
                share = ?2,
                updated_at = ?3
            "#,
            params![strategy_id, share.to_string(), Utc::now().to_rfc3339()],
        )?;

        info!(%strategy_id, %share, "Strategy configured");
        Ok(())
    }

    fn load_rows(&self) -> Result<Vec<StrategyAllocation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT strategy_id, share, committed_capital, open_orders, strategy_budget, headroom
            FROM strategy_allocations
            ORDER BY strategy_id
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(StrategyAllocation {
                    strategy_id: row.get(0)?,
                    share: parse_decimal(&row.get::<_, String>(1)?)?,
                    committed_capital: parse_decimal(&row.get::<_, String>(2)?)?,
                    open_orders: parse_decimal(&row.get::<_, String>(3)?)?,
                    strategy_budget: parse_decimal(&row.get::<_, String>(4)?)?,
                    headroom: parse_decimal(&row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read strategy allocations")?;

        Ok(rows)
    }

    /// Load the last flushed snapshot, if any flush has happened.
    pub fn load_snapshot(&self) -> Result<Option<PersistedLedger>> {
        let state: Option<(String, u64, String)> = self
            .conn()?
            .query_row(
                "SELECT external_balance, version, saved_at FROM ledger_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((balance, version, saved_at)) = state else {
            return Ok(None);
        };

        let mut snapshot = LedgerSnapshot::new(
            self.load_rows()?,
            Decimal::from_str(&balance).context("Corrupt external balance")?,
        );
        snapshot.version = version;

        Ok(Some(PersistedLedger {
            snapshot,
            saved_at: DateTime::parse_from_rfc3339(&saved_at)
                .map(|dt| dt.with_timezone(&Utc))
                .context("Corrupt saved_at timestamp")?,
        }))
    }

    fn write_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            r#"
            INSERT INTO ledger_state (id, external_balance, version, saved_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                external_balance = ?1,
                version = ?2,
                saved_at = ?3
            "#,
            params![snapshot.external_balance.to_string(), snapshot.version, now],
        )?;

        // Shares belong to `configure_strategy`; a flush never overwrites them.
        for row in snapshot.strategies.values() {
            tx.execute(
                r#"
                INSERT INTO strategy_allocations (strategy_id, share, committed_capital,
                                                  open_orders, strategy_budget, headroom, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(strategy_id) DO UPDATE SET
                    committed_capital = ?3,
                    open_orders = ?4,
                    strategy_budget = ?5,
                    headroom = ?6,
                    updated_at = ?7
                "#,
                params![
                    row.strategy_id,
                    row.share.to_string(),
                    row.committed_capital.to_string(),
                    row.open_orders.to_string(),
                    row.strategy_budget.to_string(),
                    row.headroom.to_string(),
                    now,
                ],
            )?;
        }

        tx.commit()?;

        debug!(
            version = snapshot.version,
            strategies = snapshot.strategies.len(),
            "Snapshot saved to database"
        );
        Ok(())
    }
}

#[async_trait]
impl DurableStore for SqliteLedgerStore {
    async fn load_strategy_config(&self) -> Result<Vec<StrategyConfigRow>> {
        Ok(self
            .load_rows()?
            .into_iter()
            .map(|row| StrategyConfigRow {
                strategy_id: row.strategy_id,
                share: row.share,
                committed_capital: row.committed_capital,
                open_orders: row.open_orders,
            })
            .collect())
    }

    async fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        self.write_snapshot(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot() -> LedgerSnapshot {
        let mut snapshot = LedgerSnapshot::new(
            vec![
                StrategyAllocation::new("alpha", dec!(0.6)).with_exposure(dec!(1500), dec!(250)),
                StrategyAllocation::new("beta", dec!(0.4)),
            ],
            dec!(8500),
        );
        snapshot.version = 7;
        snapshot
    }

    #[test]
    fn test_save_and_load_snapshot() {
        let store = SqliteLedgerStore::new(":memory:").unwrap();
        tokio_test::block_on(store.save_snapshot(&snapshot())).unwrap();

        let loaded = store.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded.snapshot.version, 7);
        assert_eq!(loaded.snapshot.external_balance, dec!(8500));
        assert_eq!(loaded.snapshot.strategies.len(), 2);
        assert_eq!(
            loaded.snapshot.strategy("alpha").unwrap().committed_capital,
            dec!(1500)
        );
    }

    #[test]
    fn test_save_is_idempotent_upsert() {
        let store = SqliteLedgerStore::new(":memory:").unwrap();
        let mut snap = snapshot();
        tokio_test::block_on(store.save_snapshot(&snap)).unwrap();
        tokio_test::block_on(store.save_snapshot(&snap)).unwrap();

        snap.strategy_mut("alpha").unwrap().open_orders = Decimal::ZERO;
        tokio_test::block_on(store.save_snapshot(&snap)).unwrap();

        let rows = tokio_test::block_on(store.load_strategy_config()).unwrap();
        assert_eq!(rows.len(), 2);
        let alpha = rows.iter().find(|r| r.strategy_id == "alpha").unwrap();
        assert_eq!(alpha.open_orders, Decimal::ZERO);
        assert_eq!(alpha.committed_capital, dec!(1500));
    }

    #[test]
    fn test_configure_strategy_keeps_exposure() {
        let store = SqliteLedgerStore::new(":memory:").unwrap();
        tokio_test::block_on(store.save_snapshot(&snapshot())).unwrap();

        store.configure_strategy("alpha", dec!(0.5)).unwrap();
        store.configure_strategy("gamma", dec!(0.1)).unwrap();

        let rows = tokio_test::block_on(store.load_strategy_config()).unwrap();
        let alpha = rows.iter().find(|r| r.strategy_id == "alpha").unwrap();
        let gamma = rows.iter().find(|r| r.strategy_id == "gamma").unwrap();
        assert_eq!(alpha.share, dec!(0.5));
        assert_eq!(alpha.committed_capital, dec!(1500));
        assert_eq!(gamma.committed_capital, Decimal::ZERO);
    }

    #[test]
    fn test_flush_does_not_revert_configured_share() {
        let store = SqliteLedgerStore::new(":memory:").unwrap();
        let snap = snapshot();
        tokio_test::block_on(store.save_snapshot(&snap)).unwrap();

        store.configure_strategy("alpha", dec!(0.2)).unwrap();
        // A running ledger still holds the old share in memory
        tokio_test::block_on(store.save_snapshot(&snap)).unwrap();

        let rows = tokio_test::block_on(store.load_strategy_config()).unwrap();
        let alpha = rows.iter().find(|r| r.strategy_id == "alpha").unwrap();
        assert_eq!(alpha.share, dec!(0.2));
        assert_eq!(alpha.committed_capital, dec!(1500));
    }

    #[test]
    fn test_configure_rejects_invalid_share() {
        let store = SqliteLedgerStore::new(":memory:").unwrap();
        assert!(store.configure_strategy("alpha", dec!(1.2)).is_err());
        assert!(store.configure_strategy("alpha", dec!(-0.1)).is_err());
    }

    #[test]
    fn test_empty_database_has_no_snapshot() {
        let store = SqliteLedgerStore::new(":memory:").unwrap();
        assert!(store.load_snapshot().unwrap().is_none());
        assert!(tokio_test::block_on(store.load_strategy_config())
            .unwrap()
            .is_empty());
    }
}
