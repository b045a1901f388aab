//! Configuration management for the capital ledger.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ledger invariants and reconciliation cadence
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Balance source credentials
    #[serde(default)]
    pub source: SourceConfig,
    /// Durable store location
    #[serde(default)]
    pub storage: StorageConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Slack allowed above a strategy budget before a mutation is rejected (0.0-1.0)
    /// 0.10 = committed + open may reach 110% of the budget
    #[serde(default = "default_tolerance")]
    pub tolerance: Decimal,
    /// Decimal places kept when rounding strategy budgets (0 = whole units)
    #[serde(default = "default_budget_precision")]
    pub budget_precision: u32,
    /// Seconds between balance refresh ticks
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Seconds between flush ticks
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// Upper bound for any single balance source or durable store call
    #[serde(default = "default_collaborator_timeout")]
    pub collaborator_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
    /// Margin asset whose available balance funds the strategies
    #[serde(default = "default_asset")]
    pub asset: String,
    /// Override for the REST base URL
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rolling log files
    #[serde(default = "default_log_directory")]
    pub directory: String,
}

// Default value functions
fn default_tolerance() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_budget_precision() -> u32 {
    0
}

fn default_refresh_interval() -> u64 {
    10
}

fn default_flush_interval() -> u64 {
    5
}

fn default_collaborator_timeout() -> u64 {
    5
}

fn default_asset() -> String {
    "USDT".to_string()
}

fn default_db_path() -> String {
    "data/ledger.db".to_string()
}

fn default_log_directory() -> String {
    "logs".to_string()
}

impl LedgerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborator_timeout_secs)
    }
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("CAL")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.ledger.tolerance >= Decimal::ZERO && self.ledger.tolerance <= Decimal::ONE,
            "tolerance must be between 0 and 1"
        );

        anyhow::ensure!(
            self.ledger.refresh_interval_secs > 0 && self.ledger.flush_interval_secs > 0,
            "reconciliation intervals must be positive"
        );

        anyhow::ensure!(
            self.ledger.collaborator_timeout_secs > 0,
            "collaborator_timeout_secs must be positive"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            source: SourceConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            budget_precision: default_budget_precision(),
            refresh_interval_secs: default_refresh_interval(),
            flush_interval_secs: default_flush_interval(),
            collaborator_timeout_secs: default_collaborator_timeout(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            asset: default_asset(),
            base_url: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
        }
    }
}
