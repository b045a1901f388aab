//! Capital Ledger - Main Entry Point
//!
//! Runs the shared capital ledger with its reconciliation loops, or manages the
//! persisted strategy configuration.

use anyhow::{Context, Result};
use capital_ledger::config::Config;
use capital_ledger::halt::AlertingController;
use capital_ledger::ledger::{CapitalLedger, FlushOutcome, ReconciliationLoops};
use capital_ledger::persistence::SqliteLedgerStore;
use capital_ledger::source::{BinanceBalanceSource, CapitalSource, PaperBalanceSource};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Capital Ledger CLI
#[derive(Parser)]
#[command(name = "capital-ledger")]
#[command(version, about = "Shared capital allocation ledger for multi-strategy trading")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ledger and its reconciliation loops (default)
    Run {
        /// Use an in-memory paper balance instead of the exchange account
        #[arg(long)]
        paper_balance: Option<Decimal>,
    },

    /// Add a strategy or change its capital share
    Configure {
        /// Strategy identifier
        #[arg(short, long)]
        strategy: String,

        /// Fraction of total capital, between 0 and 1
        #[arg(long)]
        share: Decimal,

        /// Path to SQLite database (default: storage.db_path)
        #[arg(short, long)]
        db: Option<String>,
    },

    /// Show the last flushed ledger snapshot
    Status {
        /// Path to SQLite database (default: storage.db_path)
        #[arg(short, long)]
        db: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load()?;
    config.validate()?;

    init_logging(&config.logging.directory)?;

    match cli.command {
        Some(Commands::Configure { strategy, share, db }) => {
            let db = db.unwrap_or_else(|| config.storage.db_path.clone());
            configure_strategy(&db, &strategy, share)
        }
        Some(Commands::Status { db }) => {
            let db = db.unwrap_or_else(|| config.storage.db_path.clone());
            show_status(&db)
        }
        Some(Commands::Run { paper_balance }) => run(config, paper_balance).await,
        None => run(config, None).await,
    }
}

async fn run(config: Config, paper_balance: Option<Decimal>) -> Result<()> {
    info!(
        "Capital Ledger v{} starting",
        env!("CARGO_PKG_VERSION")
    );
    log_config(&config);

    let source: Arc<dyn CapitalSource> = match paper_balance {
        Some(balance) => {
            info!(%balance, "📝 PAPER MODE - in-memory balance");
            Arc::new(PaperBalanceSource::new(balance))
        }
        None => {
            if config.source.api_key.is_empty() {
                warn!("⚠️  No API key configured; balance reads will be rejected by the exchange");
            }
            Arc::new(BinanceBalanceSource::new(
                &config.source,
                config.ledger.collaborator_timeout(),
            )?)
        }
    };

    ensure_parent_dir(&config.storage.db_path)?;
    let durable = Arc::new(SqliteLedgerStore::new(&config.storage.db_path)?);
    let controller = Arc::new(AlertingController::new());

    let ledger = Arc::new(
        CapitalLedger::bootstrap(&config.ledger, source, durable, controller.clone())
            .await
            .context("Failed to bootstrap capital ledger")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loops = ReconciliationLoops::spawn(ledger.clone(), &config.ledger, shutdown_rx);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("🛑 Shutdown signal received"),
        _ = controller.halted() => error!("🛑 Trading halted; shutting down ledger"),
    }

    let _ = shutdown_tx.send(true);
    loops.join().await;

    info!("💾 Flushing final ledger state...");
    match ledger.flush_now().await {
        FlushOutcome::Flushed { version } => info!(version, "✅ Final ledger state saved"),
        _ => error!("❌ Failed to save final ledger state"),
    }

    let view = ledger.snapshot().await;
    let counters = ledger.counters();
    info!(
        version = view.version,
        balance = %view.external_balance,
        total_capital = %view.totals.total_capital,
        available = %view.totals.available_capital,
        refresh_failures = counters.balance_refresh_failures,
        flush_failures = counters.total_flush_failures,
        rejected = counters.rejected_reservations,
        "🏁 Final ledger state"
    );
    info!("👋 Capital Ledger shutdown complete");
    Ok(())
}

fn ensure_parent_dir(db_path: &str) -> Result<()> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
    }
    Ok(())
}

fn configure_strategy(db_path: &str, strategy: &str, share: Decimal) -> Result<()> {
    ensure_parent_dir(db_path)?;
    let store = SqliteLedgerStore::new(db_path)?;
    store.configure_strategy(strategy, share)?;
    println!("✅ {} now receives {}% of total capital", strategy, share * dec!(100));
    Ok(())
}

fn show_status(db_path: &str) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              CAPITAL LEDGER STATUS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   Configure a strategy first, or check the database path.");
        return Ok(());
    }

    let store = SqliteLedgerStore::new(db_path)?;
    let Some(persisted) = store.load_snapshot()? else {
        println!("\n❌ No flushed snapshot found in database.");
        println!("   The ledger may not have run yet.");
        return Ok(());
    };

    let snapshot = &persisted.snapshot;
    let totals = snapshot.totals();

    println!("\n📊 Account Summary");
    println!("   ├─ External Balance: ${:.2}", snapshot.external_balance);
    println!("   ├─ Total Capital:    ${:.2}", totals.total_capital);
    println!("   ├─ Available:        ${:.2}", totals.available_capital);
    println!("   ├─ Version:          {}", snapshot.version);
    println!(
        "   └─ Last Saved:       {}",
        persisted.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    if !snapshot.strategies.is_empty() {
        println!("\n💰 Strategies");
        for row in snapshot.strategies.values() {
            println!("   ┌─ {} ({}%)", row.strategy_id, row.share * dec!(100));
            println!("   ├─ Budget:    ${:.2}", row.strategy_budget);
            println!("   ├─ Committed: ${:.2}", row.committed_capital);
            println!("   ├─ Open:      ${:.2}", row.open_orders);
            println!("   └─ Headroom:  ${:.2}", row.headroom);
        }
    }

    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(directory: &str) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(directory)?;

    let file_appender = tracing_appender::rolling::hourly(directory, "capital-ledger.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("capital_ledger=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Tolerance:          {}%", config.ledger.tolerance * dec!(100));
    info!("   Budget Precision:   {} dp", config.ledger.budget_precision);
    info!("   Refresh Interval:   {}s", config.ledger.refresh_interval_secs);
    info!("   Flush Interval:     {}s", config.ledger.flush_interval_secs);
    info!("   Timeout:            {}s", config.ledger.collaborator_timeout_secs);
    info!("   Asset:              {}", config.source.asset);
    info!("   Testnet:            {}", config.source.testnet);
    info!("   Database:           {}", config.storage.db_path);
}
