//! Airdrop worker: claims creator fees, swaps them into the reward token and
//! airdrops the reward balance to holders on a fixed cycle.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use airdrop_engine::config::EngineConfig;
use airdrop_engine::ops::DedupStore;
use airdrop_engine::runner::{CycleRunner, Engine};
use airdrop_engine::state::{FileDedupStore, DEFAULT_KEY_HISTORY};

mod config;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser)]
#[command(name = "airdrop-worker")]
#[command(about = "Fee claim, swap and holder airdrop on a fixed cycle")]
struct Cli {
    /// Path to tuning file
    #[arg(short, long, default_value = "distributor.toml", global = true)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cycle scheduler (long-running)
    Run,
    /// Run claim, swap and distribute for the current cycle now
    Once,
    /// Print the allocation the next distribution would send
    Preview {
        /// Print at most this many rows (largest first)
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Print persisted cumulative totals
    Totals,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Initialize logging (LOG_DESTINATION=console|file); the guard flushes on drop
    let _log_guard =
        airdrop_engine::logging::init_logging(cli.verbose, &["airdrop_worker", "airdrop_engine"], "airdrop-worker");

    let config = config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    match cli.command {
        Commands::Run => run_worker(config).await,
        Commands::Once => run_once(config).await,
        Commands::Preview { limit } => run_preview(config, limit).await,
        Commands::Totals => run_totals(&config),
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn connect(config: &EngineConfig) -> Result<Arc<Engine>> {
    info!(
        "Distributor {} tracking {} rewarding {} via {} RPC endpoint(s)",
        config.distributor(),
        config.tracked_mint,
        config.reward_mint,
        config.rpc_urls.len()
    );
    Ok(Arc::new(Engine::connect(config).await?))
}

async fn run_worker(config: EngineConfig) -> Result<()> {
    let engine = connect(&config).await?;
    let runner = CycleRunner::from_config(engine, &config)?;
    runner.run(None).await
}

async fn run_once(config: EngineConfig) -> Result<()> {
    let engine = connect(&config).await?;
    let mut runner = CycleRunner::from_config(engine, &config)?;
    let fired = runner.run_once().await;
    for (cycle, stage) in &fired {
        println!("cycle {} {}: done", cycle, stage);
    }
    print_totals(&runner.engine().ops.state()?.totals)
}

async fn run_preview(config: EngineConfig, limit: usize) -> Result<()> {
    let engine = connect(&config).await?;
    let preview = engine.preview().await?;

    println!(
        "Balance {}, pool {}, {} holder(s), {} eligible",
        preview.balance,
        preview.pool,
        preview.holders,
        preview.rows.len()
    );
    let mut rows = preview.rows;
    rows.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.wallet.cmp(&b.wallet)));
    println!("{:<46} {:>20}", "WALLET", "AMOUNT");
    for row in rows.iter().take(limit) {
        println!("{:<46} {:>20}", row.wallet, row.amount);
    }
    if rows.len() > limit {
        println!("... {} more", rows.len() - limit);
    }
    Ok(())
}

fn run_totals(config: &EngineConfig) -> Result<()> {
    let store = FileDedupStore::open(&config.state_file, DEFAULT_KEY_HISTORY)?;
    let state = store.load();
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn print_totals(totals: &airdrop_engine::ops::Totals) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(totals)?);
    Ok(())
}
