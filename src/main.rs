//! Entrypoint: a `clap`-derived CLI with two subcommands.
//!
//! `serve` starts the indexing daemon — upstream client, durable store,
//! write-back cache, balance processor and chain follower — and then reads
//! addresses one per line from standard input, printing each balance as a
//! base-unit decimal integer, exactly like the original's combined
//! facade-plus-stdin-loop. `Ctrl+C` requests a graceful stop: the follower
//! drains in-flight work and commits before the process exits.
//!
//! `balance` is an offline convenience query against the durable store
//! alone (no follower, no upstream connection) — useful to check a balance
//! without running the indexer, at the cost of being only as fresh as the
//! last commit.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use balanced_ledger::address::{self, Network};
use balanced_ledger::balance_cache::BalanceCache;
use balanced_ledger::balance_processor::BalanceProcessor;
use balanced_ledger::chain_follower::ChainFollower;
use balanced_ledger::config::{self, AppConfig};
use balanced_ledger::errors::IndexerError;
use balanced_ledger::metrics;
use balanced_ledger::rpc::UpstreamClient;
use balanced_ledger::store::BalanceStore;
use balanced_ledger::telemetry::{self, TelemetryConfig};

#[derive(Parser, Debug)]
#[clap(name = "balanced-ledger")]
#[clap(about = "Confirmed address-balance index for a UTXO chain", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the indexing daemon and read addresses from stdin.
    Serve,
    /// Query the durable store directly, without running the indexer.
    Balance,
}

fn print_balance(balance: i64) {
    let mut stdout = io::stdout();
    let _ = writeln!(stdout, "{}", balance);
    let _ = stdout.flush();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    config::init_global_config()?;
    let app_config = config::get_global_config();

    telemetry::init_tracing(TelemetryConfig::default())?;
    metrics::init_metrics().ok();

    match Cli::parse().command {
        Command::Serve => run_serve(app_config).await,
        Command::Balance => run_balance_query(app_config),
    }
}

async fn run_serve(app_config: &'static AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let network = Network::from_chain_name(&app_config.chain);

    let store = BalanceStore::open(app_config)?;
    let cache = BalanceCache::new(store, app_config.balance_cache_size)?;
    let processor = Arc::new(BalanceProcessor::new(
        app_config.max_backtrack_blocks,
        cache,
    ));

    let upstream = Arc::new(UpstreamClient::new(app_config));
    if !upstream.try_connect() {
        info!(url = %app_config.upstream_url, "upstream not reachable yet, will retry in background");
    }

    let follower = Arc::new(ChainFollower::new(app_config, upstream, processor.clone()));
    let stop = follower.stop_handle();

    let follower_for_run = follower.clone();
    let driver = tokio::task::spawn_blocking(move || follower_for_run.run());

    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, stopping chain follower");
            ctrl_c_stop.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let stdin_processor = processor.clone();
    let stdin_task =
        tokio::task::spawn_blocking(move || read_balance_queries(network, &stdin_processor));

    let _ = stdin_task.await;
    stop.store(true, std::sync::atomic::Ordering::SeqCst);

    match driver.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "chain follower terminated with error");
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
        Err(join_err) => Err(Box::new(join_err) as Box<dyn std::error::Error>),
    }
}

/// Read addresses from stdin until EOF, printing the live processor's
/// balance for each valid one.
fn read_balance_queries(network: Network, processor: &BalanceProcessor) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        let addr = line.trim();
        if addr.is_empty() {
            continue;
        }

        if !address::is_valid_address(network, addr) {
            eprintln!("{}", IndexerError::InvalidAddress(addr.to_string()));
            continue;
        }

        match processor.get_balance(addr) {
            Ok(balance) => print_balance(balance),
            Err(e) => eprintln!("{}", e),
        }
    }
}

/// Offline query path: open the store read-only (no upstream, no
/// follower) and answer from its durable balances alone.
fn run_balance_query(app_config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let network = Network::from_chain_name(&app_config.chain);
    let store = BalanceStore::open(app_config)?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let addr = line.trim();
        if addr.is_empty() {
            continue;
        }

        if !address::is_valid_address(network, addr) {
            eprintln!("{}", IndexerError::InvalidAddress(addr.to_string()));
            continue;
        }

        match store.get(addr) {
            Ok(balance) => print_balance(balance),
            Err(e) => eprintln!("{}", e),
        }
    }

    Ok(())
}
