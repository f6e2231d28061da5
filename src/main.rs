//! Consensus Trader
//!
//! Runs the consensus trading loop:
//! - Classifies the volatility regime and sets the confidence threshold
//! - Proposes trades from technical indicators
//! - Puts each proposal to the evaluator panel
//! - Executes approved trades and learns from their outcomes

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use consensus_trader::agent::{AgentParts, CycleOutcome, TradingAgent};
use consensus_trader::config::AppConfig;
use consensus_trader::exchange::{ExchangeConnector, PaperConfig, PaperExchange};
use consensus_trader::network::EventBus;
use consensus_trader::state::SharedState;
use consensus_trader::telemetry::{init_logging, init_metrics, spawn_alert_handler, AlertManager};
use consensus_trader::utils::helpers::format_usd;

/// Adaptive multi-evaluator trade consensus engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Enable paper trading mode (no real orders)
    #[arg(long)]
    paper: bool,

    /// Override log level
    #[arg(long)]
    log_level: Option<String>,

    /// Run a single round and exit
    #[arg(long)]
    once: bool,
}

fn load_config(args: &Args) -> Result<AppConfig> {
    if !args.config.exists() && args.paper {
        // Logging is not up yet
        eprintln!(
            "Config {:?} not found, using built-in paper trading defaults",
            args.config
        );
        return Ok(AppConfig::paper_default());
    }
    AppConfig::load(&args.config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args)?;

    // Apply CLI overrides
    if args.paper {
        config.paper_trading = true;
    }
    if let Some(level) = &args.log_level {
        config.telemetry.log_level = level.clone();
    }

    let _log_guard = init_logging(&config.telemetry)?;

    info!("Starting consensus trader v{}", env!("CARGO_PKG_VERSION"));
    info!("Paper trading: {}", config.paper_trading);
    info!(
        "Symbols: {} | evaluators: {}",
        config.trading.symbols.join(", "),
        config.evaluators.len()
    );

    if cfg!(feature = "paper-only") && !config.paper_trading {
        anyhow::bail!("this build only supports paper trading; pass --paper or set paper_trading: true");
    }
    if !config.paper_trading {
        anyhow::bail!("no live exchange connector is configured; run with --paper");
    }

    if config.telemetry.enable_metrics {
        init_metrics(config.telemetry.metrics_port).context("Failed to start metrics exporter")?;
    }

    let config = Arc::new(config);
    let state = Arc::new(SharedState::new());
    let bus = Arc::new(EventBus::default());

    let alerts = Arc::new(AlertManager::new(&config.telemetry));
    let _alert_task = spawn_alert_handler(&bus, alerts);

    let exchange: Arc<dyn ExchangeConnector> = Arc::new(PaperExchange::new(PaperConfig {
        initial_balance: config.trading.capital_usd,
        ..PaperConfig::default()
    }));
    let parts = AgentParts::from_config(&config, exchange).await?;
    let agent = Arc::new(TradingAgent::new(config.clone(), state.clone(), bus, parts));
    info!("Trading agent initialized");

    if args.once {
        let report = agent.run_once().await;
        for (symbol, outcome) in &report.outcomes {
            match outcome {
                CycleOutcome::Held(result) | CycleOutcome::AlreadyPositioned(result) => info!(
                    "{}: {} ({:.3} vs threshold {:.2})",
                    symbol, result.consensus_type, result.confidence, result.threshold
                ),
                CycleOutcome::Opened(p) => info!("{}: opened {} {} @ {}", symbol, p.side, p.quantity, p.entry_price),
                CycleOutcome::Closed(p) | CycleOutcome::Exited(p) => {
                    info!("{}: closed {} for {} ({})", symbol, p.side, format_usd(p.realized_pnl), p.outcome)
                }
                other => warn!("{}: {:?}", symbol, other),
            }
        }
        for (symbol, failure) in &report.failures {
            error!("{}: {}", symbol, failure);
        }
        agent.stop().await;
        return Ok(());
    }

    agent.start().await?;

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, gracefully stopping...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    agent.stop().await;
    let totals = agent.positions().totals();
    let performance = agent.positions().performance();
    info!(
        "Performance: {} trades, win rate {:.1}%, profit factor {:.2}, max drawdown {:.1}%",
        performance.total_trades,
        performance.win_rate * 100.0,
        performance.profit_factor,
        performance.max_drawdown_pct
    );
    info!(
        "Consensus trader stopped: {} cycles, realized {}, {} open positions",
        agent.state().cycle_count.load(std::sync::atomic::Ordering::SeqCst),
        format_usd(totals.realized_pnl),
        totals.open_positions
    );
    Ok(())
}
