//! Martingale Paper Trading Application
//!
//! Runs the engine with a handful of simulated traders and logs the event
//! stream until interrupted.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use martingale_core::paper_trading::PositionView;
use martingale_core::{AccountId, AssetId, EngineConfig, EngineEvent, OrderSide, SessionId, TradingEngine};

const DEMO_TRADERS: [&str; 4] = ["alice", "bob", "carol", "dave"];

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    info!("🚀 Starting Martingale paper trading engine");

    let engine = build_engine(config)?;
    engine.start().await?;
    info!("✅ Engine started with {} assets", engine.get_active_assets().len());

    // Log everything the engine broadcasts
    let mut events = engine.subscribe(SessionId::new());
    let event_task = tokio::spawn(async move {
        let mut seen = 0u64;
        while let Some(event) = events.next().await {
            seen += 1;
            match &event {
                EngineEvent::AssetSettled { asset, final_price } => {
                    info!("🏁 {} settled at {:.4}", asset, final_price)
                }
                EngineEvent::LeaderboardUpdate { entries } => {
                    if let Some(leader) = entries.first() {
                        debug!("Leader: {} ({:+.2})", leader.account, leader.total_pnl);
                    }
                }
                _ => {}
            }
            if let Ok(json) = event.to_json() {
                debug!("event #{}: {}", seen, json);
            }
        }
        seen
    });

    // Simulated traders
    let mut trader_tasks = Vec::new();
    for name in DEMO_TRADERS {
        let engine = engine.clone();
        let account = AccountId::new(name);
        trader_tasks.push(tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            loop {
                let pause = rng.gen_range(500..3_000);
                tokio::time::sleep(Duration::from_millis(pause)).await;
                trade_once(&engine, &account, &mut rng);
            }
        }));
    }

    // Periodic portfolio report
    let report_engine = engine.clone();
    let report_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let stats = report_engine.statistics();
            info!(
                "💰 {} active assets, {} ticks, {} fills, {} settled",
                stats.active_assets, stats.ticks, stats.transactions, stats.settled_assets
            );
        }
    });

    info!("📊 System is running. Press Ctrl+C to stop.");
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("🛑 Shutdown signal received...");
        }
        _ = report_task => {
            warn!("Portfolio reporter exited");
        }
    }

    for task in &trader_tasks {
        task.abort();
    }
    engine.stop().await?;

    for entry in engine.get_leaderboard() {
        info!(
            "#{} {:<8} total {:+.2} (realized {:+.2}, value {:.2})",
            entry.rank, entry.account, entry.total_pnl, entry.realized_pnl, entry.portfolio_value
        );
    }

    event_task.abort();
    info!("✅ Martingale paper trading shutdown complete");
    Ok(())
}

/// Config from `MARTINGALE_CONFIG` when set, defaults otherwise
fn load_config() -> Result<EngineConfig> {
    match std::env::var_os("MARTINGALE_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            info!("Loading config from {}", path.display());
            EngineConfig::load(&path).context("loading engine config")
        }
        None => Ok(EngineConfig::default()),
    }
}

/// Fresh engine with every demo trader funded
fn build_engine(config: EngineConfig) -> Result<TradingEngine> {
    let engine = TradingEngine::new(config)?;
    for name in DEMO_TRADERS {
        if let Err(e) = engine.open_account(AccountId::new(name)) {
            warn!("Could not open demo account {}: {}", name, e);
        }
    }
    Ok(engine)
}

/// Pick a random order for a trader, or nothing if it can't afford one
fn choose_order(
    rng: &mut impl Rng,
    assets: &[(AssetId, f64)],
    positions: &[PositionView],
    cash: f64,
) -> Option<(AssetId, OrderSide, f64)> {
    if !positions.is_empty() && rng.gen_bool(0.4) {
        let position = positions.choose(rng)?;
        if rng.gen_bool(0.3) {
            return Some((position.asset.clone(), OrderSide::SellAll, position.quantity));
        }
        let quantity = position.quantity * rng.gen_range(0.2..=1.0);
        return Some((position.asset.clone(), OrderSide::Sell, quantity));
    }

    let (asset, price) = assets.choose(rng)?;
    let budget = cash * rng.gen_range(0.01..0.1);
    let quantity = (budget / price).floor();
    (quantity >= 1.0).then(|| (asset.clone(), OrderSide::Buy, quantity))
}

fn trade_once(engine: &TradingEngine, account: &AccountId, rng: &mut StdRng) {
    let portfolio = match engine.get_portfolio(account) {
        Ok(portfolio) => portfolio,
        Err(e) => {
            warn!("No portfolio for {}: {}", account, e);
            return;
        }
    };
    let assets: Vec<(AssetId, f64)> = engine
        .get_active_assets()
        .into_iter()
        .map(|a| (a.symbol, a.current_price))
        .collect();

    if let Some((asset, side, quantity)) =
        choose_order(rng, &assets, &portfolio.positions, portfolio.cash)
    {
        // Rejections are logged by the engine
        let _ = engine.submit_order(account, &asset, side, quantity);
    }
}
