//! Paper trading engine

use super::journal::{Transaction, TransactionJournal};
use super::leaderboard::{DirtyFlag, Leaderboard, LeaderboardEntry};
use super::order_manager::{ExecutionStats, OrderExecutor};
use super::portfolio::{PerformanceSnapshot, PortfolioSnapshot};
use super::position_manager::{Account, PositionLedger};
use super::settlement::{SettlementReport, SettlementService};
use crate::broadcast::{BroadcastGateway, EngineEvent, EventStream, GatewayStats};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::market_data::{
    AssetLister, AssetListing, AssetRegistry, AssetSnapshot, AssetStatus, Clock, GaussianNoise,
    NoiseSource, PriceGenerator, PricePoint, SystemClock,
};
use crate::repository::{InMemoryRepository, Repository};
use crate::types::{AccountId, AssetId, OrderSide, SessionId};
use anyhow::{bail, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Counts of assets by lifecycle stage
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AssetSummary {
    pub active_count: usize,
    pub expiring_count: usize,
    pub settled_count: usize,
    pub average_seconds_to_expiry: f64,
    pub active_symbols: Vec<AssetId>,
    /// The five active assets closest to expiry
    pub expiring_soon: Vec<AssetSnapshot>,
}

/// Engine-wide statistics
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EngineStatistics {
    pub running: bool,
    pub active_assets: usize,
    pub listed_assets: usize,
    pub accounts: usize,
    pub ticks: u64,
    pub transactions: u64,
    pub orders: ExecutionStats,
    pub settled_assets: u64,
    pub leaderboard_recomputes: u64,
    pub gateway: GatewayStats,
}

/// What `restore` brought back from the repository
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreStats {
    pub assets: usize,
    pub accounts: usize,
    pub positions: usize,
    pub transactions: usize,
}

/// Builds a [`TradingEngine`] with optional injected collaborators
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    noise: Option<Box<dyn NoiseSource>>,
    repository: Option<Arc<dyn Repository>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
            noise: None,
            repository: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn noise(mut self, noise: Box<dyn NoiseSource>) -> Self {
        self.noise = Some(noise);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn build(self) -> Result<TradingEngine> {
        let config = self.config;
        config.validate()?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let noise: Box<dyn NoiseSource> = match (self.noise, config.seed) {
            (Some(noise), _) => noise,
            (None, Some(seed)) => Box::new(GaussianNoise::seeded(seed)),
            (None, None) => Box::new(GaussianNoise::from_entropy()),
        };
        let repository: Arc<dyn Repository> = match self.repository {
            Some(repository) => repository,
            None => Arc::new(InMemoryRepository::new()),
        };

        let registry = Arc::new(AssetRegistry::new());
        let journal = Arc::new(TransactionJournal::new(config.journal_window));
        let gateway = Arc::new(BroadcastGateway::new(config.session_buffer));
        let dirty = Arc::new(DirtyFlag::new());

        let generator = Arc::new(PriceGenerator::new(
            registry.clone(),
            noise,
            clock.clone(),
            config.price_floor,
        ));
        let lister = Arc::new(AssetLister::new(
            registry.clone(),
            clock.clone(),
            config.listing.clone(),
            config.history_window,
            config.seed,
        ));
        let ledger = Arc::new(PositionLedger::new(
            journal.clone(),
            repository.clone(),
            clock.clone(),
        ));
        let executor = Arc::new(OrderExecutor::new(
            registry.clone(),
            ledger.clone(),
            gateway.clone(),
            dirty.clone(),
            clock.clone(),
        ));
        let settlement = Arc::new(SettlementService::new(
            registry.clone(),
            ledger.clone(),
            executor.clone(),
            gateway.clone(),
            dirty.clone(),
            repository.clone(),
            clock.clone(),
        ));
        let leaderboard = Arc::new(Leaderboard::new(ledger.clone(), registry.clone(), dirty));
        let (shutdown, _) = watch::channel(false);

        Ok(TradingEngine {
            config: Arc::new(config),
            clock,
            registry,
            generator,
            lister,
            ledger,
            journal,
            executor,
            settlement,
            leaderboard,
            gateway,
            repository,
            shutdown: Arc::new(shutdown),
            running: Arc::new(AtomicBool::new(false)),
            tickers: Arc::new(DashMap::new()),
            workers: Arc::new(Mutex::new(Vec::new())),
            ticks: Arc::new(AtomicU64::new(0)),
        })
    }
}

/// Paper trading engine over expiring synthetic assets
#[derive(Clone)]
pub struct TradingEngine {
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    registry: Arc<AssetRegistry>,
    generator: Arc<PriceGenerator>,
    lister: Arc<AssetLister>,
    ledger: Arc<PositionLedger>,
    journal: Arc<TransactionJournal>,
    executor: Arc<OrderExecutor>,
    settlement: Arc<SettlementService>,
    leaderboard: Arc<Leaderboard>,
    gateway: Arc<BroadcastGateway>,
    repository: Arc<dyn Repository>,
    shutdown: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
    tickers: Arc<DashMap<AssetId, JoinHandle<()>>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ticks: Arc<AtomicU64>,
}

impl TradingEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the tickers, the settlement scanner and the leaderboard worker
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("Trading engine already running");
        }
        self.shutdown.send_replace(false);

        if self.config.auto_list {
            self.replenish_pool();
        }
        for asset in self.registry.active_ids() {
            self.spawn_ticker(asset);
        }

        let settlement = self.spawn_periodic(self.config.settlement_interval(), |engine| {
            engine.run_settlement_cycle();
        });
        let leaderboard = self.spawn_periodic(self.config.leaderboard_interval(), |engine| {
            engine.refresh_leaderboard();
        });
        self.workers.lock().extend([settlement, leaderboard]);

        info!(
            "Trading engine started with {} active assets",
            self.registry.active_count()
        );
        Ok(())
    }

    /// Signal every worker to stop and wait for them
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let mut handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let symbols: Vec<AssetId> = self.tickers.iter().map(|t| t.key().clone()).collect();
        for symbol in symbols {
            if let Some((_, handle)) = self.tickers.remove(&symbol) {
                handles.push(handle);
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Engine worker ended abnormally: {}", e);
                }
            }
        }
        info!("Trading engine stopped");
        Ok(())
    }

    fn spawn_periodic<F>(&self, period: Duration, work: F) -> JoinHandle<()>
    where
        F: Fn(&TradingEngine) + Send + 'static,
    {
        let engine = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => work(&engine),
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn spawn_ticker(&self, asset: AssetId) {
        if !self.is_running() {
            return;
        }
        if let Some(existing) = self.tickers.get(&asset) {
            if !existing.is_finished() {
                return;
            }
        }

        let engine = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.tick_interval();
        let symbol = asset.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => match engine.tick(&symbol) {
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Ticker for {} stopped: {}", symbol, e);
                            break;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Ticker for {} exited", symbol);
        });
        self.tickers.insert(asset, handle);
    }

    fn replenish_pool(&self) {
        for snapshot in self.lister.maintain_pool() {
            self.persist_asset(&snapshot.symbol);
            self.spawn_ticker(snapshot.symbol);
        }
    }

    fn persist_asset(&self, symbol: &AssetId) {
        if let Ok(handle) = self.registry.get(symbol) {
            let asset = handle.read();
            if let Err(e) = self.repository.save_asset(&asset) {
                warn!("Failed to persist asset {}: {:#}", symbol, e);
            }
        }
    }

    /// Advance one asset's price and broadcast it
    pub fn tick(&self, asset: &AssetId) -> EngineResult<Option<PricePoint>> {
        let point = self.generator.tick(asset)?;
        if let Some(point) = point {
            self.ticks.fetch_add(1, Ordering::Relaxed);
            self.gateway.publish(EngineEvent::PriceUpdate {
                asset: asset.clone(),
                price: point.price,
                timestamp: point.timestamp,
            });
            self.leaderboard.dirty().mark();
        }
        Ok(point)
    }

    pub fn open_account(&self, id: AccountId) -> EngineResult<Account> {
        self.open_account_with_cash(id, self.config.initial_cash)
    }

    pub fn open_account_with_cash(&self, id: AccountId, cash: f64) -> EngineResult<Account> {
        let account = self.ledger.open_account(id, cash)?;
        info!("Opened account {} with {:.2}", account.id, account.cash);
        self.leaderboard.dirty().mark();
        Ok(account)
    }

    pub fn list_asset(&self, listing: AssetListing) -> EngineResult<AssetSnapshot> {
        let snapshot = self.lister.list(listing)?;
        self.persist_asset(&snapshot.symbol);
        self.spawn_ticker(snapshot.symbol.clone());
        Ok(snapshot)
    }

    pub fn list_random_asset(&self) -> EngineResult<AssetSnapshot> {
        self.list_asset(self.lister.random_listing())
    }

    pub fn submit_order(
        &self,
        account: &AccountId,
        asset: &AssetId,
        side: OrderSide,
        quantity: f64,
    ) -> EngineResult<Transaction> {
        self.executor.execute(account, asset, side, quantity)
    }

    /// Tradable assets, soonest expiry first
    pub fn get_active_assets(&self) -> Vec<AssetSnapshot> {
        self.registry.active_snapshots(self.clock.now())
    }

    pub fn get_asset(&self, asset: &AssetId) -> EngineResult<AssetSnapshot> {
        self.registry.snapshot(asset, self.clock.now())
    }

    /// Price samples oldest first, the last `limit` when given
    pub fn get_price_history(
        &self,
        asset: &AssetId,
        limit: Option<usize>,
    ) -> EngineResult<Vec<PricePoint>> {
        Ok(self.registry.get(asset)?.read().history_tail(limit))
    }

    pub fn get_portfolio(&self, account: &AccountId) -> EngineResult<PortfolioSnapshot> {
        let acct = self.ledger.account(account)?;
        let positions = self.ledger.positions_for(account);
        let prices = self.registry.prices();
        Ok(PortfolioSnapshot::build(
            &acct,
            &positions,
            &prices,
            self.clock.now(),
        ))
    }

    pub fn get_performance(&self, account: &AccountId) -> EngineResult<PerformanceSnapshot> {
        let portfolio = self.get_portfolio(account)?;
        let acct = self.ledger.account(account)?;
        Ok(PerformanceSnapshot::from_portfolio(&acct, &portfolio))
    }

    pub fn get_transactions(&self, account: &AccountId) -> EngineResult<Vec<Transaction>> {
        if !self.ledger.has_account(account) {
            return Err(EngineError::AccountNotFound(account.clone()));
        }
        Ok(self.journal.for_account(account))
    }

    /// Most recent fills across all accounts, newest first
    pub fn get_time_and_sales(&self, limit: usize) -> Vec<Transaction> {
        self.journal.recent(limit)
    }

    /// Held quantity per asset, zero for active assets nobody holds
    pub fn get_open_interest(&self) -> BTreeMap<AssetId, f64> {
        let mut interest: BTreeMap<AssetId, f64> = self
            .registry
            .active_ids()
            .into_iter()
            .map(|id| (id, 0.0))
            .collect();
        for (asset, quantity) in self.ledger.open_interest() {
            *interest.entry(asset).or_insert(0.0) += quantity;
        }
        interest
    }

    /// Fresh ranking of every account
    pub fn get_leaderboard(&self) -> Vec<LeaderboardEntry> {
        self.leaderboard.compute()
    }

    pub fn get_asset_summary(&self) -> AssetSummary {
        let active = self.get_active_assets();
        let average_seconds_to_expiry = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|a| a.seconds_to_expiry as f64).sum::<f64>() / active.len() as f64
        };
        let settled_count = self.registry.ids_with_status(AssetStatus::Settled).len()
            + self.registry.ids_with_status(AssetStatus::Removed).len();

        AssetSummary {
            active_count: active.len(),
            expiring_count: self.registry.ids_with_status(AssetStatus::Expiring).len(),
            settled_count,
            average_seconds_to_expiry,
            active_symbols: self.registry.active_ids(),
            expiring_soon: active.into_iter().take(5).collect(),
        }
    }

    pub fn subscribe(&self, session: SessionId) -> EventStream {
        self.gateway.subscribe(session)
    }

    pub fn disconnect(&self, session: &SessionId) -> bool {
        self.gateway.disconnect(session)
    }

    /// Settle expired assets, refill the pool and purge stale history
    pub fn run_settlement_cycle(&self) -> Vec<SettlementReport> {
        let reports = self.settlement.scan();
        if !reports.is_empty() && self.config.auto_list {
            self.replenish_pool();
        }
        self.settlement.purge_removed(self.config.removed_retention());
        self.tickers.retain(|_, handle| !handle.is_finished());
        reports
    }

    /// Recompute and publish the leaderboard if anything changed
    pub fn refresh_leaderboard(&self) -> Option<Vec<LeaderboardEntry>> {
        let entries = self.leaderboard.refresh_if_dirty()?;
        self.gateway.publish(EngineEvent::LeaderboardUpdate {
            entries: entries.clone(),
        });
        Some(entries)
    }

    pub fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            running: self.is_running(),
            active_assets: self.registry.active_count(),
            listed_assets: self.registry.len(),
            accounts: self.ledger.account_count(),
            ticks: self.ticks.load(Ordering::Relaxed),
            transactions: self.journal.total(),
            orders: self.executor.stats(),
            settled_assets: self.settlement.settled_count(),
            leaderboard_recomputes: self.leaderboard.recompute_count(),
            gateway: self.gateway.stats(),
        }
    }

    /// Reload state from the repository; call before `start`
    pub fn restore(&self) -> Result<RestoreStats> {
        let assets = self.repository.load_assets()?;
        let accounts = self.repository.load_accounts()?;
        let positions = self.repository.load_positions()?;
        let transactions = self.repository.load_transactions()?;

        let mut stats = RestoreStats {
            accounts: accounts.len(),
            positions: positions.len(),
            transactions: transactions.len(),
            ..RestoreStats::default()
        };
        for asset in assets {
            let symbol = asset.symbol.clone();
            match self.registry.insert(asset) {
                Ok(_) => stats.assets += 1,
                Err(e) => warn!("Skipping restored asset {}: {}", symbol, e),
            }
        }
        self.ledger.restore(accounts, positions);
        self.journal.restore(transactions);
        self.leaderboard.dirty().mark();

        info!(
            "Restored {} assets, {} accounts, {} positions, {} transactions",
            stats.assets, stats.accounts, stats.positions, stats.transactions
        );
        Ok(stats)
    }
}
