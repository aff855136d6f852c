//! Expiration settlement
//!
//! Each expired asset moves `Active -> Expiring -> Settled -> Removed`.
//! The freeze happens under the asset's write lock, so any order already
//! holding the read lock finishes first and none start afterwards.

use super::journal::Transaction;
use super::leaderboard::DirtyFlag;
use super::order_manager::OrderExecutor;
use super::position_manager::PositionLedger;
use crate::broadcast::{BroadcastGateway, EngineEvent};
use crate::error::{EngineError, EngineResult};
use crate::market_data::{Asset, AssetRegistry, AssetStatus, Clock};
use crate::repository::Repository;
use crate::types::{AccountId, AssetId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SettlementFailure {
    pub account: AccountId,
    pub reason: String,
}

/// Outcome of settling one asset
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SettlementReport {
    pub asset: AssetId,
    pub final_price: f64,
    pub settled_at: DateTime<Utc>,
    pub settled: Vec<Transaction>,
    pub failures: Vec<SettlementFailure>,
    /// Cash paid out to holders
    pub total_value: f64,
}

pub struct SettlementService {
    registry: Arc<AssetRegistry>,
    ledger: Arc<PositionLedger>,
    executor: Arc<OrderExecutor>,
    gateway: Arc<BroadcastGateway>,
    dirty: Arc<DirtyFlag>,
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    /// One settlement at a time, whether from the worker or a caller
    settling: Mutex<()>,
    settled_assets: AtomicU64,
}

impl SettlementService {
    pub fn new(
        registry: Arc<AssetRegistry>,
        ledger: Arc<PositionLedger>,
        executor: Arc<OrderExecutor>,
        gateway: Arc<BroadcastGateway>,
        dirty: Arc<DirtyFlag>,
        repository: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            ledger,
            executor,
            gateway,
            dirty,
            repository,
            clock,
            settling: Mutex::new(()),
            settled_assets: AtomicU64::new(0),
        }
    }

    /// Settle every active asset whose expiration has passed
    pub fn scan(&self) -> Vec<SettlementReport> {
        let due = self.registry.due_for_settlement(self.clock.now());
        let mut reports = Vec::with_capacity(due.len());
        for asset in due {
            match self.settle_asset(&asset) {
                Ok(report) => reports.push(report),
                Err(e) => error!("Settlement of {} failed: {}", asset, e),
            }
        }
        reports
    }

    /// Freeze, liquidate every holder and retire one asset
    ///
    /// Picks up where an earlier attempt stopped: an `Expiring` asset keeps
    /// its frozen price and a `Settled` one skips liquidation.
    pub fn settle_asset(&self, symbol: &AssetId) -> EngineResult<SettlementReport> {
        let _settling = self.settling.lock();
        let handle = self.registry.get(symbol)?;

        let (from, final_price) = {
            let mut asset = handle.write();
            let from = asset.status;
            let price = match from {
                AssetStatus::Active => {
                    let price = asset.freeze()?;
                    self.persist(&asset);
                    price
                }
                AssetStatus::Expiring | AssetStatus::Settled => {
                    let price = asset.final_price.unwrap_or(asset.current_price);
                    asset.final_price = Some(price);
                    price
                }
                AssetStatus::Removed => {
                    return Err(EngineError::Invariant(format!(
                        "asset {} is already settled",
                        symbol
                    )))
                }
            };
            (from, price)
        };
        if from == AssetStatus::Active {
            info!("Settling {} at {:.4}", symbol, final_price);
        } else {
            info!("Resuming settlement of {} from {} at {:.4}", symbol, from, final_price);
        }

        let mut settled = Vec::new();
        let mut failures = Vec::new();
        if from != AssetStatus::Settled {
            for account in self.ledger.holders_of(symbol) {
                match self.executor.force_liquidate(&account, symbol, final_price) {
                    Ok(Some(transaction)) => settled.push(transaction),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Could not settle {} for {}: {}", symbol, account, e);
                        failures.push(SettlementFailure {
                            account,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        let settled_at = {
            let mut asset = handle.write();
            if asset.status == AssetStatus::Expiring {
                asset.transition(AssetStatus::Settled)?;
            }
            let settled_at = *asset.settled_at.get_or_insert_with(|| self.clock.now());
            self.persist(&asset);
            settled_at
        };
        self.gateway.publish(EngineEvent::AssetSettled {
            asset: symbol.clone(),
            final_price,
        });
        {
            let mut asset = handle.write();
            asset.transition(AssetStatus::Removed)?;
            self.persist(&asset);
        }
        self.dirty.mark();
        self.settled_assets.fetch_add(1, Ordering::Relaxed);

        let total_value = settled.iter().map(|t| t.notional()).sum();
        info!(
            "Settled {}: {} positions, {:.2} paid out, {} failures",
            symbol,
            settled.len(),
            total_value,
            failures.len()
        );

        Ok(SettlementReport {
            asset: symbol.clone(),
            final_price,
            settled_at,
            settled,
            failures,
            total_value,
        })
    }

    /// Drop removed assets settled longer ago than `retention`
    pub fn purge_removed(&self, retention: chrono::Duration) -> Vec<AssetId> {
        let cutoff = self.clock.now() - retention;
        let stale = self.registry.removed_before(cutoff);
        for symbol in &stale {
            self.registry.remove(symbol);
            if let Err(e) = self.repository.delete_asset(symbol) {
                warn!("Failed to delete {} from repository: {:#}", symbol, e);
            }
        }
        if !stale.is_empty() {
            info!("Purged {} removed assets", stale.len());
        }
        stale
    }

    fn persist(&self, asset: &Asset) {
        if let Err(e) = self.repository.save_asset(asset) {
            warn!("Failed to persist asset {}: {:#}", asset.symbol, e);
        }
    }

    pub fn settled_count(&self) -> u64 {
        self.settled_assets.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{AssetListing, ManualClock};
    use crate::paper_trading::journal::TransactionJournal;
    use crate::repository::InMemoryRepository;
    use crate::types::{OrderSide, TransactionKind};
    use chrono::TimeZone;

    struct Fixture {
        service: SettlementService,
        executor: Arc<OrderExecutor>,
        ledger: Arc<PositionLedger>,
        registry: Arc<AssetRegistry>,
        repo: Arc<InMemoryRepository>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let registry = Arc::new(AssetRegistry::new());
        for (symbol, minutes) in [("YLD", 5), ("FAR", 60)] {
            registry
                .insert(
                    Asset::new(
                        AssetListing {
                            symbol: AssetId::new(symbol),
                            initial_price: 42.0,
                            volatility: 0.02,
                            drift: 0.0,
                            expires_at: start + chrono::Duration::minutes(minutes),
                        },
                        start,
                        100,
                    )
                    .unwrap(),
                )
                .unwrap();
        }
        let repo = Arc::new(InMemoryRepository::new());
        let ledger = Arc::new(PositionLedger::new(
            Arc::new(TransactionJournal::new(100)),
            repo.clone(),
            clock.clone(),
        ));
        let gateway = Arc::new(BroadcastGateway::new(16));
        let dirty = Arc::new(DirtyFlag::new());
        let executor = Arc::new(OrderExecutor::new(
            registry.clone(),
            ledger.clone(),
            gateway.clone(),
            dirty.clone(),
            clock.clone(),
        ));
        let service = SettlementService::new(
            registry.clone(),
            ledger.clone(),
            executor.clone(),
            gateway,
            dirty,
            repo.clone(),
            clock.clone(),
        );
        Fixture {
            service,
            executor,
            ledger,
            registry,
            repo,
            clock,
        }
    }

    #[test]
    fn test_settles_only_expired_assets() {
        let f = fixture();
        for name in ["bob", "alice"] {
            let id = AccountId::new(name);
            f.ledger.open_account(id.clone(), 1000.0).unwrap();
            f.executor
                .execute(&id, &AssetId::new("YLD"), OrderSide::Buy, 20.0)
                .unwrap();
        }

        assert!(f.service.scan().is_empty());
        f.clock.advance(chrono::Duration::minutes(5));
        let reports = f.service.scan();

        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.final_price, 42.0);
        assert_eq!(report.total_value, 1680.0);
        assert!(report.failures.is_empty());
        // Holders are liquidated in account order
        assert_eq!(report.settled[0].account, AccountId::new("alice"));
        assert_eq!(report.settled[1].account, AccountId::new("bob"));
        assert!(report.settled.iter().all(|t| t.kind == TransactionKind::Settlement));

        let yld = AssetId::new("YLD");
        assert!(f.ledger.holders_of(&yld).is_empty());
        assert_eq!(f.ledger.account(&AccountId::new("alice")).unwrap().cash, 1000.0);
        let asset = f.registry.get(&yld).unwrap();
        assert_eq!(asset.read().status, AssetStatus::Removed);
        assert_eq!(asset.read().final_price, Some(42.0));
        assert_eq!(f.registry.active_ids(), vec![AssetId::new("FAR")]);
        assert_eq!(f.service.settled_count(), 1);

        let persisted = f.repo.load_assets().unwrap();
        assert_eq!(persisted[0].status, AssetStatus::Removed);
    }

    #[test]
    fn test_settle_twice_is_rejected() {
        let f = fixture();
        let yld = AssetId::new("YLD");
        f.service.settle_asset(&yld).unwrap();
        assert!(f.service.settle_asset(&yld).is_err());
    }

    #[test]
    fn test_resumes_frozen_asset_at_frozen_price() {
        let f = fixture();
        let alice = AccountId::new("alice");
        let yld = AssetId::new("YLD");
        f.ledger.open_account(alice.clone(), 1000.0).unwrap();
        f.executor.execute(&alice, &yld, OrderSide::Buy, 20.0).unwrap();

        // Interrupted right after the freeze
        {
            let handle = f.registry.get(&yld).unwrap();
            let mut asset = handle.write();
            asset.freeze().unwrap();
            asset.current_price = 99.0;
        }

        let reports = f.service.scan();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].final_price, 42.0);
        assert_eq!(reports[0].settled.len(), 1);
        assert!(f.ledger.holders_of(&yld).is_empty());
        assert_eq!(f.ledger.account(&alice).unwrap().cash, 1000.0);
        assert_eq!(f.registry.get(&yld).unwrap().read().status, AssetStatus::Removed);
        assert!(f.service.scan().is_empty());
    }

    #[test]
    fn test_resumes_settled_asset_without_liquidating() {
        let f = fixture();
        let yld = AssetId::new("YLD");
        let settled_at = f.clock.now();
        {
            let handle = f.registry.get(&yld).unwrap();
            let mut asset = handle.write();
            asset.freeze().unwrap();
            asset.transition(AssetStatus::Settled).unwrap();
            asset.settled_at = Some(settled_at);
        }
        f.clock.advance(chrono::Duration::minutes(1));

        let report = f.service.settle_asset(&yld).unwrap();
        assert!(report.settled.is_empty());
        assert_eq!(report.settled_at, settled_at);
        assert_eq!(f.registry.get(&yld).unwrap().read().status, AssetStatus::Removed);
    }

    #[test]
    fn test_purge_removed_after_retention() {
        let f = fixture();
        let yld = AssetId::new("YLD");
        f.clock.advance(chrono::Duration::minutes(5));
        f.service.scan();

        assert!(f.service.purge_removed(chrono::Duration::days(30)).is_empty());
        f.clock.advance(chrono::Duration::days(31));
        assert_eq!(f.service.purge_removed(chrono::Duration::days(30)), vec![yld.clone()]);
        assert!(!f.registry.contains(&yld));
    }
}
