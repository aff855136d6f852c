//! Asset registry with one lock per asset

use super::asset::{Asset, AssetSnapshot, AssetStatus};
use crate::error::{EngineError, EngineResult};
use crate::types::AssetId;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub type AssetHandle = Arc<RwLock<Asset>>;

/// Every listed asset, including removed ones kept for history
pub struct AssetRegistry {
    assets: DashMap<AssetId, AssetHandle>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self {
            assets: DashMap::new(),
        }
    }

    pub fn insert(&self, asset: Asset) -> EngineResult<AssetHandle> {
        match self.assets.entry(asset.symbol.clone()) {
            Entry::Occupied(_) => Err(EngineError::AssetExists(asset.symbol)),
            Entry::Vacant(vacant) => {
                let handle = Arc::new(RwLock::new(asset));
                vacant.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Shared handle to an asset; the map shard is released before returning
    pub fn get(&self, symbol: &AssetId) -> EngineResult<AssetHandle> {
        self.assets
            .get(symbol)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::AssetNotFound(symbol.clone()))
    }

    pub fn contains(&self, symbol: &AssetId) -> bool {
        self.assets.contains_key(symbol)
    }

    fn handles(&self) -> Vec<AssetHandle> {
        self.assets.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn ids_with_status(&self, status: AssetStatus) -> Vec<AssetId> {
        let mut ids: Vec<AssetId> = self
            .handles()
            .into_iter()
            .filter_map(|handle| {
                let asset = handle.read();
                (asset.status == status).then(|| asset.symbol.clone())
            })
            .collect();
        ids.sort();
        ids
    }

    pub fn active_ids(&self) -> Vec<AssetId> {
        self.ids_with_status(AssetStatus::Active)
    }

    pub fn active_count(&self) -> usize {
        self.handles()
            .iter()
            .filter(|handle| handle.read().status.is_tradable())
            .count()
    }

    /// Snapshots of active assets ordered by expiry, soonest first
    pub fn active_snapshots(&self, now: DateTime<Utc>) -> Vec<AssetSnapshot> {
        let mut snapshots: Vec<AssetSnapshot> = self
            .handles()
            .into_iter()
            .filter_map(|handle| {
                let asset = handle.read();
                asset.status.is_tradable().then(|| asset.snapshot(now))
            })
            .collect();
        snapshots.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.symbol.cmp(&b.symbol)));
        snapshots
    }

    pub fn snapshot(&self, symbol: &AssetId, now: DateTime<Utc>) -> EngineResult<AssetSnapshot> {
        Ok(self.get(symbol)?.read().snapshot(now))
    }

    pub fn current_price(&self, symbol: &AssetId) -> Option<f64> {
        let handle = self.get(symbol).ok()?;
        let price = handle.read().current_price;
        Some(price)
    }

    /// Mark price of every asset: the current price while trading, the
    /// frozen final price once settlement has started
    pub fn prices(&self) -> HashMap<AssetId, f64> {
        self.handles()
            .into_iter()
            .map(|handle| {
                let asset = handle.read();
                let price = match asset.status {
                    AssetStatus::Active => asset.current_price,
                    _ => asset.final_price.unwrap_or(asset.current_price),
                };
                (asset.symbol.clone(), price)
            })
            .collect()
    }

    /// Expired active assets plus any whose settlement did not finish,
    /// in symbol order
    pub fn due_for_settlement(&self, now: DateTime<Utc>) -> Vec<AssetId> {
        let mut due: Vec<AssetId> = self
            .handles()
            .into_iter()
            .filter_map(|handle| {
                let asset = handle.read();
                let due = match asset.status {
                    AssetStatus::Active => asset.is_expired_at(now),
                    AssetStatus::Expiring | AssetStatus::Settled => true,
                    AssetStatus::Removed => false,
                };
                due.then(|| asset.symbol.clone())
            })
            .collect();
        due.sort();
        due
    }

    /// Removed assets settled before the cutoff
    pub fn removed_before(&self, cutoff: DateTime<Utc>) -> Vec<AssetId> {
        self.handles()
            .into_iter()
            .filter_map(|handle| {
                let asset = handle.read();
                let stale = asset.status == AssetStatus::Removed
                    && asset.settled_at.map(|t| t < cutoff).unwrap_or(false);
                stale.then(|| asset.symbol.clone())
            })
            .collect()
    }

    pub fn remove(&self, symbol: &AssetId) -> Option<AssetHandle> {
        self.assets.remove(symbol).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

impl Default for AssetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::asset::AssetListing;
    use chrono::TimeZone;

    fn asset(symbol: &str, minutes: i64) -> Asset {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        Asset::new(
            AssetListing {
                symbol: AssetId::new(symbol),
                initial_price: 100.0,
                volatility: 0.02,
                drift: 0.0,
                expires_at: now + chrono::Duration::minutes(minutes),
            },
            now,
            10,
        )
        .unwrap()
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = AssetRegistry::new();
        registry.insert(asset("XQR", 10)).unwrap();

        assert!(registry.contains(&AssetId::new("XQR")));
        assert_eq!(registry.current_price(&AssetId::new("XQR")), Some(100.0));
        assert!(matches!(
            registry.insert(asset("XQR", 20)),
            Err(EngineError::AssetExists(_))
        ));
        assert!(matches!(
            registry.get(&AssetId::new("NOPE")),
            Err(EngineError::AssetNotFound(_))
        ));
    }

    #[test]
    fn test_due_for_settlement() {
        let registry = AssetRegistry::new();
        registry.insert(asset("ZLN", 5)).unwrap();
        registry.insert(asset("FWX", 60)).unwrap();
        registry.insert(asset("ACT", 1)).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 10, 0).unwrap();
        assert_eq!(
            registry.due_for_settlement(now),
            vec![AssetId::new("ACT"), AssetId::new("ZLN")]
        );

        let snapshots = registry.active_snapshots(now);
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].symbol, AssetId::new("ACT"));
    }

    #[test]
    fn test_frozen_assets_leave_active_set() {
        let registry = AssetRegistry::new();
        let handle = registry.insert(asset("LNC", 5)).unwrap();
        registry.insert(asset("DQB", 5)).unwrap();

        handle.write().freeze().unwrap();

        assert_eq!(registry.active_ids(), vec![AssetId::new("DQB")]);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.prices().len(), 2);
        assert_eq!(
            registry.ids_with_status(AssetStatus::Expiring),
            vec![AssetId::new("LNC")]
        );
    }

    #[test]
    fn test_unfinished_settlements_stay_due() {
        let registry = AssetRegistry::new();
        let frozen = registry.insert(asset("LNC", 60)).unwrap();
        let settled = registry.insert(asset("DQB", 60)).unwrap();
        let removed = registry.insert(asset("RMV", 60)).unwrap();
        registry.insert(asset("FWX", 60)).unwrap();

        frozen.write().freeze().unwrap();
        {
            let mut asset = settled.write();
            asset.freeze().unwrap();
            asset.transition(AssetStatus::Settled).unwrap();
        }
        {
            let mut asset = removed.write();
            asset.freeze().unwrap();
            asset.transition(AssetStatus::Settled).unwrap();
            asset.transition(AssetStatus::Removed).unwrap();
        }

        // Due well before expiry, since these were already expired once
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap();
        assert_eq!(
            registry.due_for_settlement(now),
            vec![AssetId::new("DQB"), AssetId::new("LNC")]
        );
    }

    #[test]
    fn test_removed_assets_priced_at_final_price() {
        let registry = AssetRegistry::new();
        let handle = registry.insert(asset("RMV", 5)).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        {
            let mut asset = handle.write();
            asset.record_price(now, 80.0);
            asset.freeze().unwrap();
            asset.transition(AssetStatus::Settled).unwrap();
            asset.transition(AssetStatus::Removed).unwrap();
        }
        assert_eq!(registry.prices()[&AssetId::new("RMV")], 80.0);
    }
}
