//! Asset listing and pool maintenance

use super::asset::{Asset, AssetListing, AssetSnapshot};
use super::clock::Clock;
use super::registry::AssetRegistry;
use crate::config::ListingConfig;
use crate::error::EngineResult;
use crate::types::AssetId;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, LogNormal, Normal};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYMBOL_ATTEMPTS: usize = 100;

/// Lists new assets and keeps the active pool topped up
pub struct AssetLister {
    registry: Arc<AssetRegistry>,
    clock: Arc<dyn Clock>,
    config: ListingConfig,
    history_window: usize,
    rng: Mutex<StdRng>,
}

impl AssetLister {
    pub fn new(
        registry: Arc<AssetRegistry>,
        clock: Arc<dyn Clock>,
        config: ListingConfig,
        history_window: usize,
        seed: Option<u64>,
    ) -> Self {
        // Offset so listings don't mirror the price noise under the same seed
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Self {
            registry,
            clock,
            config,
            history_window,
            rng: Mutex::new(rng),
        }
    }

    /// List an asset with explicit parameters
    pub fn list(&self, listing: AssetListing) -> EngineResult<AssetSnapshot> {
        let now = self.clock.now();
        let asset = Asset::new(listing, now, self.history_window)?;
        let snapshot = asset.snapshot(now);
        self.registry.insert(asset)?;

        info!(
            "Listed {} at {:.2} (vol {:.4}, expires {})",
            snapshot.symbol, snapshot.current_price, snapshot.volatility, snapshot.expires_at
        );
        Ok(snapshot)
    }

    /// Unused random symbol, three letters unless that space is crowded
    pub fn generate_symbol(&self) -> AssetId {
        let mut rng = self.rng.lock();
        for attempt in 0..SYMBOL_ATTEMPTS * 2 {
            let len = if attempt < SYMBOL_ATTEMPTS { 3 } else { 4 };
            let symbol: String = (0..len)
                .map(|_| char::from(b'A' + rng.gen_range(0..26u8)))
                .collect();
            let id = AssetId::new(symbol);
            if id.validate() && !self.registry.contains(&id) {
                return id;
            }
        }
        // Five letters from here on; the space is too large to exhaust
        loop {
            let symbol: String = (0..5)
                .map(|_| char::from(b'A' + rng.gen_range(0..26u8)))
                .collect();
            let id = AssetId::new(symbol);
            if !self.registry.contains(&id) {
                return id;
            }
        }
    }

    /// Random listing parameters drawn from the configured distributions
    pub fn random_listing(&self) -> AssetListing {
        let symbol = self.generate_symbol();
        let cfg = &self.config;
        let mut rng = self.rng.lock();

        let volatility = match LogNormal::new(cfg.base_volatility.ln(), cfg.volatility_dispersion) {
            Ok(dist) => dist.sample(&mut *rng),
            Err(e) => {
                warn!("Volatility distribution unavailable ({}), using base", e);
                cfg.base_volatility
            }
        }
        .clamp(cfg.min_volatility, cfg.max_volatility);

        let drift = if cfg.drift_std > 0.0 {
            match Normal::new(0.0, cfg.drift_std) {
                Ok(dist) => dist.sample(&mut *rng).clamp(-volatility, volatility),
                Err(_) => 0.0,
            }
        } else {
            0.0
        };

        let extra = (cfg.mean_expiry_minutes - cfg.min_expiry_minutes).max(1.0);
        let expiry_minutes = match Exp::new(1.0 / extra) {
            Ok(dist) => cfg.min_expiry_minutes + dist.sample(&mut *rng),
            Err(_) => cfg.mean_expiry_minutes,
        }
        .min(cfg.max_expiry_minutes);

        let expires_at =
            self.clock.now() + chrono::Duration::milliseconds((expiry_minutes * 60_000.0) as i64);

        AssetListing {
            symbol,
            initial_price: cfg.initial_asset_price,
            volatility,
            drift,
            expires_at,
        }
    }

    /// List `count` randomly parameterized assets
    pub fn create_assets(&self, count: usize) -> Vec<AssetSnapshot> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            match self.list(self.random_listing()) {
                Ok(snapshot) => created.push(snapshot),
                Err(e) => warn!("Failed to list random asset: {}", e),
            }
        }
        created
    }

    /// Top the active set back up to the configured minimum
    pub fn maintain_pool(&self) -> Vec<AssetSnapshot> {
        let active = self.registry.active_count();
        let missing = self.config.min_active_assets.saturating_sub(active);
        if missing == 0 {
            debug!("Asset pool healthy: {} active", active);
            return Vec::new();
        }
        info!("Replenishing asset pool: {} active, listing {}", active, missing);
        self.create_assets(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::market_data::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn lister(config: ListingConfig) -> (AssetLister, Arc<AssetRegistry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let registry = Arc::new(AssetRegistry::new());
        let lister = AssetLister::new(registry.clone(), clock.clone(), config, 100, Some(3));
        (lister, registry, clock)
    }

    #[test]
    fn test_random_listing_within_bounds() {
        let config = ListingConfig {
            drift_std: 0.01,
            ..ListingConfig::default()
        };
        let (lister, _registry, clock) = lister(config.clone());
        let now = clock.now();

        for _ in 0..200 {
            let listing = lister.random_listing();
            assert!(listing.symbol.validate());
            assert!(listing.volatility >= config.min_volatility);
            assert!(listing.volatility <= config.max_volatility);
            assert!(listing.drift.abs() <= listing.volatility);

            let minutes = (listing.expires_at - now).num_seconds() as f64 / 60.0;
            assert!(minutes >= config.min_expiry_minutes - 1e-6, "{minutes}");
            assert!(minutes <= config.max_expiry_minutes + 1e-6, "{minutes}");
        }
    }

    #[test]
    fn test_zero_drift_std_gives_martingale() {
        let (lister, _registry, _clock) = lister(ListingConfig::default());
        for _ in 0..50 {
            assert_eq!(lister.random_listing().drift, 0.0);
        }
    }

    #[test]
    fn test_maintain_pool_fills_to_minimum() {
        let config = ListingConfig {
            min_active_assets: 5,
            ..ListingConfig::default()
        };
        let (lister, registry, _clock) = lister(config);

        assert_eq!(lister.maintain_pool().len(), 5);
        assert_eq!(registry.active_count(), 5);
        assert!(lister.maintain_pool().is_empty());
    }

    #[test]
    fn test_list_rejects_duplicates_and_bad_symbols() {
        let (lister, _registry, clock) = lister(ListingConfig::default());
        let listing = AssetListing {
            symbol: AssetId::new("XQR"),
            initial_price: 50.0,
            volatility: 0.02,
            drift: 0.0,
            expires_at: clock.now() + chrono::Duration::minutes(30),
        };

        let snapshot = lister.list(listing.clone()).unwrap();
        assert_eq!(snapshot.current_price, 50.0);
        assert!(matches!(lister.list(listing.clone()), Err(EngineError::AssetExists(_))));

        let reserved = AssetListing {
            symbol: AssetId::new("ADMIN"),
            ..listing
        };
        assert!(matches!(lister.list(reserved), Err(EngineError::InvalidSymbol(_))));
    }

    #[test]
    fn test_generated_symbols_are_unique() {
        let (lister, registry, _clock) = lister(ListingConfig::default());
        lister.create_assets(40);
        assert_eq!(registry.len(), 40);
    }
}
