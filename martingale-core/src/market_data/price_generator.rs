//! Per-asset random-walk price generation

use super::asset::PricePoint;
use super::clock::Clock;
use super::noise::NoiseSource;
use super::registry::AssetRegistry;
use crate::error::EngineResult;
use crate::types::AssetId;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Next price of the walk: `price * (1 + drift + volatility * z)`, floored.
/// A step that overflows or is NaN leaves the price where it was.
pub fn next_price(price: f64, drift: f64, volatility: f64, z: f64, floor: f64) -> f64 {
    let candidate = price * (1.0 + drift + volatility * z);
    if candidate.is_finite() {
        candidate.max(floor)
    } else {
        price.max(floor)
    }
}

/// Advances asset prices one tick at a time
pub struct PriceGenerator {
    registry: Arc<AssetRegistry>,
    noise: Mutex<Box<dyn NoiseSource>>,
    clock: Arc<dyn Clock>,
    price_floor: f64,
}

impl PriceGenerator {
    pub fn new(
        registry: Arc<AssetRegistry>,
        noise: Box<dyn NoiseSource>,
        clock: Arc<dyn Clock>,
        price_floor: f64,
    ) -> Self {
        Self {
            registry,
            noise: Mutex::new(noise),
            clock,
            price_floor,
        }
    }

    /// Produce and record the next price. Returns `None` without touching
    /// the asset once it is frozen or past its expiration.
    pub fn tick(&self, symbol: &AssetId) -> EngineResult<Option<PricePoint>> {
        let handle = self.registry.get(symbol)?;

        // Draw before locking so other assets never wait on this one
        let z = self.noise.lock().sample();
        let now = self.clock.now();

        let mut asset = handle.write();
        if !asset.is_tradable_at(now) {
            debug!("Skipping tick for {} ({})", symbol, asset.status);
            return Ok(None);
        }

        let price = next_price(asset.current_price, asset.drift, asset.volatility, z, self.price_floor);
        asset.record_price(now, price);

        Ok(Some(PricePoint {
            timestamp: now,
            price,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::market_data::asset::{Asset, AssetListing};
    use crate::market_data::clock::ManualClock;
    use crate::market_data::noise::{GaussianNoise, ScriptedNoise};
    use chrono::{TimeZone, Utc};

    fn setup(noise: Box<dyn NoiseSource>) -> (PriceGenerator, Arc<AssetRegistry>, Arc<ManualClock>) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let registry = Arc::new(AssetRegistry::new());
        registry
            .insert(
                Asset::new(
                    AssetListing {
                        symbol: AssetId::new("XQR"),
                        initial_price: 100.0,
                        volatility: 0.1,
                        drift: 0.0,
                        expires_at: start + chrono::Duration::minutes(10),
                    },
                    start,
                    50,
                )
                .unwrap(),
            )
            .unwrap();
        let generator = PriceGenerator::new(registry.clone(), noise, clock.clone(), 0.01);
        (generator, registry, clock)
    }

    #[test]
    fn test_next_price_formula() {
        assert!((next_price(100.0, 0.0, 0.1, 1.0, 0.01) - 110.0).abs() < 1e-9);
        assert!((next_price(100.0, 0.01, 0.1, -1.0, 0.01) - 91.0).abs() < 1e-9);
        assert_eq!(next_price(100.0, 0.0, 0.5, -3.0, 0.01), 0.01);
        assert_eq!(next_price(100.0, 0.0, 0.1, f64::INFINITY, 0.01), 100.0);
        assert_eq!(next_price(100.0, 0.0, 0.1, f64::NAN, 0.01), 100.0);
        assert_eq!(next_price(1e308, 0.0, 0.5, 10.0, 0.01), 1e308);
    }

    #[test]
    fn test_non_finite_noise_keeps_price() {
        let (generator, registry, clock) = setup(Box::new(ScriptedNoise::new([f64::NAN, 1.0])));
        let symbol = AssetId::new("XQR");

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(generator.tick(&symbol).unwrap().unwrap().price, 100.0);
        clock.advance(chrono::Duration::seconds(1));
        assert!((generator.tick(&symbol).unwrap().unwrap().price - 110.0).abs() < 1e-9);
        assert_eq!(registry.get(&symbol).unwrap().read().history.len(), 3);
    }

    #[test]
    fn test_tick_appends_history() {
        let (generator, registry, clock) = setup(Box::new(ScriptedNoise::new([1.0, -1.0])));
        let symbol = AssetId::new("XQR");

        clock.advance(chrono::Duration::seconds(1));
        let first = generator.tick(&symbol).unwrap().unwrap();
        assert!((first.price - 110.0).abs() < 1e-9);

        clock.advance(chrono::Duration::seconds(1));
        let second = generator.tick(&symbol).unwrap().unwrap();
        assert!((second.price - 99.0).abs() < 1e-9);

        let handle = registry.get(&symbol).unwrap();
        let asset = handle.read();
        assert_eq!(asset.history.len(), 3);
        assert_eq!(asset.current_price, second.price);
        assert_eq!(asset.history.back().unwrap().timestamp, clock.now());
    }

    #[test]
    fn test_tick_is_noop_after_expiry() {
        let (generator, registry, clock) = setup(Box::new(ScriptedNoise::new([1.0])));
        let symbol = AssetId::new("XQR");

        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(generator.tick(&symbol).unwrap(), None);
        assert_eq!(registry.current_price(&symbol), Some(100.0));
    }

    #[test]
    fn test_tick_is_noop_when_frozen() {
        let (generator, registry, _clock) = setup(Box::new(ScriptedNoise::new([1.0])));
        let symbol = AssetId::new("XQR");
        registry.get(&symbol).unwrap().write().freeze().unwrap();

        assert_eq!(generator.tick(&symbol).unwrap(), None);
        assert_eq!(generator.tick(&symbol).unwrap(), None);
        assert_eq!(registry.get(&symbol).unwrap().read().history.len(), 1);
    }

    #[test]
    fn test_tick_unknown_asset() {
        let (generator, _registry, _clock) = setup(Box::new(ScriptedNoise::flat()));
        assert!(matches!(
            generator.tick(&AssetId::new("NOPE")),
            Err(EngineError::AssetNotFound(_))
        ));
    }

    #[test]
    fn test_prices_stay_above_floor() {
        let (generator, registry, _clock) = setup(Box::new(GaussianNoise::seeded(11)));
        let symbol = AssetId::new("XQR");
        for _ in 0..500 {
            generator.tick(&symbol).unwrap();
        }
        let handle = registry.get(&symbol).unwrap();
        let asset = handle.read();
        assert_eq!(asset.history.len(), 50);
        assert!(asset.history.iter().all(|p| p.price >= 0.01));
    }
}
