//! Martingale Paper Trading Library
//!
//! Simulated trading over synthetic assets that expire. Prices follow a
//! per-asset random walk, positions are tracked at VWAP, and every holder
//! is cashed out at the last price when an asset expires.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod market_data;
pub mod paper_trading;
pub mod repository;
pub mod types;

// Re-export main types for easy access
pub use broadcast::{BroadcastGateway, EngineEvent, EventStream};
pub use config::{EngineConfig, ListingConfig};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use market_data::{
    AssetListing, AssetSnapshot, AssetStatus, Clock, GaussianNoise, ManualClock, NoiseSource,
    PricePoint, ScriptedNoise, SystemClock,
};
pub use paper_trading::{
    Account, LeaderboardEntry, PerformanceSnapshot, PortfolioSnapshot, Position,
    SettlementReport, TradingEngine, Transaction,
};
pub use repository::{InMemoryRepository, Repository};
pub use types::{AccountId, AssetId, OrderSide, SessionId, TransactionKind};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let config = EngineConfig {
            tick_interval_ms: 5,
            settlement_interval_ms: 5,
            seed: Some(42),
            ..EngineConfig::default()
        };
        let engine = TradingEngine::new(config).unwrap();

        assert!(engine.start().await.is_ok());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(engine.get_active_assets().len(), 16);
        assert!(engine.stop().await.is_ok());
        assert!(engine.stop().await.is_ok());
    }

    #[test]
    fn test_expired_asset_cycle_with_manual_clock() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let config = EngineConfig {
            listing: ListingConfig {
                min_active_assets: 4,
                ..ListingConfig::default()
            },
            seed: Some(9),
            ..EngineConfig::default()
        };
        let engine = TradingEngine::builder(config)
            .clock(clock.clone())
            .build()
            .unwrap();

        let trader = AccountId::new("trader");
        engine.open_account(trader.clone()).unwrap();
        let asset = engine
            .list_asset(AssetListing {
                symbol: AssetId::new("EXP"),
                initial_price: 25.0,
                volatility: 0.05,
                drift: 0.0,
                expires_at: start + chrono::Duration::minutes(1),
            })
            .unwrap()
            .symbol;
        engine
            .submit_order(&trader, &asset, OrderSide::Buy, 8.0)
            .unwrap();
        for _ in 0..5 {
            engine.tick(&asset).unwrap();
        }

        clock.advance(chrono::Duration::minutes(2));
        let reports = engine.run_settlement_cycle();
        assert_eq!(reports.len(), 1);

        // Settlement refilled the pool
        assert_eq!(engine.get_active_assets().len(), 4);
        assert!(engine.get_portfolio(&trader).unwrap().positions.is_empty());
        assert!(matches!(
            engine.submit_order(&trader, &asset, OrderSide::Sell, 1.0),
            Err(EngineError::AssetExpired(_))
        ));
        let json = EngineEvent::AssetSettled {
            asset,
            final_price: reports[0].final_price,
        }
        .to_json()
        .unwrap();
        assert!(json.contains("\"asset_settled\""));
    }
}
