//! Engine configuration
//!
//! Every field has a default, so a TOML file only needs the values it
//! overrides.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Parameters for generating replacement assets
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListingConfig {
    /// Keep at least this many assets tradable
    pub min_active_assets: usize,
    pub initial_asset_price: f64,
    /// Median per-tick volatility of new assets
    pub base_volatility: f64,
    /// Log-space spread of sampled volatilities
    pub volatility_dispersion: f64,
    pub min_volatility: f64,
    pub max_volatility: f64,
    /// Standard deviation of per-tick drift; zero keeps prices a martingale
    pub drift_std: f64,
    pub min_expiry_minutes: f64,
    pub mean_expiry_minutes: f64,
    pub max_expiry_minutes: f64,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            min_active_assets: 16,
            initial_asset_price: 100.0,
            base_volatility: 0.05,
            volatility_dispersion: 0.5,
            min_volatility: 0.001,
            max_volatility: 0.20,
            drift_std: 0.0,
            min_expiry_minutes: 5.0,
            mean_expiry_minutes: 120.0,
            max_expiry_minutes: 480.0,
        }
    }
}

/// Trading engine configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub initial_cash: f64,
    pub tick_interval_ms: u64,
    pub settlement_interval_ms: u64,
    /// Defaults to the tick interval when unset
    pub leaderboard_interval_ms: Option<u64>,
    /// Price samples kept per asset
    pub history_window: usize,
    /// Global transactions kept for time & sales
    pub journal_window: usize,
    /// Events buffered per subscribed session
    pub session_buffer: usize,
    pub price_floor: f64,
    /// Days a removed asset stays queryable
    pub removed_retention_days: i64,
    /// Create assets on start and after settlements
    pub auto_list: bool,
    /// Seed for price noise and listings; entropy when unset
    pub seed: Option<u64>,
    pub listing: ListingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_cash: 100_000.0,
            tick_interval_ms: 1_000,
            settlement_interval_ms: 1_000,
            leaderboard_interval_ms: None,
            history_window: 100,
            journal_window: 1_000,
            session_buffer: 1_024,
            price_floor: 0.01,
            removed_retention_days: 30,
            auto_list: true,
            seed: None,
            listing: ListingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load config from the given TOML file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.initial_cash.is_finite() && self.initial_cash >= 0.0,
            "initial_cash must be a non-negative number"
        );
        ensure!(self.tick_interval_ms > 0, "tick_interval_ms must be positive");
        ensure!(
            self.settlement_interval_ms > 0,
            "settlement_interval_ms must be positive"
        );
        ensure!(
            self.leaderboard_interval_ms != Some(0),
            "leaderboard_interval_ms must be positive"
        );
        ensure!(self.history_window > 0, "history_window must be positive");
        ensure!(self.journal_window > 0, "journal_window must be positive");
        ensure!(self.session_buffer > 0, "session_buffer must be positive");
        ensure!(
            self.price_floor.is_finite() && self.price_floor >= 0.01,
            "price_floor must be at least 0.01"
        );

        let listing = &self.listing;
        ensure!(
            listing.initial_asset_price.is_finite() && listing.initial_asset_price > 0.0,
            "listing.initial_asset_price must be positive"
        );
        ensure!(
            listing.min_volatility >= 0.0 && listing.min_volatility <= listing.max_volatility,
            "listing volatility bounds are inverted"
        );
        ensure!(
            listing.base_volatility > 0.0,
            "listing.base_volatility must be positive"
        );
        ensure!(
            listing.volatility_dispersion >= 0.0 && listing.drift_std >= 0.0,
            "listing dispersion and drift_std must be non-negative"
        );
        ensure!(
            listing.min_expiry_minutes > 0.0
                && listing.min_expiry_minutes <= listing.max_expiry_minutes,
            "listing expiry bounds are invalid"
        );
        ensure!(
            listing.mean_expiry_minutes > 0.0,
            "listing.mean_expiry_minutes must be positive"
        );
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn settlement_interval(&self) -> Duration {
        Duration::from_millis(self.settlement_interval_ms)
    }

    pub fn leaderboard_interval(&self) -> Duration {
        Duration::from_millis(self.leaderboard_interval_ms.unwrap_or(self.tick_interval_ms))
    }

    pub fn removed_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.removed_retention_days)
    }
}
