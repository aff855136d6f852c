//! Expiring asset model and lifecycle

use crate::error::{EngineError, EngineResult};
use crate::types::AssetId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Asset lifecycle: `Active -> Expiring -> Settled -> Removed`
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Active,
    /// Price frozen, positions being liquidated
    Expiring,
    Settled,
    /// Out of the active set; history stays readable
    Removed,
}

impl AssetStatus {
    pub fn is_tradable(self) -> bool {
        matches!(self, AssetStatus::Active)
    }

    pub fn can_transition_to(self, next: AssetStatus) -> bool {
        matches!(
            (self, next),
            (AssetStatus::Active, AssetStatus::Expiring)
                | (AssetStatus::Expiring, AssetStatus::Settled)
                | (AssetStatus::Settled, AssetStatus::Removed)
        )
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetStatus::Active => write!(f, "active"),
            AssetStatus::Expiring => write!(f, "expiring"),
            AssetStatus::Settled => write!(f, "settled"),
            AssetStatus::Removed => write!(f, "removed"),
        }
    }
}

/// One timestamped price sample
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

/// Parameters for listing a new asset
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AssetListing {
    pub symbol: AssetId,
    pub initial_price: f64,
    pub volatility: f64,
    pub drift: f64,
    pub expires_at: DateTime<Utc>,
}

/// Tradable asset with a fixed expiration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub symbol: AssetId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub initial_price: f64,
    pub current_price: f64,
    pub volatility: f64,
    pub drift: f64,
    pub status: AssetStatus,
    pub final_price: Option<f64>,
    pub settled_at: Option<DateTime<Utc>>,
    pub history: VecDeque<PricePoint>,
    pub history_window: usize,
}

impl Asset {
    pub fn new(
        listing: AssetListing,
        created_at: DateTime<Utc>,
        history_window: usize,
    ) -> EngineResult<Self> {
        if !listing.symbol.validate() {
            return Err(EngineError::InvalidSymbol(listing.symbol.0));
        }
        if !listing.initial_price.is_finite() || listing.initial_price <= 0.0 {
            return Err(EngineError::InvalidPrice(listing.initial_price));
        }
        if listing.expires_at <= created_at {
            return Err(EngineError::AssetExpired(listing.symbol));
        }
        if !listing.volatility.is_finite() || listing.volatility < 0.0 || !listing.drift.is_finite() {
            return Err(EngineError::Invariant(format!(
                "asset {} has invalid price model (volatility {}, drift {})",
                listing.symbol, listing.volatility, listing.drift
            )));
        }

        let window = history_window.max(1);
        let mut history = VecDeque::with_capacity(window);
        history.push_back(PricePoint {
            timestamp: created_at,
            price: listing.initial_price,
        });

        Ok(Self {
            symbol: listing.symbol,
            created_at,
            expires_at: listing.expires_at,
            initial_price: listing.initial_price,
            current_price: listing.initial_price,
            volatility: listing.volatility,
            drift: listing.drift,
            status: AssetStatus::Active,
            final_price: None,
            settled_at: None,
            history,
            history_window: window,
        })
    }

    /// Append a sample and move the current price, dropping the oldest
    /// samples past the window
    pub fn record_price(&mut self, timestamp: DateTime<Utc>, price: f64) {
        self.current_price = price;
        self.history.push_back(PricePoint { timestamp, price });
        while self.history.len() > self.history_window {
            self.history.pop_front();
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Accepts orders and ticks only while active and before expiry
    pub fn is_tradable_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_tradable() && !self.is_expired_at(now)
    }

    pub fn time_to_expiry(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.expires_at - now).max(chrono::Duration::zero())
    }

    pub fn transition(&mut self, next: AssetStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Invariant(format!(
                "asset {} cannot move from {} to {}",
                self.symbol, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Move to `Expiring` and pin the final price at the last tick
    pub fn freeze(&mut self) -> EngineResult<f64> {
        self.transition(AssetStatus::Expiring)?;
        self.final_price = Some(self.current_price);
        Ok(self.current_price)
    }

    /// Most recent samples, oldest first
    pub fn history_tail(&self, limit: Option<usize>) -> Vec<PricePoint> {
        let skip = limit
            .map(|n| self.history.len().saturating_sub(n))
            .unwrap_or(0);
        self.history.iter().skip(skip).copied().collect()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> AssetSnapshot {
        AssetSnapshot {
            symbol: self.symbol.clone(),
            status: self.status,
            current_price: self.current_price,
            initial_price: self.initial_price,
            volatility: self.volatility,
            drift: self.drift,
            created_at: self.created_at,
            expires_at: self.expires_at,
            seconds_to_expiry: self.time_to_expiry(now).num_seconds(),
            final_price: self.final_price,
        }
    }
}

/// Read-only view of an asset
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AssetSnapshot {
    pub symbol: AssetId,
    pub status: AssetStatus,
    pub current_price: f64,
    pub initial_price: f64,
    pub volatility: f64,
    pub drift: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub seconds_to_expiry: i64,
    pub final_price: Option<f64>,
}
