//! Order execution against current asset prices

use super::journal::Transaction;
use super::leaderboard::DirtyFlag;
use super::position_manager::{Fill, PositionLedger};
use crate::broadcast::{BroadcastGateway, EngineEvent};
use crate::error::{EngineError, EngineResult};
use crate::market_data::{AssetRegistry, Clock};
use crate::types::{AccountId, AssetId, OrderSide, TransactionKind};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Smallest accepted order size
pub const MIN_QUANTITY: f64 = 1e-8;
/// Largest accepted order size
pub const MAX_QUANTITY: f64 = 1e9;

/// Largest accepted order value
pub const MAX_TRADE_VALUE: f64 = 1e10;
/// Execution price bounds
pub const MIN_PRICE: f64 = 0.01;
pub const MAX_PRICE: f64 = 1e9;

pub fn validate_quantity(quantity: f64) -> EngineResult<()> {
    if quantity.is_finite() && (MIN_QUANTITY..=MAX_QUANTITY).contains(&quantity) {
        Ok(())
    } else {
        Err(EngineError::InvalidQuantity(quantity))
    }
}

pub fn validate_price(price: f64) -> EngineResult<()> {
    if price.is_finite() && (MIN_PRICE..=MAX_PRICE).contains(&price) {
        Ok(())
    } else {
        Err(EngineError::InvalidPrice(price))
    }
}

pub fn validate_trade_value(quantity: f64, price: f64) -> EngineResult<()> {
    let value = quantity * price;
    if value <= MAX_TRADE_VALUE {
        Ok(())
    } else {
        Err(EngineError::TradeValueExceeded {
            value,
            limit: MAX_TRADE_VALUE,
        })
    }
}

/// Executor statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionStats {
    pub accepted: u64,
    pub rejected: u64,
    pub settlements: u64,
}

/// Validates orders and routes them into the ledger
pub struct OrderExecutor {
    registry: Arc<AssetRegistry>,
    ledger: Arc<PositionLedger>,
    gateway: Arc<BroadcastGateway>,
    dirty: Arc<DirtyFlag>,
    clock: Arc<dyn Clock>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    settlements: AtomicU64,
}

impl OrderExecutor {
    pub fn new(
        registry: Arc<AssetRegistry>,
        ledger: Arc<PositionLedger>,
        gateway: Arc<BroadcastGateway>,
        dirty: Arc<DirtyFlag>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            ledger,
            gateway,
            dirty,
            clock,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            settlements: AtomicU64::new(0),
        }
    }

    /// Fill an order at the asset's current price
    pub fn execute(
        &self,
        account: &AccountId,
        asset: &AssetId,
        side: OrderSide,
        quantity: f64,
    ) -> EngineResult<Transaction> {
        match self.fill(account, asset, side, quantity) {
            Ok(fill) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Order filled: {} {} {} {} @ {:.4}",
                    account, side, fill.transaction.quantity, asset, fill.transaction.price
                );
                self.confirm(&fill);
                Ok(fill.transaction)
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Order rejected: {} {} {} {}: {}", account, side, quantity, asset, e);
                Err(e)
            }
        }
    }

    fn fill(
        &self,
        account: &AccountId,
        asset: &AssetId,
        side: OrderSide,
        quantity: f64,
    ) -> EngineResult<Fill> {
        validate_quantity(quantity)?;
        let handle = self.registry.get(asset)?;

        // Shared for the whole fill so ticks and the settlement freeze wait
        let guard = handle.read();
        if !guard.is_tradable_at(self.clock.now()) {
            return Err(EngineError::AssetExpired(asset.clone()));
        }
        if !self.ledger.has_account(account) {
            return Err(EngineError::AccountNotFound(account.clone()));
        }
        let price = guard.current_price;
        validate_price(price)?;

        match side {
            OrderSide::Buy => {
                validate_trade_value(quantity, price)?;
                self.ledger.apply_buy(account, asset, quantity, price)
            }
            OrderSide::Sell => {
                validate_trade_value(quantity, price)?;
                self.ledger.apply_sell(account, asset, quantity, price)
            }
            OrderSide::SellAll => self
                .ledger
                .liquidate_all(account, asset, price, TransactionKind::Sell)?
                .ok_or_else(|| EngineError::InsufficientPosition {
                    asset: asset.clone(),
                    requested: quantity,
                    held: 0.0,
                }),
        }
    }

    /// Close a position at the settlement price, recording a settlement
    pub fn force_liquidate(
        &self,
        account: &AccountId,
        asset: &AssetId,
        final_price: f64,
    ) -> EngineResult<Option<Transaction>> {
        let fill = self
            .ledger
            .liquidate_all(account, asset, final_price, TransactionKind::Settlement)?;
        Ok(fill.map(|fill| {
            self.settlements.fetch_add(1, Ordering::Relaxed);
            self.confirm(&fill);
            fill.transaction
        }))
    }

    fn confirm(&self, fill: &Fill) {
        self.gateway.publish(EngineEvent::TradeConfirmed {
            account: fill.transaction.account.clone(),
            transaction: fill.transaction.clone(),
        });
        self.dirty.mark();
    }

    pub fn stats(&self) -> ExecutionStats {
        ExecutionStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            settlements: self.settlements.load(Ordering::Relaxed),
        }
    }
}
