//! Portfolio and performance read models

use super::position_manager::{Account, Position};
use crate::types::{AccountId, AssetId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One position marked at the current price
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PositionView {
    pub asset: AssetId,
    pub quantity: f64,
    pub vwap: f64,
    pub current_price: f64,
    pub cost_basis: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
}

impl PositionView {
    /// Marks at the VWAP when no current price is known
    pub fn mark(position: &Position, prices: &HashMap<AssetId, f64>) -> Self {
        let current_price = prices
            .get(&position.asset)
            .copied()
            .unwrap_or(position.vwap);
        Self {
            asset: position.asset.clone(),
            quantity: position.quantity,
            vwap: position.vwap,
            current_price,
            cost_basis: position.cost_basis(),
            market_value: position.market_value(current_price),
            unrealized_pnl: position.unrealized_pnl(current_price),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PortfolioSnapshot {
    pub account: AccountId,
    pub cash: f64,
    pub positions: Vec<PositionView>,
    pub positions_value: f64,
    pub total_value: f64,
    pub timestamp: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub fn build(
        account: &Account,
        positions: &[Position],
        prices: &HashMap<AssetId, f64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let positions: Vec<PositionView> = positions
            .iter()
            .map(|p| PositionView::mark(p, prices))
            .collect();
        let positions_value = positions.iter().map(|p| p.market_value).sum::<f64>();
        Self {
            account: account.id.clone(),
            cash: account.cash,
            positions,
            positions_value,
            total_value: account.cash + positions_value,
            timestamp,
        }
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions.iter().map(|p| p.unrealized_pnl).sum()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PerformanceSnapshot {
    pub account: AccountId,
    pub portfolio_value: f64,
    pub cash: f64,
    pub initial_cash: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_pnl: f64,
    /// Relative to initial cash; zero when the account started empty
    pub total_return_pct: f64,
}

impl PerformanceSnapshot {
    pub fn from_portfolio(account: &Account, portfolio: &PortfolioSnapshot) -> Self {
        let unrealized_pnl = portfolio.unrealized_pnl();
        let total_return_pct = if account.initial_cash > 0.0 {
            (portfolio.total_value - account.initial_cash) / account.initial_cash * 100.0
        } else {
            0.0
        };
        Self {
            account: account.id.clone(),
            portfolio_value: portfolio.total_value,
            cash: account.cash,
            initial_cash: account.initial_cash,
            realized_pnl: account.realized_pnl,
            unrealized_pnl,
            total_pnl: account.realized_pnl + unrealized_pnl,
            total_return_pct,
        }
    }
}
