//! Account ranking with coalesced recomputation

use super::position_manager::{Account, Position, PositionLedger};
use crate::market_data::AssetRegistry;
use crate::types::{AccountId, AssetId};
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    /// 1-based
    pub rank: usize,
    pub account: AccountId,
    pub cash: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_pnl: f64,
    pub portfolio_value: f64,
}

/// Rank accounts by total P&L, descending, ties broken by account id
pub fn rank(
    accounts: &[Account],
    positions: &[Position],
    prices: &HashMap<AssetId, f64>,
) -> Vec<LeaderboardEntry> {
    let mut marks: HashMap<&AccountId, (f64, f64)> = HashMap::new();
    for position in positions {
        let price = prices.get(&position.asset).copied().unwrap_or(position.vwap);
        let (unrealized, value) = marks.entry(&position.account).or_insert((0.0, 0.0));
        *unrealized += position.unrealized_pnl(price);
        *value += position.market_value(price);
    }

    let mut entries: Vec<LeaderboardEntry> = accounts
        .iter()
        .map(|account| {
            let (unrealized_pnl, positions_value) =
                marks.get(&account.id).copied().unwrap_or((0.0, 0.0));
            LeaderboardEntry {
                rank: 0,
                account: account.id.clone(),
                cash: account.cash,
                realized_pnl: account.realized_pnl,
                unrealized_pnl,
                total_pnl: account.realized_pnl + unrealized_pnl,
                portfolio_value: account.cash + positions_value,
            }
        })
        .collect();

    entries.sort_by_key(|e| (Reverse(OrderedFloat(e.total_pnl)), e.account.clone()));
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i + 1;
    }
    entries
}

/// Set by any state change, consumed by the next recompute
#[derive(Debug, Default)]
pub struct DirtyFlag(AtomicBool);

impl DirtyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether it was set
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_dirty(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct Leaderboard {
    ledger: Arc<PositionLedger>,
    registry: Arc<AssetRegistry>,
    dirty: Arc<DirtyFlag>,
    latest: RwLock<Vec<LeaderboardEntry>>,
    recomputes: AtomicU64,
}

impl Leaderboard {
    pub fn new(
        ledger: Arc<PositionLedger>,
        registry: Arc<AssetRegistry>,
        dirty: Arc<DirtyFlag>,
    ) -> Self {
        Self {
            ledger,
            registry,
            dirty,
            latest: RwLock::new(Vec::new()),
            recomputes: AtomicU64::new(0),
        }
    }

    /// Fresh ranking from current state
    pub fn compute(&self) -> Vec<LeaderboardEntry> {
        // One map at a time, never nested. A fill landing between these
        // reads can leave this ranking briefly inconsistent; fills mark the
        // flag after committing, so the next refresh corrects it.
        let accounts = self.ledger.accounts();
        let positions = self.ledger.all_positions();
        let prices = self.registry.prices();

        let entries = rank(&accounts, &positions, &prices);
        *self.latest.write() = entries.clone();
        self.recomputes.fetch_add(1, Ordering::Relaxed);
        entries
    }

    /// Recompute only if something changed since the last refresh
    pub fn refresh_if_dirty(&self) -> Option<Vec<LeaderboardEntry>> {
        if !self.dirty.take() {
            return None;
        }
        let entries = self.compute();
        debug!("Leaderboard recomputed for {} accounts", entries.len());
        Some(entries)
    }

    /// Last published ranking
    pub fn latest(&self) -> Vec<LeaderboardEntry> {
        self.latest.read().clone()
    }

    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }

    pub fn dirty(&self) -> &Arc<DirtyFlag> {
        &self.dirty
    }
}
