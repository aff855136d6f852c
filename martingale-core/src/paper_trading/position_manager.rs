//! Position ledger for paper trading
//!
//! Cash and positions live in separate keyed maps. A mutation takes the
//! position entry first and the account entry second, and holds both until
//! the journal and repository have seen the fill.

use super::journal::{Transaction, TransactionJournal};
use crate::error::{EngineError, EngineResult};
use crate::market_data::Clock;
use crate::repository::Repository;
use crate::types::{AccountId, AssetId, TransactionKind};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Remaining quantities at or below this are treated as closed
pub const QUANTITY_EPSILON: f64 = 1e-9;

/// Trading account
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub cash: f64,
    pub initial_cash: f64,
    /// Lifetime realized P&L across all assets
    pub realized_pnl: f64,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, cash: f64, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            cash,
            initial_cash: cash,
            realized_pnl: 0.0,
            created_at,
        }
    }
}

/// Open long position in one asset
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub account: AccountId,
    pub asset: AssetId,
    pub quantity: f64,
    /// Volume-weighted average entry price
    pub vwap: f64,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn open(
        account: AccountId,
        asset: AssetId,
        quantity: f64,
        price: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            account,
            asset,
            quantity,
            vwap: price,
            opened_at: now,
            updated_at: now,
        }
    }

    /// Position after adding `quantity` at `price`
    fn with_buy(&self, quantity: f64, price: f64, now: DateTime<Utc>) -> Self {
        let total = self.quantity + quantity;
        Self {
            quantity: total,
            vwap: (self.quantity * self.vwap + quantity * price) / total,
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn cost_basis(&self) -> f64 {
        self.quantity * self.vwap
    }

    pub fn market_value(&self, price: f64) -> f64 {
        self.quantity * price
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.quantity * (price - self.vwap)
    }
}

/// Result of one ledger mutation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub transaction: Transaction,
    /// Position after the fill; `None` once closed
    pub position: Option<Position>,
    pub realized_pnl: f64,
    pub cash_after: f64,
}

fn validate_amount(quantity: f64) -> EngineResult<()> {
    if quantity.is_finite() && quantity > 0.0 {
        Ok(())
    } else {
        Err(EngineError::InvalidQuantity(quantity))
    }
}

fn validate_price(price: f64) -> EngineResult<()> {
    if price.is_finite() && price > 0.0 {
        Ok(())
    } else {
        Err(EngineError::InvalidPrice(price))
    }
}

/// Accounts, positions and their VWAP accounting
pub struct PositionLedger {
    accounts: DashMap<AccountId, Account>,
    positions: DashMap<(AccountId, AssetId), Position>,
    journal: Arc<TransactionJournal>,
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
}

impl PositionLedger {
    pub fn new(
        journal: Arc<TransactionJournal>,
        repository: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts: DashMap::new(),
            positions: DashMap::new(),
            journal,
            repository,
            clock,
        }
    }

    pub fn open_account(&self, id: AccountId, cash: f64) -> EngineResult<Account> {
        if !cash.is_finite() || cash < 0.0 {
            return Err(EngineError::InvalidQuantity(cash));
        }
        match self.accounts.entry(id.clone()) {
            Entry::Occupied(_) => Err(EngineError::AccountExists(id)),
            Entry::Vacant(vacant) => {
                let account = Account::new(id, cash, self.clock.now());
                self.persist("account", self.repository.save_account(&account));
                vacant.insert(account.clone());
                Ok(account)
            }
        }
    }

    /// Buy `quantity` at `price`, debiting cash and folding into the VWAP
    pub fn apply_buy(
        &self,
        account: &AccountId,
        asset: &AssetId,
        quantity: f64,
        price: f64,
    ) -> EngineResult<Fill> {
        validate_amount(quantity)?;
        validate_price(price)?;
        let now = self.clock.now();

        let entry = self.positions.entry((account.clone(), asset.clone()));
        let existing = match &entry {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(_) => None,
        };

        let mut acct = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| EngineError::AccountNotFound(account.clone()))?;

        let cost = quantity * price;
        if cost > acct.cash {
            return Err(EngineError::InsufficientFunds {
                required: cost,
                available: acct.cash,
            });
        }
        let cash_after = acct.cash - cost;
        if cash_after < 0.0 {
            error!("Buy would leave {} with negative cash {}", account, cash_after);
            return Err(EngineError::Invariant(format!(
                "negative cash {} for {}",
                cash_after, account
            )));
        }

        let position = match existing {
            Some(current) => current.with_buy(quantity, price, now),
            None => Position::open(account.clone(), asset.clone(), quantity, price, now),
        };

        acct.cash = cash_after;
        let _position_guard = entry.insert(position.clone());

        let transaction = Transaction::new(
            account.clone(),
            asset.clone(),
            TransactionKind::Buy,
            quantity,
            price,
            now,
            0.0,
        );
        self.persist("account", self.repository.save_account(&acct));
        self.persist("position", self.repository.save_position(&position));
        self.persist("transaction", self.repository.save_transaction(&transaction));
        self.journal.append(transaction.clone());

        debug!(
            "{} bought {} {} @ {:.4}, vwap now {:.4}",
            account, quantity, asset, price, position.vwap
        );

        Ok(Fill {
            transaction,
            position: Some(position),
            realized_pnl: 0.0,
            cash_after,
        })
    }

    /// Sell part of a position; the VWAP of the remainder is unchanged
    pub fn apply_sell(
        &self,
        account: &AccountId,
        asset: &AssetId,
        quantity: f64,
        price: f64,
    ) -> EngineResult<Fill> {
        validate_amount(quantity)?;
        validate_price(price)?;
        match self.reduce(account, asset, Some(quantity), price, TransactionKind::Sell)? {
            Some(fill) => Ok(fill),
            None => Err(EngineError::InsufficientPosition {
                asset: asset.clone(),
                requested: quantity,
                held: 0.0,
            }),
        }
    }

    /// Close the whole position; `None` when nothing is held
    pub fn liquidate_all(
        &self,
        account: &AccountId,
        asset: &AssetId,
        price: f64,
        kind: TransactionKind,
    ) -> EngineResult<Option<Fill>> {
        validate_price(price)?;
        if kind == TransactionKind::Buy {
            return Err(EngineError::Invariant("liquidation cannot be a buy".into()));
        }
        self.reduce(account, asset, None, price, kind)
    }

    fn reduce(
        &self,
        account: &AccountId,
        asset: &AssetId,
        requested: Option<f64>,
        price: f64,
        kind: TransactionKind,
    ) -> EngineResult<Option<Fill>> {
        let now = self.clock.now();
        let mut occupied = match self.positions.entry((account.clone(), asset.clone())) {
            Entry::Occupied(occupied) => occupied,
            Entry::Vacant(_) => {
                return match requested {
                    Some(quantity) => Err(EngineError::InsufficientPosition {
                        asset: asset.clone(),
                        requested: quantity,
                        held: 0.0,
                    }),
                    None => Ok(None),
                }
            }
        };

        let held = occupied.get().quantity;
        let vwap = occupied.get().vwap;
        let quantity = match requested {
            Some(quantity) if quantity > held + QUANTITY_EPSILON => {
                return Err(EngineError::InsufficientPosition {
                    asset: asset.clone(),
                    requested: quantity,
                    held,
                })
            }
            Some(quantity) => quantity.min(held),
            None => held,
        };

        let mut acct = match self.accounts.get_mut(account) {
            Some(acct) => acct,
            None => {
                error!("Position {}/{} has no owning account", account, asset);
                return Err(EngineError::Invariant(format!(
                    "position without account {}",
                    account
                )));
            }
        };

        let remaining = held - quantity;
        let realized = quantity * (price - vwap);
        let cash_after = acct.cash + quantity * price;
        if remaining < -QUANTITY_EPSILON || cash_after < 0.0 {
            error!(
                "Sell of {} {} for {} breaks ledger (remaining {}, cash {})",
                quantity, asset, account, remaining, cash_after
            );
            return Err(EngineError::Invariant(format!(
                "sell would leave {} with quantity {} and cash {}",
                account, remaining, cash_after
            )));
        }

        acct.cash = cash_after;
        acct.realized_pnl += realized;

        let position = if remaining <= QUANTITY_EPSILON {
            occupied.remove();
            self.persist("position", self.repository.delete_position(account, asset));
            None
        } else {
            let position = occupied.get_mut();
            position.quantity = remaining;
            position.updated_at = now;
            let snapshot = position.clone();
            self.persist("position", self.repository.save_position(&snapshot));
            Some(snapshot)
        };

        let transaction = Transaction::new(
            account.clone(),
            asset.clone(),
            kind,
            quantity,
            price,
            now,
            realized,
        );
        self.persist("account", self.repository.save_account(&acct));
        self.persist("transaction", self.repository.save_transaction(&transaction));
        self.journal.append(transaction.clone());

        debug!(
            "{} {} {} {} @ {:.4}, realized {:.4}",
            account, kind, quantity, asset, price, realized
        );

        Ok(Some(Fill {
            transaction,
            position,
            realized_pnl: realized,
            cash_after,
        }))
    }

    fn persist(&self, what: &str, result: anyhow::Result<()>) {
        if let Err(e) = result {
            warn!("Failed to persist {}: {:#}", what, e);
        }
    }

    pub fn account(&self, id: &AccountId) -> EngineResult<Account> {
        self.accounts
            .get(id)
            .map(|a| a.clone())
            .ok_or_else(|| EngineError::AccountNotFound(id.clone()))
    }

    pub fn has_account(&self, id: &AccountId) -> bool {
        self.accounts.contains_key(id)
    }

    /// All accounts in id order
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.accounts.iter().map(|a| a.value().clone()).collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    pub fn position(&self, account: &AccountId, asset: &AssetId) -> Option<Position> {
        self.positions
            .get(&(account.clone(), asset.clone()))
            .map(|p| p.clone())
    }

    /// Open positions of an account in asset order
    pub fn positions_for(&self, account: &AccountId) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| &p.account == account)
            .map(|p| p.value().clone())
            .collect();
        positions.sort_by(|a, b| a.asset.cmp(&b.asset));
        positions
    }

    /// Accounts holding an asset, ascending
    pub fn holders_of(&self, asset: &AssetId) -> Vec<AccountId> {
        let mut holders: Vec<AccountId> = self
            .positions
            .iter()
            .filter(|p| &p.asset == asset)
            .map(|p| p.account.clone())
            .collect();
        holders.sort();
        holders
    }

    pub fn all_positions(&self) -> Vec<Position> {
        self.positions.iter().map(|p| p.value().clone()).collect()
    }

    /// Total held quantity per asset
    pub fn open_interest(&self) -> BTreeMap<AssetId, f64> {
        let mut interest = BTreeMap::new();
        for position in self.positions.iter() {
            *interest.entry(position.asset.clone()).or_insert(0.0) += position.quantity;
        }
        interest
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// Reload persisted accounts and positions
    pub fn restore(&self, accounts: Vec<Account>, positions: Vec<Position>) {
        for account in accounts {
            self.accounts.insert(account.id.clone(), account);
        }
        for position in positions {
            if position.quantity > QUANTITY_EPSILON {
                self.positions
                    .insert((position.account.clone(), position.asset.clone()), position);
            }
        }
    }
}
