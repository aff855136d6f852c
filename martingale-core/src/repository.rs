//! Persistence seam for engine state

use crate::market_data::Asset;
use crate::paper_trading::{Account, Position, Transaction};
use crate::types::{AccountId, AssetId};
use anyhow::Result;
use dashmap::DashMap;

/// Snapshot storage for assets, accounts, positions and transactions.
///
/// Writes happen inside engine critical sections, so implementations must
/// not block for long. Failures are logged by the caller and never undo
/// an accepted in-memory change.
pub trait Repository: Send + Sync {
    fn save_asset(&self, asset: &Asset) -> Result<()>;
    fn delete_asset(&self, symbol: &AssetId) -> Result<()>;
    fn load_assets(&self) -> Result<Vec<Asset>>;

    fn save_account(&self, account: &Account) -> Result<()>;
    fn load_accounts(&self) -> Result<Vec<Account>>;

    fn save_position(&self, position: &Position) -> Result<()>;
    fn delete_position(&self, account: &AccountId, asset: &AssetId) -> Result<()>;
    fn load_positions(&self) -> Result<Vec<Position>>;

    fn save_transaction(&self, transaction: &Transaction) -> Result<()>;
    fn load_transactions(&self) -> Result<Vec<Transaction>>;
}

/// Repository kept entirely in memory
#[derive(Default)]
pub struct InMemoryRepository {
    assets: DashMap<AssetId, Asset>,
    accounts: DashMap<AccountId, Account>,
    positions: DashMap<(AccountId, AssetId), Position>,
    transactions: DashMap<String, Transaction>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

impl Repository for InMemoryRepository {
    fn save_asset(&self, asset: &Asset) -> Result<()> {
        self.assets.insert(asset.symbol.clone(), asset.clone());
        Ok(())
    }

    fn delete_asset(&self, symbol: &AssetId) -> Result<()> {
        self.assets.remove(symbol);
        Ok(())
    }

    fn load_assets(&self) -> Result<Vec<Asset>> {
        Ok(self.assets.iter().map(|e| e.value().clone()).collect())
    }

    fn save_account(&self, account: &Account) -> Result<()> {
        self.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    fn load_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.accounts.iter().map(|e| e.value().clone()).collect())
    }

    fn save_position(&self, position: &Position) -> Result<()> {
        self.positions.insert(
            (position.account.clone(), position.asset.clone()),
            position.clone(),
        );
        Ok(())
    }

    fn delete_position(&self, account: &AccountId, asset: &AssetId) -> Result<()> {
        self.positions.remove(&(account.clone(), asset.clone()));
        Ok(())
    }

    fn load_positions(&self) -> Result<Vec<Position>> {
        Ok(self.positions.iter().map(|e| e.value().clone()).collect())
    }

    fn save_transaction(&self, transaction: &Transaction) -> Result<()> {
        self.transactions
            .insert(transaction.id.clone(), transaction.clone());
        Ok(())
    }

    fn load_transactions(&self) -> Result<Vec<Transaction>> {
        let mut transactions: Vec<Transaction> =
            self.transactions.iter().map(|e| e.value().clone()).collect();
        transactions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionKind;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_in_memory_round_trip() {
        let repo = InMemoryRepository::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let account = Account::new(AccountId::new("alice"), 1000.0, now);
        repo.save_account(&account).unwrap();

        let position = Position::open(AccountId::new("alice"), AssetId::new("XQR"), 2.0, 50.0, now);
        repo.save_position(&position).unwrap();
        assert_eq!(repo.load_positions().unwrap().len(), 1);
        repo.delete_position(&position.account, &position.asset).unwrap();
        assert!(repo.load_positions().unwrap().is_empty());

        let tx = Transaction::new(
            AccountId::new("alice"),
            AssetId::new("XQR"),
            TransactionKind::Buy,
            2.0,
            50.0,
            now,
            0.0,
        );
        repo.save_transaction(&tx).unwrap();
        repo.save_transaction(&tx).unwrap();
        assert_eq!(repo.transaction_count(), 1);
        assert_eq!(repo.load_accounts().unwrap()[0].cash, 1000.0);
    }
}
