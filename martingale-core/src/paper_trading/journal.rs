//! Transaction journal

use crate::types::{AccountId, AssetId, TransactionKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Immutable record of one fill
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub account: AccountId,
    pub asset: AssetId,
    pub kind: TransactionKind,
    pub quantity: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    /// Negative for buys
    pub cash_delta: f64,
    pub realized_pnl: f64,
}

impl Transaction {
    pub fn new(
        account: AccountId,
        asset: AssetId,
        kind: TransactionKind,
        quantity: f64,
        price: f64,
        timestamp: DateTime<Utc>,
        realized_pnl: f64,
    ) -> Self {
        let id = format!("TX_{}_{}", timestamp.timestamp_millis(), nanoid::nanoid!(8));
        Self {
            id,
            account,
            asset,
            kind,
            quantity,
            price,
            timestamp,
            cash_delta: kind.cash_direction() * quantity * price,
            realized_pnl,
        }
    }

    pub fn notional(&self) -> f64 {
        self.quantity * self.price
    }
}

/// Per-account history plus a bounded global tape
pub struct TransactionJournal {
    by_account: DashMap<AccountId, Vec<Transaction>>,
    recent: Mutex<VecDeque<Transaction>>,
    window: usize,
    total: AtomicU64,
}

impl TransactionJournal {
    pub fn new(window: usize) -> Self {
        Self {
            by_account: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(window)),
            window: window.max(1),
            total: AtomicU64::new(0),
        }
    }

    pub fn append(&self, transaction: Transaction) {
        self.by_account
            .entry(transaction.account.clone())
            .or_default()
            .push(transaction.clone());

        let mut recent = self.recent.lock();
        recent.push_back(transaction);
        while recent.len() > self.window {
            recent.pop_front();
        }
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Every transaction of an account, oldest first
    pub fn for_account(&self, account: &AccountId) -> Vec<Transaction> {
        self.by_account
            .get(account)
            .map(|txs| txs.clone())
            .unwrap_or_default()
    }

    /// Most recent global transactions, newest first
    pub fn recent(&self, limit: usize) -> Vec<Transaction> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Reload persisted transactions, given oldest first
    pub fn restore(&self, transactions: impl IntoIterator<Item = Transaction>) {
        for transaction in transactions {
            self.append(transaction);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tx(account: &str, n: i64) -> Transaction {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(n);
        Transaction::new(
            AccountId::new(account),
            AssetId::new("XQR"),
            TransactionKind::Buy,
            1.0,
            10.0 + n as f64,
            ts,
            0.0,
        )
    }

    #[test]
    fn test_transaction_cash_delta_sign() {
        let buy = tx("alice", 0);
        assert_eq!(buy.cash_delta, -10.0);
        assert!(buy.id.starts_with("TX_"));

        let now = Utc::now();
        let settle = Transaction::new(
            AccountId::new("bob"),
            AssetId::new("XQR"),
            TransactionKind::Settlement,
            20.0,
            42.0,
            now,
            0.0,
        );
        assert_eq!(settle.cash_delta, 840.0);
        assert_eq!(settle.notional(), 840.0);
    }

    #[test]
    fn test_recent_window_newest_first() {
        let journal = TransactionJournal::new(3);
        for n in 0..5 {
            journal.append(tx(if n % 2 == 0 { "alice" } else { "bob" }, n));
        }

        let recent: Vec<f64> = journal.recent(10).iter().map(|t| t.price).collect();
        assert_eq!(recent, vec![14.0, 13.0, 12.0]);
        assert_eq!(journal.recent(1).len(), 1);
        assert_eq!(journal.total(), 5);

        assert_eq!(journal.for_account(&AccountId::new("alice")).len(), 3);
        assert_eq!(journal.for_account(&AccountId::new("bob")).len(), 2);
        assert!(journal.for_account(&AccountId::new("carol")).is_empty());
    }
}
