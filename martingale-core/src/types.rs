//! Identifier and order types shared across the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Words that can never be listed as a tradable symbol
pub const RESERVED_SYMBOLS: [&str; 7] = ["NULL", "NONE", "CASH", "USD", "SYSTEM", "ADMIN", "TEST"];

/// Longest allowed asset symbol
pub const MAX_SYMBOL_LEN: usize = 10;

/// Tradable asset symbol
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// 1-10 uppercase ASCII letters and not a reserved word
    pub fn validate(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_SYMBOL_LEN
            && self.0.chars().all(|c| c.is_ascii_uppercase())
            && !RESERVED_SYMBOLS.contains(&self.0.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Trading account identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Connected event-stream session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side as submitted by a trader
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
    /// Close the whole position regardless of the submitted quantity
    SellAll,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
            OrderSide::SellAll => write!(f, "sell_all"),
        }
    }
}

/// Kind of a recorded transaction
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Buy,
    Sell,
    /// Forced liquidation at expiry
    Settlement,
}

impl TransactionKind {
    /// Sign of the cash movement for this kind
    pub fn cash_direction(&self) -> f64 {
        match self {
            TransactionKind::Buy => -1.0,
            TransactionKind::Sell | TransactionKind::Settlement => 1.0,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Buy => write!(f, "buy"),
            TransactionKind::Sell => write!(f, "sell"),
            TransactionKind::Settlement => write!(f, "settlement"),
        }
    }
}
