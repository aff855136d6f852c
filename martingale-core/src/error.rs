//! Engine error types

use crate::types::{AccountId, AssetId};
use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(f64),

    #[error("Invalid price: {0}")]
    InvalidPrice(f64),

    #[error("Insufficient funds: required {required:.2}, available {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("Insufficient position in {asset}: requested {requested}, held {held}")]
    InsufficientPosition {
        asset: AssetId,
        requested: f64,
        held: f64,
    },

    #[error("Trade value {value:.2} exceeds limit {limit:.2}")]
    TradeValueExceeded { value: f64, limit: f64 },

    #[error("Asset {0} has expired")]
    AssetExpired(AssetId),

    #[error("Asset not found: {0}")]
    AssetNotFound(AssetId),

    #[error("Asset already listed: {0}")]
    AssetExists(AssetId),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Account already exists: {0}")]
    AccountExists(AccountId),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Definitive rejection of a single request
    Rejected,
    /// Programming error detected at runtime
    Internal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invariant(_) => ErrorKind::Internal,
            _ => ErrorKind::Rejected,
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Rejected)
    }

    /// Stable machine-readable code for the transport layer
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidQuantity(_) => "invalid_quantity",
            Self::InvalidPrice(_) => "invalid_price",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::InsufficientPosition { .. } => "insufficient_position",
            Self::TradeValueExceeded { .. } => "trade_value_exceeded",
            Self::AssetExpired(_) => "asset_expired",
            Self::AssetNotFound(_) => "asset_not_found",
            Self::AssetExists(_) => "asset_exists",
            Self::InvalidSymbol(_) => "invalid_symbol",
            Self::AccountNotFound(_) => "account_not_found",
            Self::AccountExists(_) => "account_exists",
            Self::Invariant(_) => "internal",
        }
    }
}
