//! Paper trading over expiring assets

pub mod position_manager;
pub mod order_manager;
pub mod journal;
pub mod settlement;
pub mod leaderboard;
pub mod portfolio;
pub mod engine;

pub use position_manager::{Account, Fill, Position, PositionLedger, QUANTITY_EPSILON};
pub use order_manager::{
    validate_quantity, ExecutionStats, OrderExecutor, MAX_QUANTITY, MIN_QUANTITY,
};
pub use journal::{Transaction, TransactionJournal};
pub use settlement::{SettlementFailure, SettlementReport, SettlementService};
pub use leaderboard::{rank, DirtyFlag, Leaderboard, LeaderboardEntry};
pub use portfolio::{PerformanceSnapshot, PortfolioSnapshot, PositionView};
pub use engine::{
    AssetSummary, EngineBuilder, EngineStatistics, RestoreStats, TradingEngine,
};
