//! Crashline - Provably Fair Crash Game Engine
//!
//! A perpetually running round scheduler: players stake during a betting
//! window, a multiplier grows in real time, and the round crashes at a point
//! committed (by SHA-256 hash) before any bet was accepted. Every wager is
//! settled against a RocksDB-backed balance ledger.

pub mod auto_cashout;
pub mod bet_book;
pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod fairness;
pub mod ledger;
pub mod round;
pub mod round_store;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use config::{ConfigLoader, CrashConfig};
pub use engine::{BetReceipt, CashoutReceipt, CrashEngine, GameStateView, TickOutcome};
pub use errors::{CrashError, CrashResult};
pub use events::{CrashEvent, EventBroadcaster};
pub use ledger::{PlayerStats, ReferralHook, SettlementLedger};
pub use round::{Round, RoundStatus, Wager, WagerOutcome};
pub use round_store::HistoryEntry;
pub use scheduler::{shutdown_channel, RoundEnd, RoundScheduler};
pub use storage::OptimizedStorage;
pub use types::{Amount, Multiplier, PlayerId, RoundId};
