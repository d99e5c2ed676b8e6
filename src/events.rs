//! Broadcast events for the transport layer.
//!
//! The engine publishes into a `tokio::sync::broadcast` channel; any number of
//! sinks (WebSocket fan-out, audit tailers, tests) subscribe independently.
//! Slow subscribers lag and skip events rather than blocking the tick loop.

use crate::types::{Amount, Multiplier, PlayerId, RoundId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Events emitted by the crash engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrashEvent {
    /// New round accepting bets. Only the seed hash is public.
    RoundCreated {
        round_id: RoundId,
        server_seed_hash: String,
        countdown: u64,
    },

    CountdownUpdate {
        round_id: RoundId,
        seconds_left: u64,
    },

    RoundStarted {
        round_id: RoundId,
    },

    MultiplierUpdate {
        round_id: RoundId,
        multiplier: f64,
        timestamp: i64,
    },

    /// The seed is revealed here for verification.
    RoundCrashed {
        round_id: RoundId,
        crash_point: Multiplier,
        server_seed: String,
        nonce: u64,
    },

    BetPlaced {
        round_id: RoundId,
        player_id: PlayerId,
        stake: Amount,
        auto_cashout: Option<Multiplier>,
        total_bets: usize,
        total_amount: Amount,
    },

    #[serde(rename = "auto_cash_out")]
    AutoCashOut {
        round_id: RoundId,
        player_id: PlayerId,
        stake: Amount,
        multiplier: Multiplier,
        profit: i64,
    },

    #[serde(rename = "manual_cash_out")]
    ManualCashOut {
        round_id: RoundId,
        player_id: PlayerId,
        stake: Amount,
        multiplier: Multiplier,
        profit: i64,
    },

    RoundCompleted {
        round_id: RoundId,
        crash_point: Multiplier,
        total_bets: usize,
        total_amount: Amount,
    },

    /// Round ended without a crash; open stakes went back to their players.
    RoundVoided {
        round_id: RoundId,
        refunded: usize,
    },
}

impl CrashEvent {
    pub fn round_id(&self) -> RoundId {
        match self {
            CrashEvent::RoundCreated { round_id, .. }
            | CrashEvent::CountdownUpdate { round_id, .. }
            | CrashEvent::RoundStarted { round_id }
            | CrashEvent::MultiplierUpdate { round_id, .. }
            | CrashEvent::RoundCrashed { round_id, .. }
            | CrashEvent::BetPlaced { round_id, .. }
            | CrashEvent::AutoCashOut { round_id, .. }
            | CrashEvent::ManualCashOut { round_id, .. }
            | CrashEvent::RoundCompleted { round_id, .. }
            | CrashEvent::RoundVoided { round_id, .. } => *round_id,
        }
    }
}

/// Publish/subscribe hub for [`CrashEvent`]s
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<CrashEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: CrashEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No subscribers for crash event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrashEvent> {
        self.tx.subscribe()
    }

}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
