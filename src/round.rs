//! Round and wager records with the round lifecycle state machine.
//!
//! `waiting → flying → crashed → completed`. No backward transitions;
//! `waiting` is only reachable by creating a new round.

use crate::errors::{CrashError, CrashResult};
use crate::fairness::Commitment;
use crate::types::{Amount, Multiplier, PlayerId, RoundId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Waiting,
    Flying,
    Crashed,
    Completed,
}

impl RoundStatus {
    /// The only legal successor of each status.
    pub fn next(self) -> Option<RoundStatus> {
        match self {
            RoundStatus::Waiting => Some(RoundStatus::Flying),
            RoundStatus::Flying => Some(RoundStatus::Crashed),
            RoundStatus::Crashed => Some(RoundStatus::Completed),
            RoundStatus::Completed => None,
        }
    }

    /// Whether the crash point may be revealed in this status.
    pub fn is_revealed(self) -> bool {
        matches!(self, RoundStatus::Crashed | RoundStatus::Completed)
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundStatus::Waiting => write!(f, "waiting"),
            RoundStatus::Flying => write!(f, "flying"),
            RoundStatus::Crashed => write!(f, "crashed"),
            RoundStatus::Completed => write!(f, "completed"),
        }
    }
}

/// One crash round. The crash point lives inside the commitment and has no
/// setter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub round_id: RoundId,
    pub status: RoundStatus,
    commitment: Commitment,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub crashed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Ended without a crash (shutdown during betting or interrupted by a
    /// restart); every open stake was refunded.
    #[serde(default)]
    pub voided: bool,
}

impl Round {
    pub fn new(round_id: RoundId, commitment: Commitment) -> Self {
        Self {
            round_id,
            status: RoundStatus::Waiting,
            commitment,
            created_at: Utc::now(),
            started_at: None,
            crashed_at: None,
            completed_at: None,
            voided: false,
        }
    }

    pub fn crash_point(&self) -> Multiplier {
        self.commitment.crash_point
    }

    pub fn server_seed_hash(&self) -> &str {
        &self.commitment.server_seed_hash
    }

    /// Raw seed, available only once the round has crashed.
    pub fn revealed_seed(&self) -> Option<&str> {
        self.status
            .is_revealed()
            .then_some(self.commitment.server_seed.as_str())
    }

    /// Full commitment for persistence and settlement records. Callers that
    /// publish data must go through [`Round::revealed_seed`].
    pub(crate) fn commitment(&self) -> &Commitment {
        &self.commitment
    }

    /// Advance to `next`, stamping the matching timestamp.
    pub fn transition(&mut self, next: RoundStatus) -> CrashResult<()> {
        if self.status.next() != Some(next) {
            return Err(CrashError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            RoundStatus::Flying => self.started_at = Some(now),
            RoundStatus::Crashed => self.crashed_at = Some(now),
            RoundStatus::Completed => self.completed_at = Some(now),
            RoundStatus::Waiting => {}
        }
        self.status = next;
        Ok(())
    }

    /// End a round that never crashed. Only `waiting` and `flying` rounds can
    /// be voided.
    pub fn void(&mut self) -> CrashResult<()> {
        if !matches!(self.status, RoundStatus::Waiting | RoundStatus::Flying) {
            return Err(CrashError::InvalidTransition {
                from: self.status,
                to: RoundStatus::Completed,
            });
        }
        self.status = RoundStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.voided = true;
        Ok(())
    }
}

/// Final state of a wager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WagerOutcome {
    Open,
    Won,
    Lost,
    Refunded,
}

/// A player's position in a round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Wager {
    pub round_id: RoundId,
    pub player_id: PlayerId,
    pub stake: Amount,
    pub auto_cashout: Option<Multiplier>,
    pub cashed_out: bool,
    pub cashout_multiplier: Option<Multiplier>,
    pub profit: i64,
    pub outcome: WagerOutcome,
    pub placed_at: DateTime<Utc>,
    pub cashed_out_at: Option<DateTime<Utc>>,
}

impl Wager {
    pub fn new(round_id: RoundId, player_id: PlayerId, stake: Amount, auto_cashout: Option<Multiplier>) -> Self {
        Self {
            round_id,
            player_id,
            stake,
            auto_cashout,
            cashed_out: false,
            cashout_multiplier: None,
            profit: 0,
            outcome: WagerOutcome::Open,
            placed_at: Utc::now(),
            cashed_out_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.outcome == WagerOutcome::Open
    }

    /// Gross amount credited for a win, zero otherwise.
    pub fn win_amount(&self) -> Amount {
        match (self.outcome, self.cashout_multiplier) {
            (WagerOutcome::Won, Some(m)) => m.payout(self.stake),
            _ => 0,
        }
    }

    /// Lock in a win at `multiplier`. Returns the gross payout.
    pub fn settle_win(&mut self, multiplier: Multiplier) -> CrashResult<Amount> {
        self.ensure_open()?;
        self.cashed_out = true;
        self.cashout_multiplier = Some(multiplier);
        self.profit = multiplier.profit(self.stake);
        self.outcome = WagerOutcome::Won;
        self.cashed_out_at = Some(Utc::now());
        Ok(multiplier.payout(self.stake))
    }

    /// Mark the wager lost at crash time.
    pub fn settle_loss(&mut self) -> CrashResult<()> {
        self.ensure_open()?;
        self.profit = -(self.stake as i64);
        self.outcome = WagerOutcome::Lost;
        Ok(())
    }

    /// Void the wager; the stake goes back to the player.
    pub fn refund(&mut self) -> CrashResult<Amount> {
        self.ensure_open()?;
        self.profit = 0;
        self.outcome = WagerOutcome::Refunded;
        Ok(self.stake)
    }

    fn ensure_open(&self) -> CrashResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CrashError::ConcurrencyConflict(format!(
                "wager of {} in round {} already settled as {:?}",
                self.player_id, self.round_id, self.outcome
            )))
        }
    }
}
