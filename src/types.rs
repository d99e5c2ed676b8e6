//! Shared value types: ids, money, and the fixed-point multiplier

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic round identifier
pub type RoundId = u64;

/// Money in integer minor units (cents). Never fractional.
pub type Amount = u64;

/// Player identifier (opaque, supplied by the session layer)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Payout multiplier in hundredths (`1.50x` is stored as `150`).
///
/// Integer storage keeps threshold comparisons exact and makes payouts
/// reproducible: the same stake and multiplier always pay the same amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiplier(u32);

impl Multiplier {
    /// `1.00x`, the floor of every round.
    pub const ONE: Multiplier = Multiplier(100);

    /// Smallest auto-cashout a player may configure.
    pub const MIN_AUTO_CASHOUT: Multiplier = Multiplier(101);

    pub const fn from_hundredths(hundredths: u32) -> Self {
        Self(hundredths)
    }

    pub const fn hundredths(self) -> u32 {
        self.0
    }

    /// Convert a live (continuous) value, truncating towards 1.00x.
    pub fn from_f64_floor(value: f64) -> Self {
        if !value.is_finite() || value <= 1.0 {
            return Self::ONE;
        }
        // 1.4 * 100.0 is 139.99999999999997; absorb representation noise
        Self((((value * 100.0) + 1e-9).floor() as u32).max(100))
    }

    /// Convert a user-supplied value such as `1.01`, where binary float
    /// representation must not push it below what the player typed.
    pub fn from_f64_round(value: f64) -> Option<Self> {
        if !value.is_finite() || value <= 0.0 {
            return None;
        }
        let hundredths = (value * 100.0).round();
        if hundredths > u32::MAX as f64 {
            return None;
        }
        Some(Self(hundredths as u32))
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Gross payout for a stake settled at this multiplier, floored to the
    /// minor unit.
    pub fn payout(self, stake: Amount) -> Amount {
        ((stake as u128 * self.0 as u128) / 100) as Amount
    }

    /// Net profit (payout minus stake) for a stake settled at this multiplier.
    pub fn profit(self, stake: Amount) -> i64 {
        self.payout(stake) as i64 - stake as i64
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / 100, self.0 % 100)
    }
}
