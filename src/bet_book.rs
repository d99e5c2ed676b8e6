//! Wagers of the active round, keyed by player.
//!
//! Each slot moves `Reserved → Active(open) → Active(claimed) → Active(settled)`.
//! Claiming is the single point where a settlement path (manual cashout,
//! auto-cashout, crash loss, refund) takes ownership of a wager, so only one of
//! them can ever settle it.
//!
//! Auto-cashout thresholds sit in an ordered set so each tick pops only the
//! thresholds it crossed.
//!
//! Lock order: `thresholds` may be held while touching `slots`, never the
//! reverse.

use crate::errors::{CrashError, CrashResult};
use crate::round::Wager;
use crate::types::{Amount, Multiplier, PlayerId, RoundId};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
enum Slot {
    /// Stake debit in flight
    Reserved,
    Active { wager: Wager, claimed: bool },
}

pub struct BetBook {
    round_id: RoundId,
    slots: DashMap<PlayerId, Slot>,
    order: Mutex<Vec<PlayerId>>,
    thresholds: Mutex<BTreeSet<(Multiplier, PlayerId)>>,
}

impl BetBook {
    pub fn new(round_id: RoundId) -> Self {
        Self {
            round_id,
            slots: DashMap::new(),
            order: Mutex::new(Vec::new()),
            thresholds: Mutex::new(BTreeSet::new()),
        }
    }

    /// Rebuild a book from persisted wagers (restart recovery).
    pub fn from_wagers(round_id: RoundId, wagers: Vec<Wager>) -> Self {
        let book = Self::new(round_id);
        for wager in wagers {
            book.confirm(wager);
        }
        book
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    /// Hold the player's slot while their stake is being debited.
    pub fn reserve(&self, player: &PlayerId) -> CrashResult<()> {
        match self.slots.entry(player.clone()) {
            Entry::Occupied(_) => Err(CrashError::Validation(format!(
                "{} already has a bet in round {}",
                player, self.round_id
            ))),
            Entry::Vacant(v) => {
                v.insert(Slot::Reserved);
                Ok(())
            }
        }
    }

    /// Drop a reservation whose debit failed.
    pub fn release(&self, player: &PlayerId) {
        self.slots.remove_if(player, |_, slot| matches!(slot, Slot::Reserved));
    }

    /// Turn a reservation into an active wager.
    pub fn confirm(&self, wager: Wager) {
        let player = wager.player_id.clone();
        let threshold = wager.auto_cashout.filter(|_| wager.is_open());
        self.slots.insert(player.clone(), Slot::Active { wager, claimed: false });
        self.order.lock().push(player.clone());
        if let Some(m) = threshold {
            self.thresholds.lock().insert((m, player));
        }
    }

    /// Claim one player's open wager for a manual cashout.
    pub fn claim(&self, player: &PlayerId) -> CrashResult<Wager> {
        let mut slot = self
            .slots
            .get_mut(player)
            .ok_or_else(|| CrashError::Validation(format!("{} has no bet in round {}", player, self.round_id)))?;
        match &mut *slot {
            Slot::Reserved => Err(CrashError::Validation(format!(
                "bet of {} is still being placed",
                player
            ))),
            Slot::Active { claimed: true, .. } => Err(CrashError::ConcurrencyConflict(format!(
                "wager of {} is already being settled",
                player
            ))),
            Slot::Active { wager, .. } if !wager.is_open() => Err(CrashError::Validation(format!(
                "{} already cashed out",
                player
            ))),
            Slot::Active { wager, claimed } => {
                *claimed = true;
                Ok(wager.clone())
            }
        }
    }

    /// Claim every wager whose threshold is at or below `limit`, lowest first.
    pub fn claim_crossed(&self, limit: Multiplier) -> Vec<Wager> {
        let mut thresholds = self.thresholds.lock();
        let mut claimed = Vec::new();
        while let Some((threshold, player)) = thresholds.first().cloned() {
            if threshold > limit {
                break;
            }
            thresholds.pop_first();
            if let Some(mut slot) = self.slots.get_mut(&player) {
                if let Slot::Active { wager, claimed: c } = &mut *slot {
                    // A manual cashout in flight owns the wager; it re-arms the
                    // threshold if it fails.
                    if !*c && wager.is_open() {
                        *c = true;
                        claimed.push(wager.clone());
                    }
                }
            }
        }
        claimed
    }

    /// Claim all remaining open wagers (crash settlement or void).
    pub fn claim_all_open(&self) -> Vec<Wager> {
        self.thresholds.lock().clear();
        let order = self.order.lock().clone();
        let mut claimed = Vec::new();
        for player in order {
            if let Some(mut slot) = self.slots.get_mut(&player) {
                if let Slot::Active { wager, claimed: c } = &mut *slot {
                    if !*c && wager.is_open() {
                        *c = true;
                        claimed.push(wager.clone());
                    }
                }
            }
        }
        claimed
    }

    /// Store the settled version of a claimed wager.
    pub fn complete(&self, settled: Wager) {
        if let Some(mut slot) = self.slots.get_mut(&settled.player_id) {
            *slot = Slot::Active {
                wager: settled,
                claimed: false,
            };
        }
    }

    /// Give back a claim whose settlement failed; the wager is open again.
    pub fn release_claim(&self, player: &PlayerId) {
        let rearm = match self.slots.get_mut(player) {
            Some(mut slot) => match &mut *slot {
                Slot::Active { wager, claimed } => {
                    *claimed = false;
                    wager.auto_cashout.filter(|_| wager.is_open())
                }
                Slot::Reserved => None,
            },
            None => None,
        };
        if let Some(m) = rearm {
            self.thresholds.lock().insert((m, player.clone()));
        }
    }

    pub fn get(&self, player: &PlayerId) -> Option<Wager> {
        self.slots.get(player).and_then(|slot| match &*slot {
            Slot::Active { wager, .. } => Some(wager.clone()),
            Slot::Reserved => None,
        })
    }

    /// Active wagers in placement order.
    pub fn wagers(&self) -> Vec<Wager> {
        let order = self.order.lock().clone();
        order.iter().filter_map(|p| self.get(p)).collect()
    }

    pub fn open_count(&self) -> usize {
        self.wagers().iter().filter(|w| w.is_open()).count()
    }

    /// Number of confirmed wagers and their total stake.
    pub fn totals(&self) -> (usize, Amount) {
        let wagers = self.wagers();
        (wagers.len(), wagers.iter().map(|w| w.stake).sum())
    }

    pub fn pending_thresholds(&self) -> usize {
        self.thresholds.lock().len()
    }
}
