//! Settlement ledger: player balances, audit entries and per-wager game records.
//!
//! Every balance mutation is committed in the same RocksDB write batch as its
//! [`LedgerEntry`] and the updated wager record, while holding the player's
//! lock. Multi-player batches take the locks in sorted order.
//!
//! Key layout:
//! - `balance:{player}` → [`Account`]
//! - `ledger:tx:{entry_id}` → [`LedgerEntry`]
//! - `ledger:player:{hex(player)}:{inv_nanos}{entry_id}` → entry id (newest first)
//! - `crash:outcome:{round_id}:{player}` → [`GameRecord`]
//! - `referral:pending:{round_id}:{player}` → [`PendingReferral`], deleted once
//!   the [`ReferralHook`] accepted it

use crate::{
    config::SettlementConfig,
    errors::{CrashError, CrashResult},
    round::{Round, Wager, WagerOutcome},
    round_store::{self, decode, encode},
    storage::{OptimizedStorage, StorageBatch},
    types::{Amount, Multiplier, PlayerId, RoundId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

const ACCOUNT_PREFIX: &str = "balance:";
const ENTRY_PREFIX: &str = "ledger:tx:";
const PLAYER_ENTRY_PREFIX: &str = "ledger:player:";
const REFERRAL_PREFIX: &str = "referral:pending:";
const REFERRAL_PAGE: usize = 256;

/// Balance and lifetime totals of one player
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub balance: Amount,
    pub total_wagered: Amount,
    pub total_won: Amount,
    pub games_played: u64,
    #[serde(default)]
    pub games_won: u64,
    #[serde(default)]
    pub best_multiplier: Option<Multiplier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Bet,
    Win,
    Loss,
    Refund,
    Deposit,
}

/// Audit record written alongside every balance mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub player_id: PlayerId,
    pub kind: EntryKind,
    /// Signed balance change
    pub amount: i64,
    pub balance_before: Amount,
    pub balance_after: Amount,
    pub round_id: Option<RoundId>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn new(
        player_id: &PlayerId,
        kind: EntryKind,
        balance_before: Amount,
        balance_after: Amount,
        round_id: Option<RoundId>,
        description: String,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            player_id: player_id.clone(),
            kind,
            amount: balance_after as i64 - balance_before as i64,
            balance_before,
            balance_after,
            round_id,
            description,
            created_at: Utc::now(),
        }
    }
}

/// Final, per-wager settlement record with everything needed to audit it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub round_id: RoundId,
    pub player_id: PlayerId,
    pub stake: Amount,
    pub auto_cashout: Option<Multiplier>,
    pub cashout_multiplier: Option<Multiplier>,
    pub crash_point: Multiplier,
    pub is_win: bool,
    pub profit: i64,
    pub server_seed: String,
    pub server_seed_hash: String,
    pub nonce: u64,
    pub created_at: DateTime<Utc>,
}

impl GameRecord {
    fn new(round: &Round, wager: &Wager) -> Self {
        let commitment = round.commitment();
        Self {
            round_id: round.round_id,
            player_id: wager.player_id.clone(),
            stake: wager.stake,
            auto_cashout: wager.auto_cashout,
            cashout_multiplier: wager.cashout_multiplier,
            crash_point: commitment.crash_point,
            is_win: wager.outcome == WagerOutcome::Won,
            profit: wager.profit,
            server_seed: commitment.server_seed.clone(),
            server_seed_hash: commitment.server_seed_hash.clone(),
            nonce: commitment.nonce,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub player_id: PlayerId,
    pub balance: Amount,
    pub games_played: u64,
    pub games_won: u64,
    pub total_wagered: Amount,
    pub total_won: Amount,
    pub net_profit: i64,
    pub win_rate: f64,
    pub best_multiplier: Option<Multiplier>,
}

/// Result of settling one crashed round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundSettlement {
    pub round_id: RoundId,
    /// Game records written by this call
    pub recorded: usize,
    /// Wagers that already had a record
    pub skipped: usize,
    pub losers: usize,
    pub total_lost: Amount,
}

/// A lost stake the referral hook has not accepted yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReferral {
    pub round_id: RoundId,
    pub player_id: PlayerId,
    pub stake_lost: Amount,
}

/// Called for every losing wager once its loss is durable. Delivery is at
/// least once: a call that fails, or is cut short by a restart, is repeated
/// on a later settlement.
#[async_trait]
pub trait ReferralHook: Send + Sync {
    async fn on_wager_lost(&self, player: &PlayerId, stake_lost: Amount, round_id: RoundId) -> Result<(), String>;
}

pub struct NoopReferralHook;

#[async_trait]
impl ReferralHook for NoopReferralHook {
    async fn on_wager_lost(&self, _player: &PlayerId, _stake_lost: Amount, _round_id: RoundId) -> Result<(), String> {
        Ok(())
    }
}

fn account_key(player: &PlayerId) -> Vec<u8> {
    format!("{}{}", ACCOUNT_PREFIX, player).into_bytes()
}

fn entry_key(entry_id: &Uuid) -> Vec<u8> {
    format!("{}{}", ENTRY_PREFIX, entry_id).into_bytes()
}

fn player_entry_prefix(player: &PlayerId) -> Vec<u8> {
    // Hex keeps one player's prefix from matching another's
    format!("{}{}:", PLAYER_ENTRY_PREFIX, hex::encode(player.as_str())).into_bytes()
}

fn referral_key(round_id: RoundId, player: &PlayerId) -> Vec<u8> {
    let mut key = REFERRAL_PREFIX.as_bytes().to_vec();
    key.extend_from_slice(&round_id.to_be_bytes());
    key.push(b':');
    key.extend_from_slice(player.as_str().as_bytes());
    key
}

fn player_entry_key(entry: &LedgerEntry) -> Vec<u8> {
    let nanos = entry.created_at.timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
    let mut key = player_entry_prefix(&entry.player_id);
    key.extend_from_slice(&(u64::MAX - nanos).to_be_bytes());
    key.extend_from_slice(entry.entry_id.as_bytes());
    key
}

pub struct SettlementLedger {
    storage: OptimizedStorage,
    locks: DashMap<PlayerId, Arc<Mutex<()>>>,
    referral: Arc<dyn ReferralHook>,
    retry: SettlementConfig,
}

impl SettlementLedger {
    pub fn new(storage: OptimizedStorage, retry: SettlementConfig) -> Self {
        Self {
            storage,
            locks: DashMap::new(),
            referral: Arc::new(NoopReferralHook),
            retry,
        }
    }

    pub fn with_referral_hook(mut self, hook: Arc<dyn ReferralHook>) -> Self {
        self.referral = hook;
        self
    }

    async fn lock_player(&self, player: &PlayerId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(player.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Lock several players in sorted order.
    async fn lock_players<'a>(&self, players: impl Iterator<Item = &'a PlayerId>) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<&PlayerId> = players.collect();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for player in sorted {
            guards.push(self.lock_player(player).await);
        }
        guards
    }

    /// Drop lock entries nobody holds or waits on.
    fn prune_locks(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn account(&self, player: &PlayerId) -> CrashResult<Account> {
        match self.storage.get(&account_key(player))? {
            Some(bytes) => decode(&bytes, &format!("account {}", player)),
            None => Ok(Account::default()),
        }
    }

    pub fn balance(&self, player: &PlayerId) -> CrashResult<Amount> {
        Ok(self.account(player)?.balance)
    }

    fn stage_account(batch: &mut StorageBatch, player: &PlayerId, account: &Account) -> CrashResult<()> {
        batch.put(account_key(player), encode(account, "account")?);
        Ok(())
    }

    fn stage_entry(batch: &mut StorageBatch, entry: &LedgerEntry) -> CrashResult<()> {
        batch.put(entry_key(&entry.entry_id), encode(entry, "ledger entry")?);
        batch.put(player_entry_key(entry), entry.entry_id.as_bytes());
        Ok(())
    }

    /// Fund an account. Returns the new balance.
    pub async fn deposit(&self, player: &PlayerId, amount: Amount) -> CrashResult<Amount> {
        if amount == 0 {
            return Err(CrashError::Validation("deposit must be positive".to_string()));
        }
        let _guard = self.lock_player(player).await;
        let mut account = self.account(player)?;
        let before = account.balance;
        account.balance = before
            .checked_add(amount)
            .ok_or_else(|| CrashError::Validation(format!("deposit of {} overflows balance", amount)))?;

        let mut batch = StorageBatch::new();
        Self::stage_account(&mut batch, player, &account)?;
        let entry = LedgerEntry::new(
            player,
            EntryKind::Deposit,
            before,
            account.balance,
            None,
            format!("deposit of {}", amount),
        );
        Self::stage_entry(&mut batch, &entry)?;
        self.storage.commit(batch)?;

        tracing::info!(player = %player, amount, balance = account.balance, "💰 Deposit recorded");
        Ok(account.balance)
    }

    /// Take the stake for a new wager and persist the wager record with it.
    /// Returns the balance after the debit.
    pub async fn debit_stake(&self, wager: &Wager) -> CrashResult<Amount> {
        let player = &wager.player_id;
        let _guard = self.lock_player(player).await;
        let mut account = self.account(player)?;
        if account.balance < wager.stake {
            return Err(CrashError::InsufficientFunds {
                required: wager.stake,
                available: account.balance,
            });
        }
        let before = account.balance;
        account.balance -= wager.stake;

        let mut batch = StorageBatch::new();
        Self::stage_account(&mut batch, player, &account)?;
        let entry = LedgerEntry::new(
            player,
            EntryKind::Bet,
            before,
            account.balance,
            Some(wager.round_id),
            format!("stake of {} on round {}", wager.stake, wager.round_id),
        );
        Self::stage_entry(&mut batch, &entry)?;
        round_store::stage_wager(&mut batch, wager)?;
        self.storage.commit(batch)?;

        tracing::debug!(
            round_id = wager.round_id,
            player = %player,
            stake = wager.stake,
            balance = account.balance,
            "Stake debited"
        );
        Ok(account.balance)
    }

    /// Credit a set of won wagers in one write batch. Returns each player's
    /// balance after the credit, in input order.
    pub async fn credit_cashouts(&self, wagers: &[Wager]) -> CrashResult<Vec<Amount>> {
        if wagers.is_empty() {
            return Ok(Vec::new());
        }
        let _guards = self.lock_players(wagers.iter().map(|w| &w.player_id)).await;

        let mut accounts: HashMap<PlayerId, Account> = HashMap::new();
        let mut batch = StorageBatch::new();
        let mut balances = Vec::with_capacity(wagers.len());

        for wager in wagers {
            let multiplier = match (wager.outcome, wager.cashout_multiplier) {
                (WagerOutcome::Won, Some(m)) => m,
                _ => {
                    return Err(CrashError::ConcurrencyConflict(format!(
                        "wager of {} in round {} is not a settled win",
                        wager.player_id, wager.round_id
                    )))
                }
            };
            let payout = wager.win_amount();
            let account = match accounts.entry(wager.player_id.clone()) {
                std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
                std::collections::hash_map::Entry::Vacant(v) => v.insert(self.account(&wager.player_id)?),
            };
            let before = account.balance;
            account.balance = before.checked_add(payout).ok_or_else(|| {
                CrashError::Persistence(format!("payout {} overflows balance of {}", payout, wager.player_id))
            })?;
            account.total_wagered += wager.stake;
            account.total_won += payout;
            account.games_played += 1;
            account.games_won += 1;
            account.best_multiplier = account.best_multiplier.max(Some(multiplier));

            let entry = LedgerEntry::new(
                &wager.player_id,
                EntryKind::Win,
                before,
                account.balance,
                Some(wager.round_id),
                format!("cashed out {} at {} on round {}", wager.stake, multiplier, wager.round_id),
            );
            Self::stage_entry(&mut batch, &entry)?;
            round_store::stage_wager(&mut batch, wager)?;
            balances.push(account.balance);
        }
        for (player, account) in &accounts {
            Self::stage_account(&mut batch, player, account)?;
        }
        self.storage.commit(batch)?;
        Ok(balances)
    }

    /// Delay before retry number `attempt` (0-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.retry.retry_base_ms.saturating_mul(factor).min(self.retry.retry_max_ms);
        Duration::from_millis(ms)
    }

    /// Settle every wager of a crashed round: open wagers become losses and
    /// each wager gets a [`GameRecord`]. Wagers that already have one are
    /// skipped, so calling this again after a partial failure is safe.
    pub async fn settle_round(&self, round: &Round, wagers: &[Wager]) -> CrashResult<RoundSettlement> {
        let mut attempt = 0u32;
        loop {
            match self.try_settle_round(round, wagers).await {
                Ok(settlement) => {
                    self.prune_locks();
                    if let Err(e) = self.flush_referrals().await {
                        tracing::warn!(round_id = round.round_id, error = %e, "Referral delivery deferred");
                    }
                    return Ok(settlement);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        round_id = round.round_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Settlement attempt failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        round_id = round.round_id,
                        attempts = attempt + 1,
                        error = %e,
                        "Round settlement failed, reconciliation required"
                    );
                    return Err(CrashError::Persistence(format!(
                        "round {} settlement failed after {} attempts: {}",
                        round.round_id,
                        attempt + 1,
                        e
                    )));
                }
            }
        }
    }

    async fn try_settle_round(&self, round: &Round, wagers: &[Wager]) -> CrashResult<RoundSettlement> {
        let mut final_wagers = Vec::with_capacity(wagers.len());
        for wager in wagers {
            if wager.outcome == WagerOutcome::Refunded {
                continue;
            }
            let mut wager = wager.clone();
            if wager.is_open() {
                wager.settle_loss()?;
            }
            final_wagers.push(wager);
        }

        let _guards = self
            .lock_players(
                final_wagers
                    .iter()
                    .filter(|w| w.outcome == WagerOutcome::Lost)
                    .map(|w| &w.player_id),
            )
            .await;

        let mut settlement = RoundSettlement {
            round_id: round.round_id,
            ..Default::default()
        };
        let mut batch = StorageBatch::new();

        for wager in &final_wagers {
            let record_key = round_store::outcome_key(round.round_id, wager.player_id.as_str());
            if self.storage.get(&record_key)?.is_some() {
                settlement.skipped += 1;
                continue;
            }
            batch.put(record_key, encode(&GameRecord::new(round, wager), "game record")?);
            settlement.recorded += 1;

            if wager.outcome == WagerOutcome::Lost {
                let mut account = self.account(&wager.player_id)?;
                account.total_wagered += wager.stake;
                account.games_played += 1;
                Self::stage_account(&mut batch, &wager.player_id, &account)?;
                let entry = LedgerEntry::new(
                    &wager.player_id,
                    EntryKind::Loss,
                    account.balance,
                    account.balance,
                    Some(round.round_id),
                    format!("lost {} when round {} crashed at {}", wager.stake, round.round_id, round.crash_point()),
                );
                Self::stage_entry(&mut batch, &entry)?;
                round_store::stage_wager(&mut batch, wager)?;

                let pending = PendingReferral {
                    round_id: round.round_id,
                    player_id: wager.player_id.clone(),
                    stake_lost: wager.stake,
                };
                batch.put(referral_key(round.round_id, &wager.player_id), encode(&pending, "referral")?);

                settlement.losers += 1;
                settlement.total_lost += wager.stake;
            }
        }
        self.storage.commit(batch)?;

        tracing::info!(
            round_id = round.round_id,
            recorded = settlement.recorded,
            skipped = settlement.skipped,
            losers = settlement.losers,
            total_lost = settlement.total_lost,
            "📒 Round settled"
        );
        Ok(settlement)
    }

    /// Hand every pending lost stake to the referral hook, oldest round
    /// first. Markers are removed only for calls that succeeded. Returns the
    /// number delivered.
    async fn flush_referrals(&self) -> CrashResult<usize> {
        let prefix = REFERRAL_PREFIX.as_bytes();
        let mut cursor: Option<Vec<u8>> = None;
        let mut delivered = 0;
        loop {
            let rows = self.storage.scan_prefix(prefix, cursor.as_deref(), REFERRAL_PAGE)?;
            let Some((last, _)) = rows.last() else {
                break;
            };
            cursor = Some(last.clone());

            let mut batch = StorageBatch::new();
            for (key, value) in &rows {
                let pending: PendingReferral = decode(value, "referral")?;
                match self
                    .referral
                    .on_wager_lost(&pending.player_id, pending.stake_lost, pending.round_id)
                    .await
                {
                    Ok(()) => {
                        batch.delete(key);
                        delivered += 1;
                    }
                    Err(e) => tracing::warn!(
                        round_id = pending.round_id,
                        player = %pending.player_id,
                        error = %e,
                        "Referral hook failed, will retry"
                    ),
                }
            }
            self.storage.commit(batch)?;
            if rows.len() < REFERRAL_PAGE {
                break;
            }
        }
        Ok(delivered)
    }

    /// Void every open wager in `wagers`, returning stakes to their players.
    /// Returns the wagers that were refunded by this call.
    pub async fn refund_round(&self, round_id: RoundId, wagers: &[Wager]) -> CrashResult<Vec<Wager>> {
        let open: Vec<&Wager> = wagers.iter().filter(|w| w.is_open()).collect();
        if open.is_empty() {
            return Ok(Vec::new());
        }
        let _guards = self.lock_players(open.iter().map(|w| &w.player_id)).await;

        let mut accounts: HashMap<PlayerId, Account> = HashMap::new();
        let mut batch = StorageBatch::new();
        let mut refunded = Vec::with_capacity(open.len());
        for wager in open {
            let mut wager = wager.clone();
            let stake = wager.refund()?;
            let account = match accounts.entry(wager.player_id.clone()) {
                std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
                std::collections::hash_map::Entry::Vacant(v) => v.insert(self.account(&wager.player_id)?),
            };
            let before = account.balance;
            account.balance = before.saturating_add(stake);
            let entry = LedgerEntry::new(
                &wager.player_id,
                EntryKind::Refund,
                before,
                account.balance,
                Some(round_id),
                format!("refund of {} from voided round {}", stake, round_id),
            );
            Self::stage_entry(&mut batch, &entry)?;
            round_store::stage_wager(&mut batch, &wager)?;
            refunded.push(wager);
        }
        for (player, account) in &accounts {
            Self::stage_account(&mut batch, player, account)?;
        }
        self.storage.commit(batch)?;

        tracing::info!(round_id, refunded = refunded.len(), "↩️ Refunded open wagers");
        Ok(refunded)
    }

    /// Audit trail of a player, newest first.
    pub fn entries_for(&self, player: &PlayerId, limit: usize) -> CrashResult<Vec<LedgerEntry>> {
        let rows = self.storage.scan_prefix(&player_entry_prefix(player), None, limit.max(1))?;
        let mut entries = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            let entry_id = Uuid::from_slice(&value).map_err(|e| {
                CrashError::Storage(crate::errors::StorageError::CorruptedData(format!(
                    "bad ledger index entry for {}: {}",
                    player, e
                )))
            })?;
            if let Some(bytes) = self.storage.get(&entry_key(&entry_id))? {
                entries.push(decode(&bytes, "ledger entry")?);
            }
        }
        Ok(entries)
    }

    pub fn game_record(&self, round_id: RoundId, player: &PlayerId) -> CrashResult<Option<GameRecord>> {
        match self.storage.get(&round_store::outcome_key(round_id, player.as_str()))? {
            Some(bytes) => decode(&bytes, "game record").map(Some),
            None => Ok(None),
        }
    }

    pub fn player_stats(&self, player: &PlayerId) -> CrashResult<PlayerStats> {
        let account = self.account(player)?;
        let win_rate = if account.games_played == 0 {
            0.0
        } else {
            account.games_won as f64 / account.games_played as f64
        };
        Ok(PlayerStats {
            player_id: player.clone(),
            balance: account.balance,
            games_played: account.games_played,
            games_won: account.games_won,
            total_wagered: account.total_wagered,
            total_won: account.total_won,
            net_profit: account.total_won as i64 - account.total_wagered as i64,
            win_rate,
            best_multiplier: account.best_multiplier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fairness::Commitment;
    use crate::round::RoundStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingHook(AtomicUsize);

    #[async_trait]
    impl ReferralHook for CountingHook {
        async fn on_wager_lost(&self, _player: &PlayerId, stake_lost: Amount, _round_id: RoundId) -> Result<(), String> {
            self.0.fetch_add(stake_lost as usize, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails its first `failures` calls, then counts delivered stakes.
    struct FlakyHook {
        failures: AtomicUsize,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl ReferralHook for FlakyHook {
        async fn on_wager_lost(&self, _player: &PlayerId, stake_lost: Amount, _round_id: RoundId) -> Result<(), String> {
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err("referral service unavailable".to_string());
            }
            self.delivered.fetch_add(stake_lost as usize, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ledger() -> (TempDir, SettlementLedger) {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();
        (dir, SettlementLedger::new(storage, SettlementConfig::default()))
    }

    fn fast_retry_ledger() -> (TempDir, OptimizedStorage, SettlementLedger) {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();
        let retry = SettlementConfig {
            max_retries: 3,
            retry_base_ms: 1,
            retry_max_ms: 4,
        };
        let ledger = SettlementLedger::new(storage.clone(), retry);
        (dir, storage, ledger)
    }

    fn pending_referrals(storage: &OptimizedStorage) -> usize {
        storage.scan_prefix(REFERRAL_PREFIX.as_bytes(), None, 1_000).unwrap().len()
    }

    async fn staked(ledger: &SettlementLedger, round_id: RoundId, name: &str, stake: Amount) -> Wager {
        let player = PlayerId::new(name);
        ledger.deposit(&player, stake).await.unwrap();
        let wager = Wager::new(round_id, player, stake, None);
        ledger.debit_stake(&wager).await.unwrap();
        wager
    }

    fn crashed_round(id: RoundId, crash: u32) -> Round {
        let mut round = Round::new(id, Commitment::fixed(Multiplier::from_hundredths(crash)));
        round.transition(RoundStatus::Flying).unwrap();
        round.transition(RoundStatus::Crashed).unwrap();
        round
    }

    #[tokio::test]
    async fn test_deposit_and_debit() {
        let (_dir, ledger) = ledger();
        let p = PlayerId::new("alice");
        assert_eq!(ledger.balance(&p).unwrap(), 0);
        assert_eq!(ledger.deposit(&p, 100).await.unwrap(), 100);

        let wager = Wager::new(1, p.clone(), 30, None);
        assert_eq!(ledger.debit_stake(&wager).await.unwrap(), 70);

        let too_big = Wager::new(2, p.clone(), 71, None);
        match ledger.debit_stake(&too_big).await {
            Err(CrashError::InsufficientFunds { required, available }) => {
                assert_eq!(required, 71);
                assert_eq!(available, 70);
            }
            other => panic!("expected insufficient funds, got {:?}", other),
        }
        assert_eq!(ledger.balance(&p).unwrap(), 70);
        assert!(ledger.deposit(&p, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_credit_cashouts_updates_stats() {
        let (_dir, ledger) = ledger();
        let p = PlayerId::new("bob");
        ledger.deposit(&p, 1_000).await.unwrap();
        let mut wager = Wager::new(1, p.clone(), 1_000, None);
        ledger.debit_stake(&wager).await.unwrap();

        wager.settle_win(Multiplier::from_hundredths(250)).unwrap();
        let balances = ledger.credit_cashouts(&[wager]).await.unwrap();
        assert_eq!(balances, vec![2_500]);

        let stats = ledger.player_stats(&p).unwrap();
        assert_eq!(stats.games_played, 1);
        assert_eq!(stats.games_won, 1);
        assert_eq!(stats.total_won, 2_500);
        assert_eq!(stats.net_profit, 1_500);
        assert_eq!(stats.win_rate, 1.0);
        assert_eq!(stats.best_multiplier, Some(Multiplier::from_hundredths(250)));
    }

    #[tokio::test]
    async fn test_credit_rejects_unsettled_wager() {
        let (_dir, ledger) = ledger();
        let wager = Wager::new(1, PlayerId::new("c"), 10, None);
        assert!(matches!(
            ledger.credit_cashouts(&[wager]).await,
            Err(CrashError::ConcurrencyConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_settle_round_is_idempotent() {
        let (_dir, ledger) = ledger();
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        let ledger = ledger.with_referral_hook(hook.clone());
        let round = crashed_round(3, 142);

        let loser = PlayerId::new("loser");
        let winner = PlayerId::new("winner");
        ledger.deposit(&loser, 10).await.unwrap();
        ledger.deposit(&winner, 10).await.unwrap();

        let open = Wager::new(3, loser.clone(), 10, None);
        let mut won = Wager::new(3, winner.clone(), 10, None);
        ledger.debit_stake(&open).await.unwrap();
        ledger.debit_stake(&won).await.unwrap();
        won.settle_win(Multiplier::from_hundredths(120)).unwrap();
        ledger.credit_cashouts(&[won.clone()]).await.unwrap();

        let first = ledger.settle_round(&round, &[open.clone(), won.clone()]).await.unwrap();
        assert_eq!(first.recorded, 2);
        assert_eq!(first.losers, 1);
        assert_eq!(first.total_lost, 10);

        let again = ledger.settle_round(&round, &[open, won]).await.unwrap();
        assert_eq!(again.recorded, 0);
        assert_eq!(again.skipped, 2);
        assert_eq!(hook.0.load(Ordering::SeqCst), 10);

        let record = ledger.game_record(3, &loser).unwrap().unwrap();
        assert!(!record.is_win);
        assert_eq!(record.profit, -10);
        assert_eq!(record.crash_point, Multiplier::from_hundredths(142));
        assert_eq!(ledger.balance(&loser).unwrap(), 0);
        assert_eq!(ledger.player_stats(&loser).unwrap().total_wagered, 10);

        let record = ledger.game_record(3, &winner).unwrap().unwrap();
        assert!(record.is_win);
        assert_eq!(record.cashout_multiplier, Some(Multiplier::from_hundredths(120)));
        assert_eq!(ledger.balance(&winner).unwrap(), 12);
    }

    #[tokio::test]
    async fn test_refund_round_returns_only_open_stakes() {
        let (_dir, ledger) = ledger();
        let a = PlayerId::new("a");
        let b = PlayerId::new("b");
        ledger.deposit(&a, 50).await.unwrap();
        ledger.deposit(&b, 50).await.unwrap();

        let open = Wager::new(7, a.clone(), 20, None);
        let mut won = Wager::new(7, b.clone(), 20, None);
        ledger.debit_stake(&open).await.unwrap();
        ledger.debit_stake(&won).await.unwrap();
        won.settle_win(Multiplier::from_hundredths(150)).unwrap();
        ledger.credit_cashouts(&[won.clone()]).await.unwrap();

        let refunded = ledger.refund_round(7, &[open, won]).await.unwrap();
        assert_eq!(refunded.len(), 1);
        assert_eq!(refunded[0].outcome, WagerOutcome::Refunded);
        assert_eq!(ledger.balance(&a).unwrap(), 50);
        assert_eq!(ledger.balance(&b).unwrap(), 60);

        // Already refunded: nothing to do
        assert!(ledger.refund_round(7, &refunded).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_trail_is_newest_first() {
        let (_dir, ledger) = ledger();
        let p = PlayerId::new("audited");
        ledger.deposit(&p, 100).await.unwrap();
        let wager = Wager::new(1, p.clone(), 40, None);
        ledger.debit_stake(&wager).await.unwrap();
        ledger.refund_round(1, &[wager]).await.unwrap();

        let entries = ledger.entries_for(&p, 10).unwrap();
        let kinds: Vec<_> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EntryKind::Refund, EntryKind::Bet, EntryKind::Deposit]);
        assert_eq!(entries[1].amount, -40);
        assert_eq!(entries[1].balance_before, 100);
        assert_eq!(entries[1].balance_after, 60);

        // Another player's trail stays separate
        assert!(ledger.entries_for(&PlayerId::new("audite"), 10).unwrap().is_empty());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let (_dir, ledger) = ledger();
        assert_eq!(ledger.backoff(0), Duration::from_millis(50));
        assert_eq!(ledger.backoff(1), Duration::from_millis(100));
        assert_eq!(ledger.backoff(3), Duration::from_millis(400));
        assert_eq!(ledger.backoff(10), Duration::from_millis(2_000));
        assert_eq!(ledger.backoff(200), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_settle_round_retries_transient_write_failures() {
        let (_dir, storage, ledger) = fast_retry_ledger();
        let round = crashed_round(4, 180);
        let wager = staked(&ledger, 4, "retry", 25).await;

        storage.fail_next_writes(2);
        let settlement = ledger.settle_round(&round, &[wager.clone()]).await.unwrap();
        assert_eq!(settlement.recorded, 1);
        assert_eq!(settlement.losers, 1);
        assert!(!ledger.game_record(4, &wager.player_id).unwrap().unwrap().is_win);
    }

    #[tokio::test]
    async fn test_settle_round_gives_up_after_max_retries() {
        let (_dir, storage, ledger) = fast_retry_ledger();
        let round = crashed_round(5, 180);
        let wager = staked(&ledger, 5, "unlucky", 25).await;

        storage.fail_next_writes(10);
        assert!(matches!(
            ledger.settle_round(&round, &[wager.clone()]).await,
            Err(CrashError::Persistence(_))
        ));
        assert!(ledger.game_record(5, &wager.player_id).unwrap().is_none());

        storage.fail_next_writes(0);
        let settlement = ledger.settle_round(&round, &[wager.clone()]).await.unwrap();
        assert_eq!(settlement.recorded, 1);
        assert_eq!(settlement.skipped, 0);
    }

    #[tokio::test]
    async fn test_failed_referral_is_delivered_on_next_settlement() {
        let (_dir, storage, ledger) = fast_retry_ledger();
        let hook = Arc::new(FlakyHook {
            failures: AtomicUsize::new(1),
            delivered: AtomicUsize::new(0),
        });
        let ledger = ledger.with_referral_hook(hook.clone());
        let round = crashed_round(6, 110);
        let wager = staked(&ledger, 6, "referred", 40).await;

        ledger.settle_round(&round, &[wager.clone()]).await.unwrap();
        assert_eq!(hook.delivered.load(Ordering::SeqCst), 0);
        assert_eq!(pending_referrals(&storage), 1);

        // The round is already recorded, but the pending stake still goes out
        let again = ledger.settle_round(&round, &[wager]).await.unwrap();
        assert_eq!(again.skipped, 1);
        assert_eq!(hook.delivered.load(Ordering::SeqCst), 40);
        assert_eq!(pending_referrals(&storage), 0);
    }

    #[tokio::test]
    async fn test_idle_player_locks_are_pruned() {
        let (_dir, ledger) = ledger();
        let mut wagers = Vec::new();
        for i in 0..20 {
            wagers.push(staked(&ledger, 8, &format!("p{}", i), 5).await);
        }
        assert_eq!(ledger.locks.len(), 20);

        ledger.settle_round(&crashed_round(8, 120), &wagers).await.unwrap();
        assert_eq!(ledger.locks.len(), 0);
    }
}
