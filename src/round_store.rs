//! Persistent round, wager and history records stored in RocksDB.
//!
//! Key layout (ids big-endian so prefix scans come back ordered):
//! - `crash:round:{round_id}` → [`Round`]
//! - `crash:meta:latest_round` → latest round id
//! - `crash:wager:{round_id}:{player}` → [`Wager`]
//! - `crash:outcome:{round_id}:{player}` → settlement record (see `ledger`)
//! - `crash:history:{inv_round_id}` → [`HistoryEntry`], newest first

use crate::{
    errors::{CrashError, CrashResult, StorageError},
    round::{Round, Wager, WagerOutcome},
    storage::{OptimizedStorage, StorageBatch},
    types::{Amount, Multiplier, RoundId},
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

const ROUND_PREFIX: &[u8] = b"crash:round:";
const LATEST_ROUND_KEY: &[u8] = b"crash:meta:latest_round";
const WAGER_PREFIX: &[u8] = b"crash:wager:";
const OUTCOME_PREFIX: &[u8] = b"crash:outcome:";
const HISTORY_PREFIX: &[u8] = b"crash:history:";

/// Largest page [`load_history`] will return
pub const MAX_HISTORY: usize = 100;

/// Summary of a completed round for the public history feed
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub round_id: RoundId,
    pub crash_point: Multiplier,
    pub total_bets: usize,
    pub total_amount: Amount,
    pub total_winners: usize,
    pub total_win_amount: Amount,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    /// Tally a settled round. Refunded wagers are not counted.
    pub fn from_round(round: &Round, wagers: &[Wager]) -> Self {
        let counted: Vec<&Wager> = wagers
            .iter()
            .filter(|w| w.outcome != WagerOutcome::Refunded)
            .collect();
        let winners: Vec<&&Wager> = counted.iter().filter(|w| w.outcome == WagerOutcome::Won).collect();
        Self {
            round_id: round.round_id,
            crash_point: round.crash_point(),
            total_bets: counted.len(),
            total_amount: counted.iter().map(|w| w.stake).sum(),
            total_winners: winners.len(),
            total_win_amount: winners.iter().map(|w| w.win_amount()).sum(),
            timestamp: round.completed_at.unwrap_or_else(Utc::now),
        }
    }
}

fn round_key(round_id: RoundId) -> Vec<u8> {
    let mut key = Vec::with_capacity(ROUND_PREFIX.len() + 8);
    key.extend_from_slice(ROUND_PREFIX);
    key.extend_from_slice(&round_id.to_be_bytes());
    key
}

fn wager_round_prefix(round_id: RoundId) -> Vec<u8> {
    let mut key = Vec::with_capacity(WAGER_PREFIX.len() + 9);
    key.extend_from_slice(WAGER_PREFIX);
    key.extend_from_slice(&round_id.to_be_bytes());
    key.push(b':');
    key
}

pub(crate) fn wager_key(wager: &Wager) -> Vec<u8> {
    let mut key = wager_round_prefix(wager.round_id);
    key.extend_from_slice(wager.player_id.as_str().as_bytes());
    key
}

pub(crate) fn outcome_key(round_id: RoundId, player: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(OUTCOME_PREFIX.len() + 9 + player.len());
    key.extend_from_slice(OUTCOME_PREFIX);
    key.extend_from_slice(&round_id.to_be_bytes());
    key.push(b':');
    key.extend_from_slice(player.as_bytes());
    key
}

fn history_key(round_id: RoundId) -> Vec<u8> {
    // Newest first: inverted id as the sort key
    let inv = u64::MAX - round_id;
    let mut key = Vec::with_capacity(HISTORY_PREFIX.len() + 8);
    key.extend_from_slice(HISTORY_PREFIX);
    key.extend_from_slice(&inv.to_be_bytes());
    key
}

pub(crate) fn encode<T: Serialize>(value: &T, what: &str) -> CrashResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        CrashError::Storage(StorageError::WriteFailed(format!("Failed to encode {}: {}", what, e)))
    })
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> CrashResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        CrashError::Storage(StorageError::CorruptedData(format!("Failed to decode {}: {}", what, e)))
    })
}

/// Queue a round record and the latest-round pointer.
pub fn stage_round(batch: &mut StorageBatch, round: &Round) -> CrashResult<()> {
    batch.put(round_key(round.round_id), encode(round, "round")?);
    batch.put(LATEST_ROUND_KEY, round.round_id.to_be_bytes());
    Ok(())
}

pub fn store_round(storage: &OptimizedStorage, round: &Round) -> CrashResult<()> {
    let mut batch = StorageBatch::new();
    stage_round(&mut batch, round)?;
    storage.commit(batch)?;
    tracing::debug!(round_id = round.round_id, status = %round.status, "Stored round");
    Ok(())
}

pub fn load_round(storage: &OptimizedStorage, round_id: RoundId) -> CrashResult<Option<Round>> {
    let Some(bytes) = storage.get(&round_key(round_id))? else {
        return Ok(None);
    };
    decode(&bytes, &format!("round {}", round_id)).map(Some)
}

pub fn latest_round_id(storage: &OptimizedStorage) -> CrashResult<Option<RoundId>> {
    let Some(bytes) = storage.get(LATEST_ROUND_KEY)? else {
        return Ok(None);
    };
    let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
        CrashError::Storage(StorageError::CorruptedData(format!(
            "latest round pointer has {} bytes",
            bytes.len()
        )))
    })?;
    Ok(Some(u64::from_be_bytes(raw)))
}

pub fn load_latest_round(storage: &OptimizedStorage) -> CrashResult<Option<Round>> {
    match latest_round_id(storage)? {
        Some(id) => load_round(storage, id),
        None => Ok(None),
    }
}

/// Ids start at 1 and continue from the last persisted round.
pub fn next_round_id(storage: &OptimizedStorage) -> CrashResult<RoundId> {
    Ok(latest_round_id(storage)?.map_or(1, |id| id + 1))
}

pub fn stage_wager(batch: &mut StorageBatch, wager: &Wager) -> CrashResult<()> {
    batch.put(wager_key(wager), encode(wager, "wager")?);
    Ok(())
}

/// All wagers of a round in placement order.
pub fn load_wagers(storage: &OptimizedStorage, round_id: RoundId) -> CrashResult<Vec<Wager>> {
    let prefix = wager_round_prefix(round_id);
    let rows = storage.scan_prefix(&prefix, None, usize::MAX)?;
    let mut wagers = rows
        .iter()
        .map(|(_, value)| decode::<Wager>(value, "wager"))
        .collect::<CrashResult<Vec<_>>>()?;
    wagers.sort_by_key(|w| w.placed_at);
    Ok(wagers)
}

pub fn stage_history(batch: &mut StorageBatch, entry: &HistoryEntry) -> CrashResult<()> {
    batch.put(history_key(entry.round_id), encode(entry, "history entry")?);
    Ok(())
}

/// Most recent completed rounds, newest first. `limit` is clamped to
/// `1..=MAX_HISTORY`.
pub fn load_history(storage: &OptimizedStorage, limit: usize) -> CrashResult<Vec<HistoryEntry>> {
    let limit = limit.clamp(1, MAX_HISTORY);
    storage
        .scan_prefix(HISTORY_PREFIX, None, limit)?
        .iter()
        .map(|(_, value)| decode(value, "history entry"))
        .collect()
}
