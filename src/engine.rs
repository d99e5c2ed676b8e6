//! Crash engine: player operations and lifecycle transitions over the active
//! round.
//!
//! The active round sits behind a `tokio::sync::RwLock`. Bet placement,
//! cashouts and the per-tick auto-cashout take the read lock so different
//! players proceed in parallel; closing bets, crashing, settling and completing
//! take the write lock and wait for in-flight requests to finish. The live
//! multiplier is an `AtomicU64` holding `f64` bits, written only by
//! [`CrashEngine::tick`].

use crate::{
    auto_cashout::AutoCashoutEvaluator,
    bet_book::BetBook,
    config::CrashConfig,
    errors::{CrashError, CrashResult},
    events::{CrashEvent, EventBroadcaster},
    fairness::{Commitment, Verification},
    ledger::{LedgerEntry, PlayerStats, ReferralHook, SettlementLedger},
    round::{Round, RoundStatus, Wager},
    round_store::{self, HistoryEntry},
    storage::{OptimizedStorage, StorageBatch},
    types::{Amount, Multiplier, PlayerId, RoundId},
};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::RwLock;

/// How long a manual cashout waits for a claim held by the auto-cashout batch
const CLAIM_WAIT_ATTEMPTS: u32 = 50;
const CLAIM_WAIT: Duration = Duration::from_millis(2);

/// Returned by [`CrashEngine::place_bet`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetReceipt {
    pub round_id: RoundId,
    pub balance_after: Amount,
}

/// Returned by [`CrashEngine::cash_out`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashoutReceipt {
    pub round_id: RoundId,
    pub multiplier: Multiplier,
    pub win_amount: Amount,
    pub profit: i64,
    pub balance_after: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetView {
    pub player_id: PlayerId,
    pub stake: Amount,
    pub auto_cashout: Option<Multiplier>,
    pub cashed_out: bool,
    pub cashout_multiplier: Option<Multiplier>,
    pub profit: i64,
}

impl From<&Wager> for BetView {
    fn from(w: &Wager) -> Self {
        Self {
            player_id: w.player_id.clone(),
            stake: w.stake,
            auto_cashout: w.auto_cashout,
            cashed_out: w.cashed_out,
            cashout_multiplier: w.cashout_multiplier,
            profit: w.profit,
        }
    }
}

/// Public snapshot of the active round. Seed and crash point only appear
/// once the round has crashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStateView {
    pub round_id: Option<RoundId>,
    pub status: Option<RoundStatus>,
    pub current_multiplier: f64,
    pub server_seed_hash: Option<String>,
    pub crash_point: Option<Multiplier>,
    pub server_seed: Option<String>,
    pub bets: Vec<BetView>,
}

/// What one clock tick did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    Flying(Multiplier),
    Crashed(Multiplier),
}

struct ActiveRound {
    round: Round,
    book: Arc<BetBook>,
    settled: bool,
}

pub struct CrashEngine {
    config: CrashConfig,
    storage: OptimizedStorage,
    ledger: Arc<SettlementLedger>,
    events: EventBroadcaster,
    auto_cashout: AutoCashoutEvaluator,
    active: RwLock<Option<ActiveRound>>,
    live: AtomicU64,
}

impl CrashEngine {
    pub fn new(config: CrashConfig, storage: OptimizedStorage) -> Self {
        let ledger = SettlementLedger::new(storage.clone(), config.settlement.clone());
        Self::with_ledger(config, storage, ledger)
    }

    pub fn with_referral_hook(config: CrashConfig, storage: OptimizedStorage, hook: Arc<dyn ReferralHook>) -> Self {
        let ledger = SettlementLedger::new(storage.clone(), config.settlement.clone()).with_referral_hook(hook);
        Self::with_ledger(config, storage, ledger)
    }

    fn with_ledger(config: CrashConfig, storage: OptimizedStorage, ledger: SettlementLedger) -> Self {
        let ledger = Arc::new(ledger);
        let events = EventBroadcaster::new();
        Self {
            auto_cashout: AutoCashoutEvaluator::new(ledger.clone(), events.clone()),
            config,
            storage,
            ledger,
            events,
            active: RwLock::new(None),
            live: AtomicU64::new(1.0f64.to_bits()),
        }
    }

    pub fn config(&self) -> &CrashConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn ledger(&self) -> &SettlementLedger {
        &self.ledger
    }

    fn live_value(&self) -> f64 {
        f64::from_bits(self.live.load(Ordering::Acquire))
    }

    fn set_live(&self, value: f64) {
        self.live.store(value.to_bits(), Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create the next round with a fresh commitment and open betting.
    pub async fn begin_round(&self) -> CrashResult<RoundId> {
        let commitment = Commitment::generate(self.config.fairness.bias, self.config.crash_ceiling())?;
        self.begin_round_with(commitment).await
    }

    /// Open a round with a caller-supplied commitment (replays and tests).
    pub async fn begin_round_with(&self, commitment: Commitment) -> CrashResult<RoundId> {
        let mut active = self.active.write().await;
        if let Some(current) = active.as_ref() {
            if current.round.status != RoundStatus::Completed {
                return Err(CrashError::InvalidTransition {
                    from: current.round.status,
                    to: RoundStatus::Waiting,
                });
            }
        }

        let round_id = round_store::next_round_id(&self.storage)?;
        let round = Round::new(round_id, commitment);
        round_store::store_round(&self.storage, &round)?;

        self.events.publish(CrashEvent::RoundCreated {
            round_id,
            server_seed_hash: round.server_seed_hash().to_string(),
            countdown: self.config.game.waiting_secs,
        });
        tracing::info!(
            round_id,
            server_seed_hash = round.server_seed_hash(),
            "🎲 Round created, betting open"
        );

        self.set_live(1.0);
        *active = Some(ActiveRound {
            round,
            book: Arc::new(BetBook::new(round_id)),
            settled: false,
        });
        Ok(round_id)
    }

    /// Close betting and start the flight.
    pub async fn close_betting(&self) -> CrashResult<()> {
        let mut guard = self.active.write().await;
        let active = guard
            .as_mut()
            .ok_or_else(|| CrashError::Validation("no active round".to_string()))?;
        active.round.transition(RoundStatus::Flying)?;
        round_store::store_round(&self.storage, &active.round)?;
        self.set_live(1.0);

        let (bets, amount) = active.book.totals();
        self.events.publish(CrashEvent::RoundStarted {
            round_id: active.round.round_id,
        });
        tracing::info!(round_id = active.round.round_id, bets, amount, "🚀 Round started");
        Ok(())
    }

    /// Apply one clock tick. Auto-cashouts run first; then, if `value` has
    /// reached the crash point, the round crashes.
    pub async fn tick(&self, value: f64) -> CrashResult<TickOutcome> {
        let live = Multiplier::from_f64_floor(value);
        let crash_point = {
            let guard = self.active.read().await;
            let active = guard
                .as_ref()
                .filter(|a| a.round.status == RoundStatus::Flying)
                .ok_or_else(|| CrashError::Validation("no round in flight".to_string()))?;
            let crash_point = active.round.crash_point();

            if let Err(e) = self.auto_cashout.evaluate(&active.book, live, crash_point).await {
                if !e.is_retryable() {
                    return Err(e);
                }
            }

            if live < crash_point {
                self.set_live(value);
                self.events.publish(CrashEvent::MultiplierUpdate {
                    round_id: active.round.round_id,
                    multiplier: live.as_f64(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
                return Ok(TickOutcome::Flying(live));
            }
            crash_point
        };

        self.crash().await?;
        Ok(TickOutcome::Crashed(crash_point))
    }

    /// Record the crash: auto-cashouts at or below the crash point are paid,
    /// remaining open wagers are lost, the seed is revealed and the displayed
    /// multiplier is clamped to the crash point.
    ///
    /// If the auto-cashouts cannot be credited the round stays in flight and
    /// the error is returned.
    pub async fn crash(&self) -> CrashResult<Multiplier> {
        let mut guard = self.active.write().await;
        let active = guard
            .as_mut()
            .ok_or_else(|| CrashError::Validation("no active round".to_string()))?;
        if active.round.status != RoundStatus::Flying {
            return Err(CrashError::InvalidTransition {
                from: active.round.status,
                to: RoundStatus::Crashed,
            });
        }
        let crash_point = active.round.crash_point();
        self.settle_crossed_thresholds(&active.book, crash_point).await?;

        active.round.transition(RoundStatus::Crashed)?;
        self.set_live(crash_point.as_f64());

        for mut wager in active.book.claim_all_open() {
            wager.settle_loss()?;
            active.book.complete(wager);
        }
        round_store::store_round(&self.storage, &active.round)?;

        let commitment = active.round.commitment();
        self.events.publish(CrashEvent::RoundCrashed {
            round_id: active.round.round_id,
            crash_point,
            server_seed: commitment.server_seed.clone(),
            nonce: commitment.nonce,
        });
        tracing::info!(round_id = active.round.round_id, crash_point = %crash_point, "💥 Round crashed");
        Ok(crash_point)
    }

    async fn settle_crossed_thresholds(&self, book: &BetBook, crash_point: Multiplier) -> CrashResult<()> {
        let mut attempt = 0u32;
        loop {
            match self.auto_cashout.evaluate(book, crash_point, crash_point).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.settlement.max_retries => {
                    tokio::time::sleep(self.ledger.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        round_id = book.round_id(),
                        crash_point = %crash_point,
                        error = %e,
                        "Auto-cashouts at the crash point could not be credited, round stays in flight"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Write game records for every wager of the crashed round.
    pub async fn settle(&self) -> CrashResult<()> {
        let mut guard = self.active.write().await;
        let active = guard
            .as_mut()
            .ok_or_else(|| CrashError::Validation("no active round".to_string()))?;
        if active.round.status != RoundStatus::Crashed {
            return Err(CrashError::Validation(format!(
                "round {} is {}, not crashed",
                active.round.round_id, active.round.status
            )));
        }
        self.ledger.settle_round(&active.round, &active.book.wagers()).await?;
        active.settled = true;
        Ok(())
    }

    /// Close a settled round and append it to the history feed.
    pub async fn complete(&self) -> CrashResult<HistoryEntry> {
        let mut guard = self.active.write().await;
        let active = guard
            .as_mut()
            .ok_or_else(|| CrashError::Validation("no active round".to_string()))?;
        if !active.settled {
            return Err(CrashError::Persistence(format!(
                "round {} has not been settled",
                active.round.round_id
            )));
        }
        active.round.transition(RoundStatus::Completed)?;
        let entry = Self::persist_completion(&self.storage, &active.round, &active.book.wagers())?;

        self.events.publish(CrashEvent::RoundCompleted {
            round_id: entry.round_id,
            crash_point: entry.crash_point,
            total_bets: entry.total_bets,
            total_amount: entry.total_amount,
        });
        tracing::info!(
            round_id = entry.round_id,
            crash_point = %entry.crash_point,
            bets = entry.total_bets,
            winners = entry.total_winners,
            "✅ Round completed"
        );
        Ok(entry)
    }

    fn persist_completion(storage: &OptimizedStorage, round: &Round, wagers: &[Wager]) -> CrashResult<HistoryEntry> {
        let entry = HistoryEntry::from_round(round, wagers);
        let mut batch = StorageBatch::new();
        round_store::stage_round(&mut batch, round)?;
        round_store::stage_history(&mut batch, &entry)?;
        storage.commit(batch)?;
        Ok(entry)
    }

    /// End the current round without a crash, refunding open stakes.
    pub async fn void_round(&self) -> CrashResult<()> {
        let mut guard = self.active.write().await;
        match guard.as_mut() {
            Some(active) if active.round.status != RoundStatus::Completed => self.void_active(active).await,
            _ => Ok(()),
        }
    }

    async fn void_active(&self, active: &mut ActiveRound) -> CrashResult<()> {
        let claimed = active.book.claim_all_open();
        let refunded = match self.ledger.refund_round(active.round.round_id, &claimed).await {
            Ok(refunded) => refunded,
            Err(e) => {
                for wager in &claimed {
                    active.book.release_claim(&wager.player_id);
                }
                return Err(e);
            }
        };
        let refunded_count = refunded.len();
        for wager in refunded {
            active.book.complete(wager);
        }
        active.round.void()?;
        active.settled = true;
        round_store::store_round(&self.storage, &active.round)?;

        self.events.publish(CrashEvent::RoundVoided {
            round_id: active.round.round_id,
            refunded: refunded_count,
        });
        tracing::warn!(
            round_id = active.round.round_id,
            refunded = refunded_count,
            "🛑 Round voided, open stakes refunded"
        );
        Ok(())
    }

    /// Finish whatever round was left unfinished, in memory or on disk.
    ///
    /// Rounds interrupted while waiting or flying are voided. Crashed rounds
    /// have their settlement completed and are closed normally.
    pub async fn recover(&self) -> CrashResult<()> {
        let mut guard = self.active.write().await;
        if guard.as_ref().map_or(true, |a| a.round.status == RoundStatus::Completed) {
            let Some(round) = round_store::load_latest_round(&self.storage)? else {
                return Ok(());
            };
            if round.status == RoundStatus::Completed {
                return Ok(());
            }
            let wagers = round_store::load_wagers(&self.storage, round.round_id)?;
            tracing::warn!(
                round_id = round.round_id,
                status = %round.status,
                wagers = wagers.len(),
                "♻️ Recovering unfinished round from storage"
            );
            *guard = Some(ActiveRound {
                book: Arc::new(BetBook::from_wagers(round.round_id, wagers)),
                round,
                settled: false,
            });
        }
        let Some(active) = guard.as_mut() else {
            return Ok(());
        };

        match active.round.status {
            RoundStatus::Waiting | RoundStatus::Flying => self.void_active(active).await?,
            RoundStatus::Crashed => {
                for mut wager in active.book.claim_all_open() {
                    wager.settle_loss()?;
                    active.book.complete(wager);
                }
                if !active.settled {
                    self.ledger.settle_round(&active.round, &active.book.wagers()).await?;
                    active.settled = true;
                }
                active.round.transition(RoundStatus::Completed)?;
                let entry = Self::persist_completion(&self.storage, &active.round, &active.book.wagers())?;
                tracing::info!(round_id = entry.round_id, "♻️ Reconciled crashed round");
            }
            RoundStatus::Completed => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Player operations
    // ------------------------------------------------------------------

    /// Place a wager in the current betting window.
    pub async fn place_bet(&self, player: &PlayerId, stake: Amount, auto_cashout: Option<f64>) -> CrashResult<BetReceipt> {
        let game = &self.config.game;
        if player.as_str().is_empty() {
            return Err(CrashError::Validation("player id is required".to_string()));
        }
        if stake < game.min_bet || stake > game.max_bet {
            return Err(CrashError::Validation(format!(
                "stake {} outside [{}, {}]",
                stake, game.min_bet, game.max_bet
            )));
        }
        let auto_cashout = match auto_cashout {
            None => None,
            Some(raw) => {
                let threshold = Multiplier::from_f64_round(raw)
                    .ok_or_else(|| CrashError::Validation(format!("invalid auto-cashout {}", raw)))?;
                if threshold < Multiplier::MIN_AUTO_CASHOUT {
                    return Err(CrashError::Validation(format!(
                        "auto-cashout {} below minimum {}",
                        threshold,
                        Multiplier::MIN_AUTO_CASHOUT
                    )));
                }
                if threshold > self.config.crash_ceiling() {
                    return Err(CrashError::Validation(format!(
                        "auto-cashout {} above maximum {}",
                        threshold,
                        self.config.crash_ceiling()
                    )));
                }
                Some(threshold)
            }
        };

        let guard = self.active.read().await;
        let active = guard
            .as_ref()
            .ok_or_else(|| CrashError::Validation("no round is accepting bets".to_string()))?;
        if active.round.status != RoundStatus::Waiting {
            return Err(CrashError::Validation(format!(
                "betting is closed for round {}",
                active.round.round_id
            )));
        }

        let round_id = active.round.round_id;
        active.book.reserve(player)?;
        let wager = Wager::new(round_id, player.clone(), stake, auto_cashout);
        let balance_after = match self.ledger.debit_stake(&wager).await {
            Ok(balance) => balance,
            Err(e) => {
                active.book.release(player);
                return Err(e);
            }
        };
        active.book.confirm(wager);

        let (total_bets, total_amount) = active.book.totals();
        self.events.publish(CrashEvent::BetPlaced {
            round_id,
            player_id: player.clone(),
            stake,
            auto_cashout,
            total_bets,
            total_amount,
        });
        tracing::debug!(round_id, player = %player, stake, "Bet placed");
        Ok(BetReceipt { round_id, balance_after })
    }

    /// Cash out at the multiplier current at the time of the request.
    pub async fn cash_out(&self, player: &PlayerId) -> CrashResult<CashoutReceipt> {
        let guard = self.active.read().await;
        let active = guard
            .as_ref()
            .ok_or_else(|| CrashError::Validation("no active round".to_string()))?;
        let round_id = active.round.round_id;
        match active.round.status {
            RoundStatus::Waiting => {
                return Err(CrashError::Validation(format!("round {} has not started", round_id)))
            }
            RoundStatus::Crashed | RoundStatus::Completed => return Err(CrashError::StaleRound { round_id }),
            RoundStatus::Flying => {}
        }

        // Below the crash point: the tick loop never stores a crossing value
        let multiplier = Multiplier::from_f64_floor(self.live_value());
        let mut settled = Self::claim_for_cashout(&active.book, player).await?;
        if let Err(e) = settled.settle_win(multiplier) {
            active.book.release_claim(player);
            return Err(e);
        }

        let balances = match self.ledger.credit_cashouts(std::slice::from_ref(&settled)).await {
            Ok(balances) => balances,
            Err(e) => {
                active.book.release_claim(player);
                return Err(e);
            }
        };
        active.book.complete(settled.clone());

        self.events.publish(CrashEvent::ManualCashOut {
            round_id,
            player_id: player.clone(),
            stake: settled.stake,
            multiplier,
            profit: settled.profit,
        });
        tracing::debug!(round_id, player = %player, multiplier = %multiplier, "Manual cashout");
        Ok(CashoutReceipt {
            round_id,
            multiplier,
            win_amount: settled.win_amount(),
            profit: settled.profit,
            balance_after: balances.first().copied().unwrap_or_default(),
        })
    }

    /// Claim a wager for a manual cashout. A claim held by the auto-cashout
    /// batch ends with one ledger write, so wait for it instead of failing:
    /// the wager is then either ours or already cashed out.
    async fn claim_for_cashout(book: &BetBook, player: &PlayerId) -> CrashResult<Wager> {
        let mut attempt = 0;
        loop {
            match book.claim(player) {
                Err(CrashError::ConcurrencyConflict(_)) if attempt < CLAIM_WAIT_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(CLAIM_WAIT).await;
                }
                other => return other,
            }
        }
    }

    pub async fn current_state(&self) -> GameStateView {
        let guard = self.active.read().await;
        match guard.as_ref() {
            None => GameStateView {
                round_id: None,
                status: None,
                current_multiplier: 1.0,
                server_seed_hash: None,
                crash_point: None,
                server_seed: None,
                bets: Vec::new(),
            },
            Some(active) => {
                let round = &active.round;
                let revealed = round.status.is_revealed();
                GameStateView {
                    round_id: Some(round.round_id),
                    status: Some(round.status),
                    current_multiplier: Multiplier::from_f64_floor(self.live_value()).as_f64(),
                    server_seed_hash: Some(round.server_seed_hash().to_string()),
                    crash_point: revealed.then(|| round.crash_point()),
                    server_seed: round.revealed_seed().map(str::to_string),
                    bets: active.book.wagers().iter().map(BetView::from).collect(),
                }
            }
        }
    }

    /// Completed rounds, newest first. `limit` is clamped to 1..=100.
    pub fn history(&self, limit: usize) -> CrashResult<Vec<HistoryEntry>> {
        round_store::load_history(&self.storage, limit)
    }

    pub fn player_stats(&self, player: &PlayerId) -> CrashResult<PlayerStats> {
        self.ledger.player_stats(player)
    }

    pub async fn deposit(&self, player: &PlayerId, amount: Amount) -> CrashResult<Amount> {
        self.ledger.deposit(player, amount).await
    }

    pub fn balance(&self, player: &PlayerId) -> CrashResult<Amount> {
        self.ledger.balance(player)
    }

    pub fn entries_for(&self, player: &PlayerId, limit: usize) -> CrashResult<Vec<LedgerEntry>> {
        self.ledger.entries_for(player, limit)
    }

    /// Recompute the commitment of a crashed or completed round.
    pub fn verify_round(&self, round_id: RoundId) -> CrashResult<Verification> {
        let round = round_store::load_round(&self.storage, round_id)?
            .ok_or_else(|| CrashError::Validation(format!("round {} not found", round_id)))?;
        if !round.status.is_revealed() {
            return Err(CrashError::Validation(format!(
                "round {} has not crashed yet",
                round_id
            )));
        }
        round.commitment().verify()
    }
}
