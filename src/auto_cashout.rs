//! Per-tick auto-cashout.
//!
//! Crossed thresholds are claimed from the [`BetBook`], settled at exactly the
//! configured threshold and credited in a single ledger batch. If the batch
//! fails the claims are released and the same wagers come back on the next
//! tick.

use crate::{
    bet_book::BetBook,
    errors::{CrashError, CrashResult},
    events::{CrashEvent, EventBroadcaster},
    ledger::SettlementLedger,
    round::Wager,
    types::Multiplier,
};
use std::sync::Arc;

pub struct AutoCashoutEvaluator {
    ledger: Arc<SettlementLedger>,
    events: EventBroadcaster,
}

impl AutoCashoutEvaluator {
    pub fn new(ledger: Arc<SettlementLedger>, events: EventBroadcaster) -> Self {
        Self { ledger, events }
    }

    /// Settle every wager whose threshold is at or below
    /// `min(live, crash_point)`. Returns the settled wagers.
    pub async fn evaluate(
        &self,
        book: &BetBook,
        live: Multiplier,
        crash_point: Multiplier,
    ) -> CrashResult<Vec<Wager>> {
        let limit = live.min(crash_point);
        let claimed = book.claim_crossed(limit);
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let mut settled = Vec::with_capacity(claimed.len());
        for wager in &claimed {
            let mut wager = wager.clone();
            let threshold = wager.auto_cashout.ok_or_else(|| {
                CrashError::ConcurrencyConflict(format!("wager of {} has no auto-cashout", wager.player_id))
            });
            let result = threshold.and_then(|t| wager.settle_win(t));
            if let Err(e) = result {
                Self::release_all(book, &claimed);
                return Err(e);
            }
            settled.push(wager);
        }

        if let Err(e) = self.ledger.credit_cashouts(&settled).await {
            Self::release_all(book, &claimed);
            tracing::warn!(
                round_id = book.round_id(),
                wagers = claimed.len(),
                error = %e,
                "Auto-cashout credit failed; will retry next tick"
            );
            return Err(e);
        }

        for wager in &settled {
            book.complete(wager.clone());
            if let Some(multiplier) = wager.cashout_multiplier {
                self.events.publish(CrashEvent::AutoCashOut {
                    round_id: wager.round_id,
                    player_id: wager.player_id.clone(),
                    stake: wager.stake,
                    multiplier,
                    profit: wager.profit,
                });
            }
        }
        tracing::debug!(
            round_id = book.round_id(),
            count = settled.len(),
            live = %live,
            "Auto-cashouts settled"
        );
        Ok(settled)
    }

    fn release_all(book: &BetBook, claimed: &[Wager]) {
        for wager in claimed {
            book.release_claim(&wager.player_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettlementConfig;
    use crate::storage::OptimizedStorage;
    use crate::types::PlayerId;
    use tempfile::TempDir;

    fn m(h: u32) -> Multiplier {
        Multiplier::from_hundredths(h)
    }

    async fn setup(players: &[(&str, u32)]) -> (TempDir, Arc<SettlementLedger>, BetBook) {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();
        let ledger = Arc::new(SettlementLedger::new(storage, SettlementConfig::default()));
        let book = BetBook::new(1);
        for (name, threshold) in players {
            let id = PlayerId::new(*name);
            ledger.deposit(&id, 10).await.unwrap();
            let wager = Wager::new(1, id.clone(), 10, Some(m(*threshold)));
            ledger.debit_stake(&wager).await.unwrap();
            book.reserve(&id).unwrap();
            book.confirm(wager);
        }
        (dir, ledger, book)
    }

    #[tokio::test]
    async fn test_settles_at_exact_threshold() {
        let (_dir, ledger, book) = setup(&[("a", 150), ("b", 150), ("c", 300)]).await;
        let events = EventBroadcaster::new();
        let mut rx = events.subscribe();
        let evaluator = AutoCashoutEvaluator::new(ledger.clone(), events);

        assert!(evaluator.evaluate(&book, m(149), m(500)).await.unwrap().is_empty());

        // Tick jumps 1.49 -> 1.53; both settle at 1.50, not 1.53
        let settled = evaluator.evaluate(&book, m(153), m(500)).await.unwrap();
        assert_eq!(settled.len(), 2);
        for wager in &settled {
            assert_eq!(wager.cashout_multiplier, Some(m(150)));
            assert_eq!(wager.profit, 5);
        }
        assert_eq!(ledger.balance(&PlayerId::new("a")).unwrap(), 15);
        assert_eq!(ledger.balance(&PlayerId::new("b")).unwrap(), 15);
        assert_eq!(ledger.balance(&PlayerId::new("c")).unwrap(), 0);

        match rx.recv().await.unwrap() {
            CrashEvent::AutoCashOut { multiplier, .. } => assert_eq!(multiplier, m(150)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_threshold_above_crash_point_never_fires() {
        let (_dir, ledger, book) = setup(&[("a", 200)]).await;
        let evaluator = AutoCashoutEvaluator::new(ledger.clone(), EventBroadcaster::new());

        // Live value overshoots a 1.42x crash within the tick
        assert!(evaluator.evaluate(&book, m(260), m(142)).await.unwrap().is_empty());
        assert_eq!(book.open_count(), 1);
    }

    #[tokio::test]
    async fn test_each_wager_settles_once() {
        let (_dir, ledger, book) = setup(&[("a", 120)]).await;
        let evaluator = AutoCashoutEvaluator::new(ledger.clone(), EventBroadcaster::new());

        assert_eq!(evaluator.evaluate(&book, m(130), m(500)).await.unwrap().len(), 1);
        assert!(evaluator.evaluate(&book, m(140), m(500)).await.unwrap().is_empty());
        assert_eq!(ledger.balance(&PlayerId::new("a")).unwrap(), 12);
    }
}
