//! Perpetual round loop.
//!
//! `reconcile → create → waiting (countdown) → flying → crashed → settle →
//! pause → completed → repeat`. A failed cycle is logged and followed by a
//! cooldown; the loop itself never stops on an error.
//!
//! Shutdown is requested through a `watch` channel and observed between
//! rounds and during the betting window. A round that is already flying
//! always runs to its crash and full settlement first.

use crate::{
    clock::MultiplierClock,
    engine::{CrashEngine, TickOutcome},
    errors::CrashResult,
    events::CrashEvent,
    types::{Multiplier, RoundId},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Create the shutdown signal shared by the binary and the scheduler.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoundEnd {
    Completed { round_id: RoundId, crash_point: Multiplier },
    /// Shutdown arrived during betting; stakes were refunded
    Voided { round_id: RoundId },
}

pub struct RoundScheduler {
    engine: Arc<CrashEngine>,
    shutdown: watch::Receiver<bool>,
    rounds_completed: u64,
}

impl RoundScheduler {
    pub fn new(engine: Arc<CrashEngine>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            engine,
            shutdown,
            rounds_completed: 0,
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `duration` unless shutdown is requested first. Returns
    /// `true` on shutdown.
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        if self.shutdown_requested() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = self.shutdown.changed() => match changed {
                Ok(()) => *self.shutdown.borrow(),
                // Sender gone: nobody can ask us to stop any more
                Err(_) => {
                    tokio::time::sleep(duration).await;
                    false
                }
            },
        }
    }

    /// Run rounds until shutdown. Returns the number of completed rounds.
    pub async fn run(mut self) -> u64 {
        info!("🚀 Crash round scheduler started");
        while !self.shutdown_requested() {
            match self.run_round().await {
                Ok(RoundEnd::Completed { .. }) => self.rounds_completed += 1,
                Ok(RoundEnd::Voided { round_id }) => {
                    info!(round_id, "Shutdown during betting window");
                    break;
                }
                Err(e) => {
                    error!(error = %e, code = e.code(), "Round cycle failed");
                    let cooldown = self.engine.config().error_cooldown();
                    if self.sleep_or_shutdown(cooldown).await {
                        break;
                    }
                }
            }
        }

        // Leave nothing half-finished behind
        if let Err(e) = self.engine.recover().await {
            error!(error = %e, "Final reconciliation failed, reconciliation required on next start");
        }
        info!(rounds = self.rounds_completed, "🛑 Crash round scheduler stopped");
        self.rounds_completed
    }

    /// One full round cycle.
    pub async fn run_round(&mut self) -> CrashResult<RoundEnd> {
        self.engine.recover().await?;

        let round_id = self.engine.begin_round().await?;
        if self.betting_window(round_id).await {
            self.engine.void_round().await?;
            return Ok(RoundEnd::Voided { round_id });
        }

        self.engine.close_betting().await?;
        let crash_point = self.fly().await?;

        self.engine.settle().await?;
        let pause = self.engine.config().settlement_pause();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        self.engine.complete().await?;
        Ok(RoundEnd::Completed { round_id, crash_point })
    }

    /// Count down the betting window, one update per second. Returns `true`
    /// if shutdown was requested.
    async fn betting_window(&mut self, round_id: RoundId) -> bool {
        let mut seconds_left = self.engine.config().game.waiting_secs;
        while seconds_left > 0 {
            if self.sleep_or_shutdown(Duration::from_secs(1)).await {
                return true;
            }
            seconds_left -= 1;
            self.engine
                .events()
                .publish(CrashEvent::CountdownUpdate { round_id, seconds_left });
        }
        self.shutdown_requested()
    }

    /// Drive the clock until the round crashes.
    async fn fly(&self) -> CrashResult<Multiplier> {
        let config = self.engine.config();
        let mut clock = MultiplierClock::new(&config.game);
        let mut ticker = tokio::time::interval(clock.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let log_every = u64::from(config.monitoring.tick_log_every.max(1));

        clock.start();
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let value = clock.advance();
            match self.engine.tick(value).await? {
                TickOutcome::Flying(live) => {
                    if clock.ticks() % log_every == 0 {
                        debug!(ticks = clock.ticks(), multiplier = %live, "Flying");
                    }
                }
                TickOutcome::Crashed(crash_point) => return Ok(crash_point),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrashConfig;
    use crate::round::RoundStatus;
    use crate::storage::OptimizedStorage;
    use tempfile::TempDir;

    fn engine(config: CrashConfig) -> (TempDir, Arc<CrashEngine>) {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();
        (dir, Arc::new(CrashEngine::new(config, storage)))
    }

    fn fast_config() -> CrashConfig {
        let mut config = CrashConfig::testing();
        config.fairness.max_crash_point = 3.0;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_round_cycle() {
        let (_dir, engine) = engine(fast_config());
        let (_tx, rx) = shutdown_channel();
        let mut scheduler = RoundScheduler::new(engine.clone(), rx);
        let mut events = engine.events().subscribe();

        let end = scheduler.run_round().await.unwrap();
        let RoundEnd::Completed { round_id, crash_point } = end else {
            panic!("round was voided");
        };
        assert_eq!(round_id, 1);
        assert!(crash_point <= Multiplier::from_hundredths(300));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if !matches!(event, CrashEvent::MultiplierUpdate { .. }) {
                seen.push(event);
            }
        }
        assert!(matches!(seen.first(), Some(CrashEvent::RoundCreated { countdown: 1, .. })));
        assert!(matches!(seen[1], CrashEvent::CountdownUpdate { seconds_left: 0, .. }));
        assert!(matches!(seen[2], CrashEvent::RoundStarted { .. }));
        assert!(matches!(seen.last(), Some(CrashEvent::RoundCompleted { .. })));
        assert_eq!(engine.current_state().await.status, Some(RoundStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_betting_voids_round() {
        let (_dir, engine) = engine(fast_config());
        let (tx, rx) = shutdown_channel();
        tx.send(true).unwrap();

        let mut scheduler = RoundScheduler::new(engine.clone(), rx);
        let end = scheduler.run_round().await.unwrap();
        assert_eq!(end, RoundEnd::Voided { round_id: 1 });
        assert!(engine.history(10).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (_dir, engine) = engine(fast_config());
        let (tx, rx) = shutdown_channel();
        let handle = tokio::spawn(RoundScheduler::new(engine.clone(), rx).run());

        let mut events = engine.events().subscribe();
        let mut completed = 0;
        while completed < 2 {
            if let Ok(CrashEvent::RoundCompleted { .. }) = events.recv().await {
                completed += 1;
            }
        }
        tx.send(true).unwrap();

        let rounds = handle.await.unwrap();
        assert!(rounds >= 2);
        assert_eq!(engine.history(100).unwrap().len() as u64, rounds);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_cools_down_and_starts_fresh_round() {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();
        let faults = storage.clone();
        let engine = Arc::new(CrashEngine::new(fast_config(), storage));
        let cooldown = engine.config().error_cooldown();

        // The first round cannot be stored
        faults.fail_next_writes(1);
        let started = tokio::time::Instant::now();
        let (tx, rx) = shutdown_channel();
        let mut events = engine.events().subscribe();
        let handle = tokio::spawn(RoundScheduler::new(engine.clone(), rx).run());

        let mut created_at = None;
        loop {
            match events.recv().await {
                Ok(CrashEvent::RoundCreated { round_id, .. }) => {
                    assert_eq!(round_id, 1);
                    created_at.get_or_insert(started.elapsed());
                }
                Ok(CrashEvent::RoundCompleted { .. }) => break,
                _ => {}
            }
        }
        tx.send(true).unwrap();

        assert!(created_at.unwrap() >= cooldown);
        assert!(handle.await.unwrap() >= 1);
        assert_eq!(engine.history(10).unwrap()[0].round_id, 1);
    }
}
