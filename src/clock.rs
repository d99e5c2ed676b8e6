//! Multiplier growth for a flying round.
//!
//! Growth is deterministic constant acceleration:
//! `value += (base_speed + acceleration * elapsed_secs) * tick_secs`.

use crate::config::GameConfig;
use std::time::Duration;
use tokio::time::Instant;

/// One growth step
pub fn growth_step(value: f64, elapsed_secs: f64, tick_secs: f64, base_speed: f64, acceleration: f64) -> f64 {
    value + (base_speed + acceleration * elapsed_secs) * tick_secs
}

/// Live multiplier for one round. Owned by the tick loop, which is the
/// only writer.
#[derive(Debug)]
pub struct MultiplierClock {
    base_speed: f64,
    acceleration: f64,
    tick: Duration,
    value: f64,
    started_at: Instant,
    ticks: u64,
}

impl MultiplierClock {
    pub fn new(config: &GameConfig) -> Self {
        Self {
            base_speed: config.base_speed,
            acceleration: config.acceleration,
            tick: Duration::from_millis(config.tick_interval_ms),
            value: 1.0,
            started_at: Instant::now(),
            ticks: 0,
        }
    }

    /// Reset to 1.00x and restart the timer.
    pub fn start(&mut self) {
        self.value = 1.0;
        self.ticks = 0;
        self.started_at = Instant::now();
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick
    }

    /// Advance one tick using the wall time elapsed since [`start`](Self::start).
    pub fn advance(&mut self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        self.advance_at(elapsed)
    }

    /// Advance one tick as if `elapsed_secs` had passed since start.
    pub fn advance_at(&mut self, elapsed_secs: f64) -> f64 {
        self.value = growth_step(
            self.value,
            elapsed_secs,
            self.tick.as_secs_f64(),
            self.base_speed,
            self.acceleration,
        );
        self.ticks += 1;
        self.value
    }
}
