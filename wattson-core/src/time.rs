//! The shared wall/simulated time model (spec §3.2, `GET_TIME`/`SET_TIME`).
//!
//! A co-simulation runs on its own clock, which may run faster, slower, or
//! in lock-step with the wall clock. [`CoTime`] captures one (wall, sim)
//! reference pair plus a speed factor and projects "now" from it on demand,
//! the same way the original reference-pair-plus-speed model did — rebasing
//! on every external write rather than accumulating drift.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tai_time::MonotonicTime;

fn wall_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// The co-simulation clock: a wall/sim reference pair and a speed factor.
///
/// `speed` of `1.0` means the simulation advances in lock-step with the wall
/// clock; `0.0` freezes simulated time (useful while stepping a simulator
/// under external control); values above `1.0` let the simulation run ahead
/// of real time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoTime {
    reference_wall: f64,
    reference_sim: f64,
    speed: f64,
}

impl Default for CoTime {
    fn default() -> Self {
        Self::new()
    }
}

impl CoTime {
    /// A clock starting at simulated time zero, pinned to the current wall
    /// clock, running at real-time speed.
    pub fn new() -> Self {
        Self {
            reference_wall: wall_now_secs(),
            reference_sim: 0.0,
            speed: 1.0,
        }
    }

    /// The current simulated time in seconds, projected from the last
    /// reference point and the configured speed.
    pub fn now(&self) -> f64 {
        if self.speed == 0.0 {
            return self.reference_sim;
        }
        let elapsed_wall = wall_now_secs() - self.reference_wall;
        self.reference_sim + elapsed_wall * self.speed
    }

    /// The current simulated time in milliseconds, the unit carried on the
    /// wire (spec §6.2).
    pub fn now_ms(&self) -> i64 {
        (self.now() * 1000.0).round() as i64
    }

    /// The clock's speed factor.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Changes the speed factor, rebasing the reference pair at the current
    /// instant so the change takes effect without a discontinuity in `now()`.
    pub fn set_speed(&mut self, speed: f64) {
        let now = self.now();
        self.reference_wall = wall_now_secs();
        self.reference_sim = now;
        self.speed = speed;
    }

    /// Pins simulated time to `sim_seconds` at the current wall-clock instant
    /// (`SET_TIME`). Used both for initial synchronization and for manual
    /// corrections.
    pub fn set_sim_reference(&mut self, sim_seconds: f64) {
        self.reference_wall = wall_now_secs();
        self.reference_sim = sim_seconds;
    }

    /// Rebases the wall-clock half of the reference pair without touching
    /// the simulated time, e.g. after a long pause where wall time must not
    /// count towards elapsed simulated time.
    pub fn set_wall_clock_reference(&mut self) {
        let now = self.now();
        self.reference_wall = wall_now_secs();
        self.reference_sim = now;
    }

    /// A `(wall, sim)` snapshot of the reference pair, exposed for testing
    /// and for import/export across process restarts.
    pub fn reference(&self) -> (f64, f64) {
        (self.reference_wall, self.reference_sim)
    }
}

/// A monotonic instant used to order events that must never go backwards
/// regardless of `CoTime` corrections — e.g. notification sequencing and
/// scheduled-event cancellation keys.
pub fn monotonic_now() -> MonotonicTime {
    let secs = wall_now_secs();
    MonotonicTime::new(secs.floor() as i64, ((secs.fract()) * 1_000_000_000.0) as u32)
        .unwrap_or(MonotonicTime::EPOCH)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct WireCoTime {
    reference_wall: f64,
    reference_sim: f64,
    speed: f64,
}

impl Serialize for CoTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        WireCoTime {
            reference_wall: self.reference_wall,
            reference_sim: self.reference_sim,
            speed: self.speed,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CoTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = WireCoTime::deserialize(deserializer)?;
        Ok(CoTime {
            reference_wall: wire.reference_wall,
            reference_sim: wire.reference_sim,
            speed: wire.speed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_clock_does_not_advance() {
        let mut clock = CoTime::new();
        clock.set_speed(0.0);
        let a = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.now();
        assert_eq!(a, b);
    }

    #[test]
    fn set_sim_reference_rebases_now() {
        let mut clock = CoTime::new();
        clock.set_sim_reference(1000.0);
        assert!((clock.now() - 1000.0).abs() < 0.05);
    }

    #[test]
    fn speed_change_preserves_continuity_at_the_instant_of_change() {
        let mut clock = CoTime::new();
        clock.set_sim_reference(0.0);
        std::thread::sleep(std::time::Duration::from_millis(10));
        let before = clock.now();
        clock.set_speed(2.0);
        let after = clock.now();
        assert!((after - before).abs() < 0.05);
    }
}
