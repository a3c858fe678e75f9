//! The simulation side of a computer: identity, label storage, power
//! requests and the in-game clock. The bridge only reads these.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::info;

/// Ticks in one in-game day.
pub const TICKS_PER_DAY: u64 = 24_000;

/// Offset so that world tick 0 is 06:00 on day 1.
const DAWN_OFFSET: u64 = 6_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerRequest {
    Shutdown,
    Reboot,
}

/// Host environment a computer runs in.
pub trait ComputerEnvironment: Send + Sync {
    fn computer_id(&self) -> u32;

    /// In-game hour of day, in `[0, 24)`.
    fn time_of_day(&self) -> f64;

    /// In-game day number.
    fn day(&self) -> i32;

    fn label(&self) -> Option<String>;

    fn set_label(&self, label: Option<String>);

    /// Asks the simulation to power the computer off or restart it after
    /// the current tick.
    fn request_power(&self, request: PowerRequest);
}

/// Environment driven by a world tick counter, as a game world would.
pub struct SimulatedEnvironment {
    id: u32,
    world_ticks: AtomicU64,
    label: Mutex<Option<String>>,
    power: Mutex<Option<PowerRequest>>,
}

impl SimulatedEnvironment {
    pub fn new(id: u32, label: Option<String>) -> Self {
        Self {
            id,
            world_ticks: AtomicU64::new(0),
            label: Mutex::new(label),
            power: Mutex::new(None),
        }
    }

    pub fn set_world_ticks(&self, ticks: u64) {
        self.world_ticks.store(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: u64) {
        self.world_ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn world_ticks(&self) -> u64 {
        self.world_ticks.load(Ordering::SeqCst)
    }

    /// Takes the pending power request, if any.
    pub fn take_power_request(&self) -> Option<PowerRequest> {
        self.power.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl ComputerEnvironment for SimulatedEnvironment {
    fn computer_id(&self) -> u32 {
        self.id
    }

    fn time_of_day(&self) -> f64 {
        ((self.world_ticks() + DAWN_OFFSET) % TICKS_PER_DAY) as f64 / 1000.0
    }

    fn day(&self) -> i32 {
        let day = (self.world_ticks() + DAWN_OFFSET) / TICKS_PER_DAY + 1;
        i32::try_from(day).unwrap_or(i32::MAX)
    }

    fn label(&self) -> Option<String> {
        self.label.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_label(&self, label: Option<String>) {
        info!("Computer {} label set to {label:?}", self.id);
        *self.label.lock().unwrap_or_else(PoisonError::into_inner) = label;
    }

    fn request_power(&self, request: PowerRequest) {
        info!("Computer {} requested {request:?}", self.id);
        *self.power.lock().unwrap_or_else(PoisonError::into_inner) = Some(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_start_is_six_am_day_one() {
        let env = SimulatedEnvironment::new(0, None);
        assert_eq!(env.time_of_day(), 6.0);
        assert_eq!(env.day(), 1);
    }

    #[test]
    fn test_day_rolls_over_at_midnight() {
        let env = SimulatedEnvironment::new(0, None);
        env.set_world_ticks(18_000);
        assert_eq!(env.time_of_day(), 0.0);
        assert_eq!(env.day(), 2);
        env.advance(500);
        assert_eq!(env.time_of_day(), 0.5);
    }

    #[test]
    fn test_power_request_is_taken_once() {
        let env = SimulatedEnvironment::new(3, Some("base".into()));
        assert_eq!(env.computer_id(), 3);
        env.request_power(PowerRequest::Reboot);
        assert_eq!(env.take_power_request(), Some(PowerRequest::Reboot));
        assert_eq!(env.take_power_request(), None);
    }
}
