//! Time utilities for match simulation

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Tick rate configuration
pub const SIMULATION_TPS: u32 = 60; // 60 ticks per second
pub const SNAPSHOT_TPS: u32 = 30; // 30 snapshots per second

/// Largest wall-clock gap (seconds) a single tick is allowed to simulate
pub const MAX_FRAME_DELTA: f32 = 0.25;

/// Largest physics sub-step (seconds)
pub const MAX_SUBSTEP: f32 = 1.0 / 120.0;

/// Wall-clock delta tracker for one match's simulation.
///
/// The first call after construction or [`TickClock::rebase`] establishes a
/// baseline and reports zero elapsed time.
#[derive(Debug, Clone, Default)]
pub struct TickClock {
    last: Option<Instant>,
}

impl TickClock {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Seconds since the previous call, clamped to [`MAX_FRAME_DELTA`]
    pub fn delta(&mut self, now: Instant) -> f32 {
        let elapsed = match self.last {
            Some(last) => now.saturating_duration_since(last).as_secs_f32(),
            None => 0.0,
        };
        self.last = Some(now);
        elapsed.min(MAX_FRAME_DELTA)
    }

    /// Restart measurement from `now`
    pub fn rebase(&mut self, now: Instant) {
        self.last = Some(now);
    }
}
