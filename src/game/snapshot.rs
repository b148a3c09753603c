//! Snapshot building

use crate::ws::protocol::{BallSnapshot, GameEvent, ServerMsg, StateSnapshot};

use super::lifecycle::Match;
use super::paddle::Side;

/// Builds snapshots for network transmission
pub struct SnapshotBuilder {
    /// Tick counter since last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
    /// Events gathered on ticks that did not send a snapshot
    pending_events: Vec<GameEvent>,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
            pending_events: Vec::new(),
        }
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (used for important events)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    /// Hold events until the next snapshot goes out
    pub fn record(&mut self, events: Vec<GameEvent>) {
        if events.iter().any(|e| matches!(e, GameEvent::Goal { .. })) {
            self.force_next();
        }
        self.pending_events.extend(events);
    }

    /// Build a snapshot message, draining pending events
    pub fn build(&mut self, tick: u64, state: &Match) -> ServerMsg {
        let sim = state.simulation();
        let ball = sim.ball();

        ServerMsg::Snapshot(StateSnapshot {
            match_id: state.id,
            tick,
            stage: state.stage(),
            ball: BallSnapshot {
                x: ball.position.x,
                y: ball.position.y,
                vel_x: ball.velocity.x,
                vel_y: ball.velocity.y,
                speed: ball.speed,
            },
            left_paddle_y: sim.paddle(Side::Left).y,
            right_paddle_y: sim.paddle(Side::Right).y,
            left_score: state.score(Side::Left),
            right_score: state.score(Side::Right),
            events: std::mem::take(&mut self.pending_events),
        })
    }
}
