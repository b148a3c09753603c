//! Match lifecycle: stage, presence, scores and stage-change notification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::ws::protocol::{GameEvent, MatchType, PlayerInfo};

use super::paddle::Side;
use super::physics::Simulation;
use super::rules::Rules;
use super::summary::{CancelReason, MatchOutcome, MatchSummary};

/// Lifecycle stage of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStage {
    AwaitingPlayers,
    Preparation,
    Ongoing,
    Finished,
    Canceled,
}

impl MatchStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchStage::Finished | MatchStage::Canceled)
    }

    /// Forward by exactly one stage, or to `Canceled` from any live stage
    pub fn can_transition_to(self, next: MatchStage) -> bool {
        use MatchStage::*;
        match (self, next) {
            (Finished | Canceled, _) => false,
            (_, Canceled) => true,
            (AwaitingPlayers, Preparation) | (Preparation, Ongoing) | (Ongoing, Finished) => true,
            _ => false,
        }
    }
}

/// Receives every stage transition, synchronously and in order
pub trait StageListener: Send {
    fn stage_changed(&self, match_id: Uuid, stage: MatchStage);
}

/// Match-level errors reported back to the sender of an event
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatchError {
    #[error("Invalid paddle move: {0}")]
    InvalidPaddleMove(String),

    #[error("Match is no longer active")]
    StaleMatch,

    #[error("Player is not part of this match")]
    NotAParticipant,
}

impl MatchError {
    pub fn code(&self) -> &'static str {
        match self {
            MatchError::InvalidPaddleMove(_) => "invalid_paddle_move",
            MatchError::StaleMatch => "stale_match",
            MatchError::NotAParticipant => "not_a_participant",
        }
    }
}

/// Timing knobs for presence and start-up
#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    /// How long a side may be absent before the match is canceled
    pub reconnect_grace: Duration,
    /// Delay between both sides being ready and play starting
    pub countdown: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            reconnect_grace: Duration::from_secs(10),
            countdown: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Presence {
    connected: bool,
    ready: bool,
    absent_since: Option<Instant>,
}

/// One game between two players. The only place `stage` is changed.
pub struct Match {
    pub id: Uuid,
    pub match_type: MatchType,
    pub left_player: PlayerInfo,
    pub right_player: PlayerInfo,
    left_score: u32,
    right_score: u32,
    left: Presence,
    right: Presence,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    stage: MatchStage,
    outcome: Option<MatchOutcome>,
    countdown_until: Option<Instant>,
    simulation: Simulation,
    settings: LifecycleSettings,
    listeners: Vec<Box<dyn StageListener>>,
}

impl Match {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        match_type: MatchType,
        left_player: PlayerInfo,
        right_player: PlayerInfo,
        rules: Arc<Rules>,
        settings: LifecycleSettings,
        seed: u64,
        now: Instant,
    ) -> Self {
        // Nobody has joined yet, so the grace period runs from creation
        let absent = Presence {
            absent_since: Some(now),
            ..Presence::default()
        };

        Self {
            id,
            match_type,
            left_player,
            right_player,
            left_score: 0,
            right_score: 0,
            left: absent,
            right: absent,
            starts_at: None,
            ends_at: None,
            stage: MatchStage::AwaitingPlayers,
            outcome: None,
            countdown_until: None,
            simulation: Simulation::new(rules, seed, now),
            settings,
            listeners: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, listener: Box<dyn StageListener>) {
        self.listeners.push(listener);
    }

    pub fn stage(&self) -> MatchStage {
        self.stage
    }

    pub fn score(&self, side: Side) -> u32 {
        match side {
            Side::Left => self.left_score,
            Side::Right => self.right_score,
        }
    }

    pub fn starts_at(&self) -> Option<DateTime<Utc>> {
        self.starts_at
    }

    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        self.ends_at
    }

    pub fn outcome(&self) -> Option<MatchOutcome> {
        self.outcome
    }

    pub fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    #[cfg(test)]
    pub(crate) fn simulation_mut(&mut self) -> &mut Simulation {
        &mut self.simulation
    }

    pub fn side_of(&self, user_id: Uuid) -> Option<Side> {
        if self.left_player.user_id == user_id {
            Some(Side::Left)
        } else if self.right_player.user_id == user_id {
            Some(Side::Right)
        } else {
            None
        }
    }

    /// Time left before play starts, while a countdown is running
    pub fn countdown_remaining(&self, now: Instant) -> Option<Duration> {
        match (self.stage, self.countdown_until) {
            (MatchStage::Preparation, Some(until)) => Some(until.saturating_duration_since(now)),
            _ => None,
        }
    }

    fn presence(&self, side: Side) -> &Presence {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn presence_mut(&mut self, side: Side) -> &mut Presence {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    fn ensure_live(&self) -> Result<(), MatchError> {
        if self.stage.is_terminal() {
            Err(MatchError::StaleMatch)
        } else {
            Ok(())
        }
    }

    /// A player's connection to this match is up
    pub fn connect(&mut self, side: Side, now: Instant) -> Result<(), MatchError> {
        self.ensure_live()?;

        let presence = self.presence_mut(side);
        presence.connected = true;
        presence.absent_since = None;

        info!(match_id = %self.id, side = ?side, "Player connected to match");

        if self.stage == MatchStage::AwaitingPlayers && self.left.connected && self.right.connected {
            self.transition(MatchStage::Preparation);
            self.maybe_start_countdown(now);
        }

        Ok(())
    }

    /// A player's connection dropped. Starts the grace period.
    pub fn disconnect(&mut self, side: Side, now: Instant) -> Result<(), MatchError> {
        self.ensure_live()?;

        let presence = self.presence_mut(side);
        presence.connected = false;
        presence.ready = false;
        presence.absent_since.get_or_insert(now);

        // Start-up has to be confirmed again once the player is back
        if self.stage == MatchStage::Preparation {
            self.countdown_until = None;
        }

        info!(match_id = %self.id, side = ?side, "Player disconnected from match");
        Ok(())
    }

    /// Ready confirmation for the pre-game countdown
    pub fn ready(&mut self, side: Side, now: Instant) -> Result<(), MatchError> {
        self.ensure_live()?;

        if self.stage == MatchStage::Ongoing {
            return Ok(());
        }

        self.presence_mut(side).ready = true;
        self.maybe_start_countdown(now);
        Ok(())
    }

    fn maybe_start_countdown(&mut self, now: Instant) {
        if self.stage == MatchStage::Preparation
            && self.countdown_until.is_none()
            && self.left.ready
            && self.right.ready
        {
            self.countdown_until = Some(now + self.settings.countdown);
            info!(
                match_id = %self.id,
                countdown_ms = self.settings.countdown.as_millis() as u64,
                "Both players ready, countdown started"
            );
        }
    }

    /// Player paddle input, applied by the match loop before the physics step
    pub fn move_paddle(&mut self, side: Side, y: f32) -> Result<f32, MatchError> {
        self.ensure_live()?;
        self.simulation.move_paddle(side, y)
    }

    pub fn forfeit(&mut self, side: Side) -> Result<(), MatchError> {
        self.ensure_live()?;
        info!(match_id = %self.id, side = ?side, "Player forfeited");
        self.cancel(CancelReason::Forfeit(side));
        Ok(())
    }

    /// Cancel from outside (server shutdown, registry cleanup). No-op once terminal.
    pub fn abort(&mut self) {
        if !self.stage.is_terminal() {
            self.cancel(CancelReason::Aborted);
        }
    }

    /// Advance presence timers, the countdown and, while ongoing, the physics
    pub fn tick(&mut self, now: Instant) -> Vec<GameEvent> {
        if self.stage.is_terminal() {
            return Vec::new();
        }

        for side in [Side::Left, Side::Right] {
            if let Some(since) = self.presence(side).absent_since {
                if now.saturating_duration_since(since) >= self.settings.reconnect_grace {
                    warn!(match_id = %self.id, side = ?side, "Reconnect grace period expired");
                    self.cancel(CancelReason::Disconnected(side));
                    return Vec::new();
                }
            }
        }

        match self.stage {
            MatchStage::Preparation => {
                if matches!(self.countdown_until, Some(until) if now >= until) {
                    self.start(now);
                }
                Vec::new()
            }
            MatchStage::Ongoing => self.play(now),
            _ => Vec::new(),
        }
    }

    fn start(&mut self, now: Instant) {
        self.countdown_until = None;
        self.starts_at = Some(Utc::now());
        self.simulation.reset_positions(now);
        self.transition(MatchStage::Ongoing);
    }

    fn play(&mut self, now: Instant) -> Vec<GameEvent> {
        // Paused while someone is away; the clock keeps re-baselining so the
        // ball does not jump on resume
        if !(self.left.connected && self.right.connected) {
            self.simulation.rebase_clock(now);
            return Vec::new();
        }

        let events = self.simulation.tick(now);

        let scorer = events.iter().find_map(|e| match e {
            GameEvent::Goal { scorer } => Some(*scorer),
            _ => None,
        });

        if let Some(scorer) = scorer {
            let score = match scorer {
                Side::Left => &mut self.left_score,
                Side::Right => &mut self.right_score,
            };
            *score += 1;
            let score = *score;

            info!(
                match_id = %self.id,
                scorer = ?scorer,
                left_score = self.left_score,
                right_score = self.right_score,
                "Goal"
            );

            if score >= self.simulation.rules().winning_score {
                self.finish(scorer);
            } else {
                self.simulation.reset_positions(now);
            }
        }

        events
    }

    fn finish(&mut self, winner: Side) {
        self.ends_at = Some(Utc::now());
        self.outcome = Some(MatchOutcome::Winner { side: winner });
        self.transition(MatchStage::Finished);
    }

    fn cancel(&mut self, reason: CancelReason) {
        self.ends_at = Some(Utc::now());
        self.outcome = Some(MatchOutcome::Canceled { reason });
        self.transition(MatchStage::Canceled);
    }

    fn transition(&mut self, next: MatchStage) {
        if !self.stage.can_transition_to(next) {
            warn!(
                match_id = %self.id,
                from = ?self.stage,
                to = ?next,
                "Rejected stage transition"
            );
            return;
        }

        info!(match_id = %self.id, from = ?self.stage, to = ?next, "Match stage changed");
        self.stage = next;

        for listener in &self.listeners {
            listener.stage_changed(self.id, next);
        }
    }

    /// Final record, available once the match is terminal
    pub fn summary(&self) -> Option<MatchSummary> {
        self.outcome.map(|outcome| self.build_summary(outcome))
    }

    /// Terminal summary, canceling first if the match is still live
    pub fn conclude(&mut self) -> MatchSummary {
        self.abort();
        let outcome = self.outcome.unwrap_or(MatchOutcome::Canceled {
            reason: CancelReason::Aborted,
        });
        self.build_summary(outcome)
    }

    fn build_summary(&self, outcome: MatchOutcome) -> MatchSummary {
        MatchSummary {
            match_id: self.id,
            match_type: self.match_type,
            left_player: self.left_player.clone(),
            right_player: self.right_player.clone(),
            left_score: self.left_score,
            right_score: self.right_score,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            outcome,
        }
    }
}
