//! Match registry and authoritative tick loop

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use crate::util::time::{SIMULATION_TPS, SNAPSHOT_TPS};
use crate::ws::protocol::{MatchType, PlayerInfo, ServerMsg};

use super::lifecycle::{LifecycleSettings, Match, MatchError, MatchStage, StageListener};
use super::paddle::Side;
use super::rules::Rules;
use super::snapshot::SnapshotBuilder;
use super::summary::MatchSummary;
use super::{MatchInput, PlayerInput};

impl StageListener for broadcast::Sender<ServerMsg> {
    fn stage_changed(&self, match_id: Uuid, stage: MatchStage) {
        // No receivers is fine: nobody has joined yet
        let _ = self.send(ServerMsg::StageChanged { match_id, stage });
    }
}

impl StageListener for watch::Sender<MatchStage> {
    fn stage_changed(&self, _match_id: Uuid, stage: MatchStage) {
        self.send_replace(stage);
    }
}

/// Everything needed to start a match
#[derive(Debug, Clone)]
pub struct MatchSetup {
    pub id: Uuid,
    pub match_type: MatchType,
    pub left: PlayerInfo,
    pub right: PlayerInfo,
    pub rules: Arc<Rules>,
    pub settings: LifecycleSettings,
    pub seed: u64,
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub match_type: MatchType,
    pub left: PlayerInfo,
    pub right: PlayerInfo,
    pub input_tx: mpsc::Sender<PlayerInput>,
    pub snapshot_tx: broadcast::Sender<ServerMsg>,
    stage_rx: watch::Receiver<MatchStage>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl MatchHandle {
    /// Latest stage published by the match loop
    pub fn stage(&self) -> MatchStage {
        *self.stage_rx.borrow()
    }

    /// Stage updates, for callers that want to wait on a transition
    #[cfg(test)]
    pub fn watch_stage(&self) -> watch::Receiver<MatchStage> {
        self.stage_rx.clone()
    }

    pub fn side_of(&self, user_id: Uuid) -> Option<Side> {
        if self.left.user_id == user_id {
            Some(Side::Left)
        } else if self.right.user_id == user_id {
            Some(Side::Right)
        } else {
            None
        }
    }

    /// Stop the match loop. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    #[cfg(test)]
    pub fn is_cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches.len() * 2
    }

    /// Ask every running match to stop (shutdown)
    pub fn cancel_all(&self) {
        for entry in self.matches.iter() {
            entry.value().cancel();
        }
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The authoritative game match
pub struct GameMatch {
    state: Match,
    tick: u64,
    input_rx: mpsc::Receiver<PlayerInput>,
    snapshot_tx: broadcast::Sender<ServerMsg>,
    snapshot_builder: SnapshotBuilder,
    cancel_rx: watch::Receiver<bool>,
    last_countdown: Option<u32>,
}

impl GameMatch {
    /// Create a new match in `AWAITING_PLAYERS`
    pub fn new(setup: MatchSetup) -> (Self, MatchHandle) {
        let (input_tx, input_rx) = mpsc::channel(256);
        let (snapshot_tx, _) = broadcast::channel(64);
        let (stage_tx, stage_rx) = watch::channel(MatchStage::AwaitingPlayers);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut state = Match::new(
            setup.id,
            setup.match_type,
            setup.left.clone(),
            setup.right.clone(),
            setup.rules,
            setup.settings,
            setup.seed,
            Instant::now(),
        );
        state.subscribe(Box::new(stage_tx));
        state.subscribe(Box::new(snapshot_tx.clone()));

        let handle = MatchHandle {
            id: setup.id,
            match_type: setup.match_type,
            left: setup.left,
            right: setup.right,
            input_tx,
            snapshot_tx: snapshot_tx.clone(),
            stage_rx,
            cancel_tx: Arc::new(cancel_tx),
        };

        let snapshot_interval = SIMULATION_TPS / SNAPSHOT_TPS;
        let game_match = Self {
            state,
            tick: 0,
            input_rx,
            snapshot_tx,
            snapshot_builder: SnapshotBuilder::new(snapshot_interval),
            cancel_rx,
            last_countdown: None,
        };

        (game_match, handle)
    }

    /// Run the authoritative tick loop until the match is finished or canceled
    pub async fn run(mut self) -> MatchSummary {
        info!(match_id = %self.state.id, match_type = ?self.state.match_type, "Match loop started");

        let tick_duration = Duration::from_micros(1_000_000 / SIMULATION_TPS as u64);
        let mut tick_interval = interval(tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cancel_open = true;

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {}
                changed = self.cancel_rx.changed(), if cancel_open => {
                    match changed {
                        Ok(()) if *self.cancel_rx.borrow() => {
                            info!(match_id = %self.state.id, "Match cancel requested");
                            self.state.abort();
                            break;
                        }
                        Ok(()) => continue,
                        Err(_) => {
                            cancel_open = false;
                            continue;
                        }
                    }
                }
            }

            let now = Instant::now();

            // Intents queued since the last tick
            self.process_inputs(now);

            let events = self.state.tick(now);
            self.tick += 1;
            self.snapshot_builder.record(events);
            self.announce_countdown(now);

            if self.state.stage().is_terminal() {
                break;
            }

            if self.snapshot_builder.should_send() {
                let snapshot = self.snapshot_builder.build(self.tick, &self.state);
                let _ = self.snapshot_tx.send(snapshot);
            }
        }

        let summary = self.state.conclude();

        // Final state and result
        let snapshot = self.snapshot_builder.build(self.tick, &self.state);
        let _ = self.snapshot_tx.send(snapshot);
        let _ = self.snapshot_tx.send(ServerMsg::MatchEnd {
            summary: summary.clone(),
        });

        info!(
            match_id = %summary.match_id,
            outcome = ?summary.outcome,
            left_score = summary.left_score,
            right_score = summary.right_score,
            "Match ended"
        );

        summary
    }

    /// Apply all pending player inputs
    fn process_inputs(&mut self, now: Instant) {
        while let Ok(input) = self.input_rx.try_recv() {
            let result = match self.state.side_of(input.user_id) {
                Some(side) => self.apply_input(side, &input.input, now),
                None => Err(MatchError::NotAParticipant),
            };

            if let Err(e) = result {
                warn!(
                    match_id = %self.state.id,
                    user_id = %input.user_id,
                    error = %e,
                    "Rejected player input"
                );
                if let Some(reply_tx) = input.reply_tx {
                    let _ = reply_tx.try_send(ServerMsg::error(e.code(), &e));
                }
            }
        }
    }

    fn apply_input(&mut self, side: Side, input: &MatchInput, now: Instant) -> Result<(), MatchError> {
        match *input {
            MatchInput::Join => self.state.connect(side, now),
            MatchInput::Leave => self.state.disconnect(side, now),
            MatchInput::Ready => self.state.ready(side, now),
            MatchInput::PaddleMove { side: claimed, y } => {
                if claimed != side {
                    return Err(MatchError::InvalidPaddleMove(
                        "paddle belongs to the other player".to_string(),
                    ));
                }
                self.state.move_paddle(side, y).map(|_| ())
            }
            MatchInput::Forfeit => self.state.forfeit(side),
        }
    }

    /// Send a countdown message each time the whole-second value changes
    fn announce_countdown(&mut self, now: Instant) {
        let remaining = self
            .state
            .countdown_remaining(now)
            .map(|d| d.as_secs_f32().ceil() as u32);

        if remaining == self.last_countdown {
            return;
        }
        self.last_countdown = remaining;

        if let Some(seconds_remaining) = remaining.filter(|s| *s > 0) {
            let _ = self.snapshot_tx.send(ServerMsg::MatchCountdown {
                match_id: self.state.id,
                seconds_remaining,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::summary::{CancelReason, MatchOutcome};
    use tokio::time::timeout;

    fn setup(countdown: Duration) -> MatchSetup {
        MatchSetup {
            id: Uuid::new_v4(),
            match_type: MatchType::Classic,
            left: PlayerInfo::new(Uuid::new_v4(), "left"),
            right: PlayerInfo::new(Uuid::new_v4(), "right"),
            rules: Arc::new(Rules::for_type(MatchType::Classic)),
            settings: LifecycleSettings {
                reconnect_grace: Duration::from_secs(30),
                countdown,
            },
            seed: 5,
        }
    }

    async fn send(handle: &MatchHandle, user_id: Uuid, input: MatchInput) {
        handle
            .input_tx
            .send(PlayerInput {
                user_id,
                input,
                reply_tx: None,
            })
            .await
            .unwrap();
    }

    async fn wait_for_stage(handle: &MatchHandle, stage: MatchStage) {
        let mut rx = handle.watch_stage();
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == stage))
            .await
            .expect("stage not reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_stops_loop_and_is_idempotent() {
        let (game_match, handle) = GameMatch::new(setup(Duration::ZERO));
        let task = tokio::spawn(game_match.run());

        handle.cancel();
        handle.cancel();

        let summary = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(
            summary.outcome,
            MatchOutcome::Canceled {
                reason: CancelReason::Aborted
            }
        );
        assert_eq!(handle.stage(), MatchStage::Canceled);
        assert!(handle.is_cancel_requested());
        handle.cancel();
    }

    #[tokio::test]
    async fn inputs_drive_match_to_ongoing_then_forfeit() {
        let (game_match, handle) = GameMatch::new(setup(Duration::ZERO));
        let left = handle.left.user_id;
        let right = handle.right.user_id;
        let task = tokio::spawn(game_match.run());

        send(&handle, left, MatchInput::Join).await;
        send(&handle, right, MatchInput::Join).await;
        wait_for_stage(&handle, MatchStage::Preparation).await;

        send(&handle, left, MatchInput::Ready).await;
        send(&handle, right, MatchInput::Ready).await;
        wait_for_stage(&handle, MatchStage::Ongoing).await;

        send(&handle, right, MatchInput::Forfeit).await;
        let summary = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert_eq!(
            summary.outcome,
            MatchOutcome::Canceled {
                reason: CancelReason::Forfeit(Side::Right)
            }
        );
        assert!(summary.starts_at.is_some());
        assert!(summary.ends_at.is_some());
    }

    #[tokio::test]
    async fn stage_changes_and_snapshots_are_broadcast() {
        let (game_match, handle) = GameMatch::new(setup(Duration::ZERO));
        let mut rx = handle.snapshot_tx.subscribe();
        let left = handle.left.user_id;
        let right = handle.right.user_id;
        let task = tokio::spawn(game_match.run());

        send(&handle, left, MatchInput::Join).await;
        send(&handle, right, MatchInput::Join).await;

        let mut saw_stage = false;
        let mut saw_snapshot = false;
        while !(saw_stage && saw_snapshot) {
            let msg = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            match msg {
                ServerMsg::StageChanged { stage, .. } => {
                    assert_eq!(stage, MatchStage::Preparation);
                    saw_stage = true;
                }
                ServerMsg::Snapshot(snapshot) => {
                    assert_eq!(snapshot.match_id, handle.id);
                    saw_snapshot = true;
                }
                _ => {}
            }
        }

        handle.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn foreign_player_input_is_rejected_with_reply() {
        let (game_match, handle) = GameMatch::new(setup(Duration::ZERO));
        let task = tokio::spawn(game_match.run());
        let (reply_tx, mut reply_rx) = mpsc::channel(4);

        handle
            .input_tx
            .send(PlayerInput {
                user_id: Uuid::new_v4(),
                input: MatchInput::Ready,
                reply_tx: Some(reply_tx),
            })
            .await
            .unwrap();

        let reply = timeout(Duration::from_secs(5), reply_rx.recv()).await.unwrap().unwrap();
        match reply {
            ServerMsg::Error { code, .. } => assert_eq!(code, "not_a_participant"),
            other => panic!("unexpected reply {other:?}"),
        }

        handle.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn moving_opponents_paddle_is_rejected() {
        let (game_match, handle) = GameMatch::new(setup(Duration::ZERO));
        let left = handle.left.user_id;
        let task = tokio::spawn(game_match.run());
        let (reply_tx, mut reply_rx) = mpsc::channel(4);

        handle
            .input_tx
            .send(PlayerInput {
                user_id: left,
                input: MatchInput::PaddleMove {
                    side: Side::Right,
                    y: 100.0,
                },
                reply_tx: Some(reply_tx),
            })
            .await
            .unwrap();

        let reply = timeout(Duration::from_secs(5), reply_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(reply, ServerMsg::Error { ref code, .. } if code == "invalid_paddle_move"));

        handle.cancel();
        task.await.unwrap();
    }

    #[test]
    fn registry_tracks_and_cancels_matches() {
        let registry = MatchRegistry::new();
        let (_game_match, handle) = GameMatch::new(setup(Duration::ZERO));
        let id = handle.id;
        registry.insert(handle);

        assert_eq!(registry.active_matches(), 1);
        assert_eq!(registry.total_players(), 2);

        registry.cancel_all();
        assert!(registry.get(&id).unwrap().is_cancel_requested());

        assert!(registry.remove(&id).is_some());
        assert_eq!(registry.active_matches(), 0);
    }
}
