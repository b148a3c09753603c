//! Matchmaking service - manages queues, player connections and match creation

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex as SlotMutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::game::{
    GameMatch, LifecycleSettings, MatchInput, MatchRecorder, MatchRegistry,
    MatchSetup, PlayerInput, RuleBook,
};
use crate::ws::protocol::{MatchType, ServerMsg};

use super::identity::{IdentityError, IdentityProvider};
use super::queue::{MatchmakingQueue, QueueEntry};

#[derive(Debug, Error)]
pub enum MatchmakingError {
    #[error("Already waiting in a matchmaking queue")]
    AlreadyQueued,

    #[error("Already playing a match")]
    AlreadyInMatch,

    #[error("Not in a matchmaking queue")]
    NotQueued,

    #[error("Player identity lookup failed: {0}")]
    IdentityLookupFailed(#[from] IdentityError),

    #[error("Match could not be created: {0}")]
    MatchCreationFailed(String),

    #[error("No opponent found in time")]
    Timeout,

    #[error("Match is no longer active")]
    StaleMatch,

    #[error("Player is not part of this match")]
    NotAParticipant,
}

impl MatchmakingError {
    pub fn code(&self) -> &'static str {
        match self {
            MatchmakingError::AlreadyQueued => "already_queued",
            MatchmakingError::AlreadyInMatch => "already_in_match",
            MatchmakingError::NotQueued => "not_queued",
            MatchmakingError::IdentityLookupFailed(_) => "identity_lookup_failed",
            MatchmakingError::MatchCreationFailed(_) => "match_creation_failed",
            MatchmakingError::Timeout => "timeout",
            MatchmakingError::StaleMatch => "stale_match",
            MatchmakingError::NotAParticipant => "not_a_participant",
        }
    }

    pub fn to_server_msg(&self) -> ServerMsg {
        ServerMsg::error(self.code(), self)
    }
}

/// Result of a successful enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Waiting for an opponent
    Queued,
    /// Paired straight away
    Matched(Uuid),
}

#[derive(Debug, Clone, Copy)]
pub struct MatchmakingSettings {
    /// Longest a player may wait in a queue
    pub queue_timeout: Duration,
    pub lifecycle: LifecycleSettings,
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_secs(60),
            lifecycle: LifecycleSettings::default(),
        }
    }
}

/// Player connection handle for routing messages
#[derive(Clone)]
struct PlayerConnection {
    connection_id: Uuid,
    outbound: mpsc::Sender<ServerMsg>,
    /// Task copying the current match's broadcast into `outbound`
    forwarder: Arc<SlotMutex<Option<AbortHandle>>>,
}

impl PlayerConnection {
    fn replace_forwarder(&self, handle: Option<AbortHandle>) {
        if let Some(previous) = std::mem::replace(&mut *self.forwarder.lock(), handle) {
            previous.abort();
        }
    }
}

/// Matchmaking service
pub struct MatchmakingService {
    classic_queue: Mutex<MatchmakingQueue>,
    turbo_queue: Mutex<MatchmakingQueue>,
    /// Queued player -> queue they wait in
    queued: DashMap<Uuid, MatchType>,
    /// Connected players
    players: Arc<DashMap<Uuid, PlayerConnection>>,
    /// Map of player -> current match
    player_matches: Arc<DashMap<Uuid, Uuid>>,
    registry: Arc<MatchRegistry>,
    identity: Arc<dyn IdentityProvider>,
    recorder: Arc<dyn MatchRecorder>,
    rules: Arc<RuleBook>,
    settings: MatchmakingSettings,
    /// Running match tasks, including their cleanup
    match_tasks: SlotMutex<JoinSet<()>>,
}

impl MatchmakingService {
    pub fn new(
        registry: Arc<MatchRegistry>,
        identity: Arc<dyn IdentityProvider>,
        recorder: Arc<dyn MatchRecorder>,
        rules: Arc<RuleBook>,
        settings: MatchmakingSettings,
    ) -> Self {
        Self {
            classic_queue: Mutex::new(MatchmakingQueue::new()),
            turbo_queue: Mutex::new(MatchmakingQueue::new()),
            queued: DashMap::new(),
            players: Arc::new(DashMap::new()),
            player_matches: Arc::new(DashMap::new()),
            registry,
            identity,
            recorder,
            rules,
            settings,
            match_tasks: SlotMutex::new(JoinSet::new()),
        }
    }

    fn queue(&self, match_type: MatchType) -> &Mutex<MatchmakingQueue> {
        match match_type {
            MatchType::Classic => &self.classic_queue,
            MatchType::Turbo => &self.turbo_queue,
        }
    }

    /// Register a player connection (called when WebSocket connects).
    /// Returns the connection id and the channel of messages for that player.
    pub fn register_player(&self, user_id: Uuid) -> (Uuid, mpsc::Receiver<ServerMsg>) {
        let (outbound, outbound_rx) = mpsc::channel::<ServerMsg>(128);
        let connection = PlayerConnection {
            connection_id: Uuid::new_v4(),
            outbound,
            forwarder: Arc::new(SlotMutex::new(None)),
        };
        let connection_id = connection.connection_id;

        if let Some(previous) = self.players.insert(user_id, connection) {
            previous.replace_forwarder(None);
            info!(user_id = %user_id, "Player connection replaced");
        }

        info!(user_id = %user_id, connection_id = %connection_id, "Player registered");
        (connection_id, outbound_rx)
    }

    /// Unregister a player connection (called when WebSocket disconnects)
    pub async fn unregister_player(&self, user_id: Uuid, connection_id: Uuid) {
        let removed = self
            .players
            .remove_if(&user_id, |_, c| c.connection_id == connection_id);
        let Some((_, connection)) = removed else {
            // A newer connection took over
            return;
        };
        connection.replace_forwarder(None);

        // Not queued is the common case here
        let _ = self.remove_from_queue(user_id).await;

        let match_id = self.player_matches.get(&user_id).map(|r| *r);
        if let Some(handle) = match_id.and_then(|id| self.registry.get(&id)) {
            let input = PlayerInput {
                user_id,
                input: MatchInput::Leave,
                reply_tx: None,
            };
            if handle.input_tx.send(input).await.is_err() {
                warn!(user_id = %user_id, match_id = %handle.id, "Match already stopped");
            }
        }

        info!(user_id = %user_id, "Player unregistered from matchmaking");
    }

    /// Join a matchmaking queue, pairing immediately when an opponent waits
    pub async fn enqueue(
        &self,
        user_id: Uuid,
        match_type: MatchType,
    ) -> Result<EnqueueOutcome, MatchmakingError> {
        if let Some(match_id) = self.get_player_match(&user_id) {
            if self.registry.get(&match_id).is_some() {
                return Err(MatchmakingError::AlreadyInMatch);
            }
            // Match ended but its mapping outlived the cleanup
            self.player_matches.remove_if(&user_id, |_, m| *m == match_id);
        }
        if self.queued.contains_key(&user_id) {
            return Err(MatchmakingError::AlreadyQueued);
        }

        let player = self.identity.lookup(user_id).await?;

        match self.queued.entry(user_id) {
            Entry::Occupied(_) => return Err(MatchmakingError::AlreadyQueued),
            Entry::Vacant(slot) => {
                slot.insert(match_type);
            }
        }

        let pair = {
            let mut queue = self.queue(match_type).lock().await;
            queue.enqueue(QueueEntry::new(player));
            self.notify(user_id, ServerMsg::Enqueued { match_type });

            info!(
                user_id = %user_id,
                match_type = ?match_type,
                queue_size = queue.len(),
                "Player joined matchmaking queue"
            );

            let pair = queue.try_pair();
            if let Some((first, second)) = &pair {
                self.queued.remove(&first.user_id());
                self.queued.remove(&second.user_id());
            }
            pair
        };

        match pair {
            Some((first, second)) => self
                .create_match(user_id, match_type, first, second)
                .await
                .map(EnqueueOutcome::Matched),
            None => Ok(EnqueueOutcome::Queued),
        }
    }

    /// Leave matchmaking queue
    pub async fn dequeue(&self, user_id: Uuid) -> Result<(), MatchmakingError> {
        self.remove_from_queue(user_id).await?;
        self.notify(user_id, ServerMsg::Dequeued);
        info!(user_id = %user_id, "Player left matchmaking queue");
        Ok(())
    }

    async fn remove_from_queue(&self, user_id: Uuid) -> Result<(), MatchmakingError> {
        let match_type = self
            .queued
            .get(&user_id)
            .map(|r| *r)
            .ok_or(MatchmakingError::NotQueued)?;

        let mut queue = self.queue(match_type).lock().await;
        match queue.remove(user_id) {
            Some(_) => {
                self.queued.remove(&user_id);
                Ok(())
            }
            // Paired while we waited for the lock
            None => Err(MatchmakingError::NotQueued),
        }
    }

    /// Create a match for two paired entries; `requester` is the enqueueing player
    async fn create_match(
        &self,
        requester: Uuid,
        match_type: MatchType,
        first: QueueEntry,
        second: QueueEntry,
    ) -> Result<Uuid, MatchmakingError> {
        let lookups = futures::future::try_join(
            self.identity.lookup(first.user_id()),
            self.identity.lookup(second.user_id()),
        )
        .await;

        let (left, right) = match lookups {
            Ok(players) => players,
            Err(e) => {
                let err = MatchmakingError::MatchCreationFailed(e.to_string());
                error!(
                    first = %first.user_id(),
                    second = %second.user_id(),
                    error = %e,
                    "Failed to create match"
                );
                for entry in [&first, &second] {
                    if entry.user_id() != requester {
                        self.notify(entry.user_id(), err.to_server_msg());
                    }
                }
                return Err(err);
            }
        };

        let match_id = Uuid::new_v4();
        let (game_match, handle) = GameMatch::new(MatchSetup {
            id: match_id,
            match_type,
            left: left.clone(),
            right: right.clone(),
            rules: self.rules.get(match_type),
            settings: self.settings.lifecycle,
            seed: rand::random(),
        });

        self.registry.insert(handle);
        self.player_matches.insert(left.user_id, match_id);
        self.player_matches.insert(right.user_id, match_id);

        info!(
            match_id = %match_id,
            match_type = ?match_type,
            left = %left.user_id,
            right = %right.user_id,
            "Created new match"
        );

        // Spawn match task
        let registry = self.registry.clone();
        let player_matches = self.player_matches.clone();
        let recorder = self.recorder.clone();
        let player_ids = [left.user_id, right.user_id];

        self.match_tasks.lock().spawn(async move {
            let summary = game_match.run().await;

            // Recorded before the match leaves the registry
            if let Err(e) = recorder.record(&summary).await {
                error!(match_id = %match_id, error = %e, "Failed to record match");
            }

            registry.remove(&match_id);
            for pid in player_ids {
                player_matches.remove_if(&pid, |_, m| *m == match_id);
            }

            info!(match_id = %match_id, "Match removed from registry");
        });

        let found = ServerMsg::MatchFound {
            match_id,
            match_type,
            left: left.clone(),
            right: right.clone(),
        };
        self.notify(left.user_id, found.clone());
        self.notify(right.user_id, found);

        Ok(match_id)
    }

    /// Attach a player's connection to a match they belong to
    pub async fn join_match(&self, user_id: Uuid, match_id: Uuid) -> Result<(), MatchmakingError> {
        let handle = self
            .registry
            .get(&match_id)
            .ok_or(MatchmakingError::StaleMatch)?;
        if handle.side_of(user_id).is_none() {
            return Err(MatchmakingError::NotAParticipant);
        }

        let connection = self.players.get(&user_id).map(|c| c.value().clone());
        let reply_tx = connection.as_ref().map(|c| c.outbound.clone());

        if let Some(connection) = connection {
            let mut rx = handle.snapshot_tx.subscribe();
            let outbound = connection.outbound.clone();

            let task = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) => {
                            if outbound.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(user_id = %user_id, lagged = n, "Match receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            connection.replace_forwarder(Some(task.abort_handle()));
        }

        let input = PlayerInput {
            user_id,
            input: MatchInput::Join,
            reply_tx,
        };
        handle
            .input_tx
            .send(input)
            .await
            .map_err(|_| MatchmakingError::StaleMatch)?;

        info!(user_id = %user_id, match_id = %match_id, "Player joined match");
        Ok(())
    }

    /// Deliver a player intent to the match loop
    pub async fn route_input(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        input: MatchInput,
    ) -> Result<(), MatchmakingError> {
        let handle = self
            .registry
            .get(&match_id)
            .ok_or(MatchmakingError::StaleMatch)?;
        if handle.side_of(user_id).is_none() {
            return Err(MatchmakingError::NotAParticipant);
        }

        let reply_tx = self.players.get(&user_id).map(|c| c.outbound.clone());
        let input = PlayerInput {
            user_id,
            input,
            reply_tx,
        };

        handle
            .input_tx
            .send(input)
            .await
            .map_err(|_| MatchmakingError::StaleMatch)
    }

    /// Evict players that waited past the queue timeout. Returns how many.
    pub async fn evict_expired(&self) -> usize {
        let mut evicted = 0;

        for match_type in MatchType::ALL {
            let expired = {
                let mut queue = self.queue(match_type).lock().await;
                let expired = queue.evict_expired(self.settings.queue_timeout);
                for entry in &expired {
                    self.queued.remove(&entry.user_id());
                }
                expired
            };

            for entry in expired {
                info!(
                    user_id = %entry.user_id(),
                    match_type = ?match_type,
                    waited_ms = entry.wait_time().as_millis() as u64,
                    "Matchmaking timed out"
                );
                self.notify(entry.user_id(), MatchmakingError::Timeout.to_server_msg());
                evicted += 1;
            }
        }

        evicted
    }

    /// Run the matchmaking service (periodic queue eviction)
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(Duration::from_millis(500));

        loop {
            interval.tick().await;
            self.evict_expired().await;
            self.reap_finished_matches();
        }
    }

    fn reap_finished_matches(&self) {
        let mut tasks = self.match_tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "Match task failed");
            }
        }
    }

    /// Cancel every running match and wait up to `grace` for results to be recorded
    pub async fn shutdown(&self, grace: Duration) {
        info!(active_matches = self.registry.active_matches(), "Canceling active matches");
        self.registry.cancel_all();

        let mut tasks = std::mem::replace(&mut *self.match_tasks.lock(), JoinSet::new());
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Match task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = tasks.len(), "Matches still running after shutdown grace, aborting");
            tasks.abort_all();
        }
    }

    fn notify(&self, user_id: Uuid, msg: ServerMsg) {
        let outbound = self.players.get(&user_id).map(|c| c.outbound.clone());
        if let Some(outbound) = outbound {
            if outbound.try_send(msg).is_err() {
                warn!(user_id = %user_id, "Dropped message for slow or closed connection");
            }
        }
    }

    /// Get current queue size
    pub async fn queue_size(&self, match_type: MatchType) -> usize {
        self.queue(match_type).lock().await.len()
    }

    /// Check if player is in a queue
    #[cfg(test)]
    pub fn is_queued(&self, user_id: &Uuid) -> bool {
        self.queued.contains_key(user_id)
    }

    /// Get player's current match ID
    pub fn get_player_match(&self, user_id: &Uuid) -> Option<Uuid> {
        self.player_matches.get(user_id).map(|r| *r)
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<MatchRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{CancelReason, MatchOutcome, MatchStage, MatchSummary, RecordError};
    use crate::ws::protocol::PlayerInfo;
    use futures::future::BoxFuture;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    #[derive(Default)]
    struct StubIdentity {
        broken: DashMap<Uuid, ()>,
    }

    impl IdentityProvider for StubIdentity {
        fn lookup(&self, user_id: Uuid) -> BoxFuture<'_, Result<PlayerInfo, IdentityError>> {
            Box::pin(async move {
                if self.broken.contains_key(&user_id) {
                    Err(IdentityError::NotFound(user_id))
                } else {
                    Ok(PlayerInfo::new(user_id, format!("player-{}", &user_id.to_string()[..4])))
                }
            })
        }
    }

    #[derive(Default)]
    struct StubRecorder {
        summaries: SlotMutex<Vec<MatchSummary>>,
    }

    impl MatchRecorder for StubRecorder {
        fn record<'a>(&'a self, summary: &'a MatchSummary) -> BoxFuture<'a, Result<(), RecordError>> {
            Box::pin(async move {
                self.summaries.lock().push(summary.clone());
                Ok(())
            })
        }
    }

    struct Harness {
        service: Arc<MatchmakingService>,
        identity: Arc<StubIdentity>,
        recorder: Arc<StubRecorder>,
    }

    fn harness(settings: MatchmakingSettings) -> Harness {
        let identity = Arc::new(StubIdentity::default());
        let recorder = Arc::new(StubRecorder::default());
        let service = Arc::new(MatchmakingService::new(
            Arc::new(MatchRegistry::new()),
            identity.clone(),
            recorder.clone(),
            Arc::new(RuleBook::new(None).unwrap()),
            settings,
        ));
        Harness {
            service,
            identity,
            recorder,
        }
    }

    #[tokio::test]
    async fn two_turbo_players_create_a_waiting_match() {
        let h = harness(MatchmakingSettings::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = assert_ok!(h.service.enqueue(a, MatchType::Turbo).await);
        assert_eq!(first, EnqueueOutcome::Queued);
        let second = assert_ok!(h.service.enqueue(b, MatchType::Turbo).await);

        let EnqueueOutcome::Matched(match_id) = second else {
            panic!("expected a match, got {second:?}");
        };
        let handle = h.service.registry().get(&match_id).unwrap();
        assert_eq!(handle.stage(), MatchStage::AwaitingPlayers);
        assert_eq!(handle.match_type, MatchType::Turbo);
        assert_eq!(h.service.queue_size(MatchType::Turbo).await, 0);
        assert_eq!(h.service.get_player_match(&a), Some(match_id));
        assert_eq!(h.service.get_player_match(&b), Some(match_id));
        assert!(!h.service.is_queued(&a));
    }

    #[tokio::test]
    async fn pairs_first_come_first_served() {
        let h = harness(MatchmakingSettings::default());
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        h.service.enqueue(a, MatchType::Classic).await.unwrap();
        h.service.enqueue(b, MatchType::Classic).await.unwrap();
        assert_eq!(
            h.service.enqueue(c, MatchType::Classic).await.unwrap(),
            EnqueueOutcome::Queued
        );

        let match_id = h.service.get_player_match(&a).unwrap();
        let handle = h.service.registry().get(&match_id).unwrap();
        assert_eq!(handle.left.user_id, a);
        assert_eq!(handle.right.user_id, b);
        assert!(h.service.is_queued(&c));
    }

    #[tokio::test]
    async fn dequeue_before_pairing_prevents_match() {
        let h = harness(MatchmakingSettings::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        h.service.enqueue(a, MatchType::Classic).await.unwrap();
        assert_ok!(h.service.dequeue(a).await);
        assert!(matches!(
            h.service.dequeue(a).await,
            Err(MatchmakingError::NotQueued)
        ));

        assert_eq!(
            h.service.enqueue(b, MatchType::Classic).await.unwrap(),
            EnqueueOutcome::Queued
        );
        assert_eq!(h.service.registry().active_matches(), 0);
    }

    #[tokio::test]
    async fn one_queue_entry_per_player_across_types() {
        let h = harness(MatchmakingSettings::default());
        let a = Uuid::new_v4();

        h.service.enqueue(a, MatchType::Classic).await.unwrap();
        let err = h.service.enqueue(a, MatchType::Turbo).await.unwrap_err();
        assert_eq!(err.code(), "already_queued");
        assert_eq!(h.service.queue_size(MatchType::Turbo).await, 0);
    }

    #[tokio::test]
    async fn players_in_a_match_cannot_queue() {
        let h = harness(MatchmakingSettings::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        h.service.enqueue(a, MatchType::Classic).await.unwrap();
        h.service.enqueue(b, MatchType::Classic).await.unwrap();

        let err = h.service.enqueue(a, MatchType::Classic).await.unwrap_err();
        assert!(matches!(err, MatchmakingError::AlreadyInMatch));
    }

    #[tokio::test]
    async fn failed_identity_lookup_reports_match_creation_failure() {
        let h = harness(MatchmakingSettings::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, mut a_rx) = h.service.register_player(a);

        h.service.enqueue(a, MatchType::Classic).await.unwrap();
        h.identity.broken.insert(a, ());

        let err = h.service.enqueue(b, MatchType::Classic).await.unwrap_err();
        assert_eq!(err.code(), "match_creation_failed");
        assert_eq!(h.service.registry().active_matches(), 0);
        assert_eq!(h.service.queue_size(MatchType::Classic).await, 0);

        assert!(matches!(a_rx.recv().await, Some(ServerMsg::Enqueued { .. })));
        match a_rx.recv().await {
            Some(ServerMsg::Error { code, .. }) => assert_eq!(code, "match_creation_failed"),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_player_lookup_fails_enqueue() {
        let h = harness(MatchmakingSettings::default());
        let a = Uuid::new_v4();
        h.identity.broken.insert(a, ());

        let err = h.service.enqueue(a, MatchType::Classic).await.unwrap_err();
        assert_eq!(err.code(), "identity_lookup_failed");
        assert!(!h.service.is_queued(&a));
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_and_notified() {
        let h = harness(MatchmakingSettings {
            queue_timeout: Duration::ZERO,
            ..MatchmakingSettings::default()
        });
        let a = Uuid::new_v4();
        let (_, mut rx) = h.service.register_player(a);

        h.service.enqueue(a, MatchType::Turbo).await.unwrap();
        assert_eq!(h.service.evict_expired().await, 1);
        assert_eq!(h.service.queue_size(MatchType::Turbo).await, 0);
        assert!(!h.service.is_queued(&a));

        assert!(matches!(rx.recv().await, Some(ServerMsg::Enqueued { .. })));
        match rx.recv().await {
            Some(ServerMsg::Error { code, .. }) => assert_eq!(code, "timeout"),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn route_input_rejects_unknown_match_and_outsiders() {
        let h = harness(MatchmakingSettings::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let err = h
            .service
            .route_input(a, Uuid::new_v4(), MatchInput::Ready)
            .await
            .unwrap_err();
        assert!(matches!(err, MatchmakingError::StaleMatch));

        h.service.enqueue(a, MatchType::Classic).await.unwrap();
        h.service.enqueue(b, MatchType::Classic).await.unwrap();
        let match_id = h.service.get_player_match(&a).unwrap();

        let err = h
            .service
            .route_input(Uuid::new_v4(), match_id, MatchInput::Ready)
            .await
            .unwrap_err();
        assert!(matches!(err, MatchmakingError::NotAParticipant));
        assert_ok!(h.service.route_input(a, match_id, MatchInput::Ready).await);
    }

    #[tokio::test]
    async fn joined_players_receive_match_broadcasts() {
        let h = harness(MatchmakingSettings::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, mut a_rx) = h.service.register_player(a);
        let (_, _b_rx) = h.service.register_player(b);

        h.service.enqueue(a, MatchType::Classic).await.unwrap();
        let EnqueueOutcome::Matched(match_id) =
            h.service.enqueue(b, MatchType::Classic).await.unwrap()
        else {
            panic!("expected a match");
        };

        assert_ok!(h.service.join_match(a, match_id).await);
        assert_ok!(h.service.join_match(b, match_id).await);

        let found_stage = timeout(Duration::from_secs(5), async {
            while let Some(msg) = a_rx.recv().await {
                if let ServerMsg::StageChanged { stage, .. } = msg {
                    return Some(stage);
                }
            }
            None
        })
        .await
        .unwrap();
        assert_eq!(found_stage, Some(MatchStage::Preparation));
    }

    #[tokio::test]
    async fn ended_match_is_recorded_and_cleaned_up() {
        let h = harness(MatchmakingSettings::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        h.service.enqueue(a, MatchType::Classic).await.unwrap();
        h.service.enqueue(b, MatchType::Classic).await.unwrap();
        let match_id = h.service.get_player_match(&a).unwrap();

        h.service.registry().get(&match_id).unwrap().cancel();

        timeout(Duration::from_secs(5), async {
            while h.service.get_player_match(&a).is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(h.recorder.summaries.lock()[0].match_id, match_id);
        assert!(h.service.registry().get(&match_id).is_none());
        assert_ok!(h.service.enqueue(a, MatchType::Classic).await);
    }

    /// Notes whether the match was still registered while its result was written
    struct RegistryWitness {
        registry: Arc<MatchRegistry>,
        registered_while_recording: SlotMutex<Vec<bool>>,
    }

    impl MatchRecorder for RegistryWitness {
        fn record<'a>(&'a self, summary: &'a MatchSummary) -> BoxFuture<'a, Result<(), RecordError>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                let registered = self.registry.get(&summary.match_id).is_some();
                self.registered_while_recording.lock().push(registered);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn match_stays_registered_until_recorded() {
        let registry = Arc::new(MatchRegistry::new());
        let witness = Arc::new(RegistryWitness {
            registry: registry.clone(),
            registered_while_recording: SlotMutex::new(Vec::new()),
        });
        let service = MatchmakingService::new(
            registry.clone(),
            Arc::new(StubIdentity::default()),
            witness.clone(),
            Arc::new(RuleBook::new(None).unwrap()),
            MatchmakingSettings::default(),
        );
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        service.enqueue(a, MatchType::Classic).await.unwrap();
        service.enqueue(b, MatchType::Classic).await.unwrap();

        service.shutdown(Duration::from_secs(5)).await;

        assert_eq!(*witness.registered_while_recording.lock(), vec![true]);
        assert_eq!(registry.active_matches(), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_canceled_matches_to_be_recorded() {
        let h = harness(MatchmakingSettings::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        h.service.enqueue(a, MatchType::Turbo).await.unwrap();
        let EnqueueOutcome::Matched(match_id) =
            h.service.enqueue(b, MatchType::Turbo).await.unwrap()
        else {
            panic!("expected a match");
        };

        h.service.shutdown(Duration::from_secs(5)).await;

        let summaries = h.recorder.summaries.lock();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].match_id, match_id);
        assert_eq!(
            summaries[0].outcome,
            MatchOutcome::Canceled {
                reason: CancelReason::Aborted
            }
        );
        assert_eq!(h.service.registry().active_matches(), 0);
        assert_eq!(h.service.get_player_match(&a), None);
    }

    #[tokio::test]
    async fn join_after_match_end_leaves_no_mapping() {
        let h = harness(MatchmakingSettings::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, _a_rx) = h.service.register_player(a);
        h.service.enqueue(a, MatchType::Classic).await.unwrap();
        h.service.enqueue(b, MatchType::Classic).await.unwrap();
        let match_id = h.service.get_player_match(&a).unwrap();

        h.service.shutdown(Duration::from_secs(5)).await;

        let err = h.service.join_match(a, match_id).await.unwrap_err();
        assert!(matches!(err, MatchmakingError::StaleMatch));
        assert_eq!(h.service.get_player_match(&a), None);
        assert_ok!(h.service.enqueue(a, MatchType::Classic).await);
    }

    #[tokio::test]
    async fn mapping_to_finished_match_does_not_block_enqueue() {
        let h = harness(MatchmakingSettings::default());
        let a = Uuid::new_v4();
        h.service.player_matches.insert(a, Uuid::new_v4());

        let outcome = assert_ok!(h.service.enqueue(a, MatchType::Classic).await);
        assert_eq!(outcome, EnqueueOutcome::Queued);
        assert_eq!(h.service.get_player_match(&a), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dequeue_racing_pairing_never_both_succeed() {
        for _ in 0..200 {
            let h = harness(MatchmakingSettings::default());
            let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
            h.service.enqueue(a, MatchType::Classic).await.unwrap();

            let leaver = {
                let service = h.service.clone();
                tokio::spawn(async move { service.dequeue(a).await })
            };
            let joiner = {
                let service = h.service.clone();
                tokio::spawn(async move { service.enqueue(b, MatchType::Classic).await })
            };
            let left = leaver.await.unwrap();
            let joined = joiner.await.unwrap().unwrap();

            match joined {
                EnqueueOutcome::Matched(_) => {
                    assert!(matches!(left, Err(MatchmakingError::NotQueued)));
                    assert_eq!(h.service.registry().active_matches(), 1);
                }
                EnqueueOutcome::Queued => {
                    assert_ok!(left);
                    assert_eq!(h.service.registry().active_matches(), 0);
                    assert!(h.service.is_queued(&b));
                }
            }
            assert!(!h.service.is_queued(&a));
            h.service.shutdown(Duration::from_secs(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_of_one_player_keep_a_single_entry() {
        for _ in 0..200 {
            let h = harness(MatchmakingSettings::default());
            let a = Uuid::new_v4();

            let attempts: Vec<_> = [MatchType::Classic, MatchType::Turbo]
                .into_iter()
                .map(|match_type| {
                    let service = h.service.clone();
                    tokio::spawn(async move { service.enqueue(a, match_type).await })
                })
                .collect();

            let mut queued = 0;
            for attempt in attempts {
                match attempt.await.unwrap() {
                    Ok(outcome) => {
                        assert_eq!(outcome, EnqueueOutcome::Queued);
                        queued += 1;
                    }
                    Err(e) => assert!(matches!(e, MatchmakingError::AlreadyQueued)),
                }
            }

            assert_eq!(queued, 1);
            let total = h.service.queue_size(MatchType::Classic).await
                + h.service.queue_size(MatchType::Turbo).await;
            assert_eq!(total, 1);
            assert!(h.service.is_queued(&a));
        }
    }

    #[tokio::test]
    async fn stale_connection_unregister_keeps_new_one() {
        let h = harness(MatchmakingSettings::default());
        let a = Uuid::new_v4();
        let (old_id, _old_rx) = h.service.register_player(a);
        let (_new_id, mut new_rx) = h.service.register_player(a);

        h.service.unregister_player(a, old_id).await;
        h.service.enqueue(a, MatchType::Classic).await.unwrap();
        assert!(matches!(new_rx.recv().await, Some(ServerMsg::Enqueued { .. })));
    }

    #[tokio::test]
    async fn unregister_leaves_the_queue() {
        let h = harness(MatchmakingSettings::default());
        let a = Uuid::new_v4();
        let (connection_id, _rx) = h.service.register_player(a);
        h.service.enqueue(a, MatchType::Classic).await.unwrap();

        h.service.unregister_player(a, connection_id).await;
        assert!(!h.service.is_queued(&a));
        assert_eq!(h.service.queue_size(MatchType::Classic).await, 0);
    }
}
