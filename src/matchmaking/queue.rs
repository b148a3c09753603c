//! Matchmaking queue implementation

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::ws::protocol::PlayerInfo;

/// Player waiting in a matchmaking queue
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub player: PlayerInfo,
    pub enqueued_at: Instant,
}

impl QueueEntry {
    pub fn new(player: PlayerInfo) -> Self {
        Self {
            player,
            enqueued_at: Instant::now(),
        }
    }

    /// How long this player has been waiting
    pub fn wait_time(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    pub fn user_id(&self) -> Uuid {
        self.player.user_id
    }
}

/// FIFO queue for a single match type
#[derive(Default)]
pub struct MatchmakingQueue {
    queue: VecDeque<QueueEntry>,
}

impl MatchmakingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a player to the back of the queue.
    /// Returns false if they were already waiting here.
    pub fn enqueue(&mut self, entry: QueueEntry) -> bool {
        if self.contains(&entry.user_id()) {
            return false;
        }
        self.queue.push_back(entry);
        true
    }

    /// Remove a player from the queue
    pub fn remove(&mut self, user_id: Uuid) -> Option<QueueEntry> {
        let pos = self.queue.iter().position(|e| e.user_id() == user_id)?;
        self.queue.remove(pos)
    }

    /// Check if a player is in the queue
    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.queue.iter().any(|e| &e.user_id() == user_id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Take the two longest-waiting players, if there are two distinct ones
    pub fn try_pair(&mut self) -> Option<(QueueEntry, QueueEntry)> {
        if self.queue.len() < 2 {
            return None;
        }
        let first = self.queue.pop_front()?;
        let pos = match self
            .queue
            .iter()
            .position(|e| e.user_id() != first.user_id())
        {
            Some(pos) => pos,
            None => {
                self.queue.push_front(first);
                return None;
            }
        };
        let second = match self.queue.remove(pos) {
            Some(second) => second,
            None => {
                self.queue.push_front(first);
                return None;
            }
        };
        Some((first, second))
    }

    /// Drop everyone who has waited at least `timeout`
    pub fn evict_expired(&mut self, timeout: Duration) -> Vec<QueueEntry> {
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .queue
            .drain(..)
            .partition(|e| e.wait_time() >= timeout);
        self.queue = kept.into();
        expired
    }
}
