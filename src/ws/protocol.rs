//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::{MatchStage, MatchSummary, Side};

/// Match variants players can queue for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    /// Standard ball speed
    Classic,
    /// Faster serve and steeper acceleration
    Turbo,
}

impl MatchType {
    pub const ALL: [MatchType; 2] = [MatchType::Classic, MatchType::Turbo];
}

impl Default for MatchType {
    fn default() -> Self {
        Self::Classic
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Join the matchmaking queue
    Enqueue { match_type: MatchType },

    /// Leave the matchmaking queue
    Dequeue,

    /// Attach this connection to a match found by matchmaking
    JoinMatch { match_id: Uuid },

    /// Confirm readiness during preparation
    Ready { match_id: Uuid },

    /// Absolute paddle position
    PaddleMove {
        match_id: Uuid,
        side: Side,
        y: f32,
    },

    /// Give up the match
    Forfeit { match_id: Uuid },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome { user_id: Uuid, server_time: u64 },

    /// Placed in a matchmaking queue
    Enqueued { match_type: MatchType },

    /// Removed from the matchmaking queue
    Dequeued,

    /// Matchmaking paired this player
    MatchFound {
        match_id: Uuid,
        match_type: MatchType,
        left: PlayerInfo,
        right: PlayerInfo,
    },

    /// Match moved to a new stage
    StageChanged { match_id: Uuid, stage: MatchStage },

    /// Pre-game countdown
    MatchCountdown {
        match_id: Uuid,
        seconds_remaining: u32,
    },

    /// Game state snapshot (sent at regular intervals)
    Snapshot(StateSnapshot),

    /// Match has ended
    MatchEnd { summary: MatchSummary },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl ToString) -> Self {
        ServerMsg::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

/// Player identity as shown to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub user_id: Uuid,
    pub display_name: String,
}

impl PlayerInfo {
    pub fn new(user_id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
        }
    }
}

/// Ball state in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BallSnapshot {
    pub x: f32,
    pub y: f32,
    /// Direction X
    pub vel_x: f32,
    /// Direction Y
    pub vel_y: f32,
    pub speed: f32,
}

/// Full match state broadcast to both players
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub match_id: Uuid,
    /// Server tick number
    pub tick: u64,
    pub stage: MatchStage,
    pub ball: BallSnapshot,
    pub left_paddle_y: f32,
    pub right_paddle_y: f32,
    pub left_score: u32,
    pub right_score: u32,
    /// Events that occurred since last snapshot
    pub events: Vec<GameEvent>,
}

/// Physics events
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GameEvent {
    /// Ball bounced off the top or bottom wall
    WallBounce,

    /// Ball returned by a paddle
    PaddleHit { side: Side },

    /// Ball reached a goal edge
    Goal { scorer: Side },
}
