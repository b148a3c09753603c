//! End-of-match summary handed to persistence

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ws::protocol::{MatchType, PlayerInfo};

use super::paddle::Side;

/// Why a match was canceled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "side", rename_all = "snake_case")]
pub enum CancelReason {
    /// The side stayed away longer than the reconnect grace period
    Disconnected(Side),
    /// The side gave up
    Forfeit(Side),
    /// Stopped by the server
    Aborted,
}

/// How a match ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MatchOutcome {
    Winner { side: Side },
    Canceled { reason: CancelReason },
}

/// Read-only record of a finished or canceled match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSummary {
    pub match_id: Uuid,
    pub match_type: MatchType,
    pub left_player: PlayerInfo,
    pub right_player: PlayerInfo,
    pub left_score: u32,
    pub right_score: u32,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub outcome: MatchOutcome,
}

impl MatchSummary {
    pub fn winner(&self) -> Option<&PlayerInfo> {
        match self.outcome {
            MatchOutcome::Winner { side: Side::Left } => Some(&self.left_player),
            MatchOutcome::Winner { side: Side::Right } => Some(&self.right_player),
            MatchOutcome::Canceled { .. } => None,
        }
    }
}

/// Persistence sink for match summaries
pub trait MatchRecorder: Send + Sync {
    fn record<'a>(&'a self, summary: &'a MatchSummary) -> BoxFuture<'a, Result<(), RecordError>>;
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to record match {match_id}: {message}")]
pub struct RecordError {
    pub match_id: Uuid,
    pub message: String,
}
