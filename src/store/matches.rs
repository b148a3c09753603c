//! Match history persistence

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::game::{CancelReason, MatchOutcome, MatchRecorder, MatchSummary, RecordError};
use crate::ws::protocol::MatchType;

use super::supabase::SupabaseClient;

/// Row in the `matches` table
#[derive(Debug, Clone, Serialize)]
pub struct MatchRecord {
    pub id: Uuid,
    pub match_type: MatchType,
    pub left_player_id: Uuid,
    pub right_player_id: Uuid,
    pub left_score: u32,
    pub right_score: u32,
    pub winner_id: Option<Uuid>,
    /// `FINISHED` or `CANCELED`
    pub status: &'static str,
    pub cancel_reason: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl From<&MatchSummary> for MatchRecord {
    fn from(summary: &MatchSummary) -> Self {
        let (status, cancel_reason) = match &summary.outcome {
            MatchOutcome::Winner { .. } => ("FINISHED", None),
            MatchOutcome::Canceled { reason } => ("CANCELED", Some(cancel_reason_label(reason))),
        };

        Self {
            id: summary.match_id,
            match_type: summary.match_type,
            left_player_id: summary.left_player.user_id,
            right_player_id: summary.right_player.user_id,
            left_score: summary.left_score,
            right_score: summary.right_score,
            winner_id: summary.winner().map(|p| p.user_id),
            status,
            cancel_reason,
            starts_at: summary.starts_at,
            ends_at: summary.ends_at,
        }
    }
}

fn cancel_reason_label(reason: &CancelReason) -> String {
    match reason {
        CancelReason::Disconnected(side) => format!("disconnected:{side:?}").to_lowercase(),
        CancelReason::Forfeit(side) => format!("forfeit:{side:?}").to_lowercase(),
        CancelReason::Aborted => "aborted".to_string(),
    }
}

/// Writes finished and canceled matches to Supabase
#[derive(Clone)]
pub struct MatchStore {
    client: SupabaseClient,
}

impl MatchStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }
}

impl MatchRecorder for MatchStore {
    fn record<'a>(&'a self, summary: &'a MatchSummary) -> BoxFuture<'a, Result<(), RecordError>> {
        Box::pin(async move {
            let record = MatchRecord::from(summary);
            self.client
                .insert_minimal("matches", &record)
                .await
                .map_err(|e| RecordError {
                    match_id: summary.match_id,
                    message: e.to_string(),
                })?;

            info!(match_id = %summary.match_id, status = record.status, "Match recorded");
            Ok(())
        })
    }
}
