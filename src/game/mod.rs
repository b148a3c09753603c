//! Match simulation modules

pub mod ball;
pub mod lifecycle;
pub mod r#match;
pub mod paddle;
pub mod physics;
pub mod rules;
pub mod snapshot;
pub mod summary;
pub mod vector;

pub use lifecycle::{LifecycleSettings, MatchStage};
pub use paddle::Side;
pub use r#match::{GameMatch, MatchRegistry, MatchSetup};
pub use rules::{RuleBook, Rules};
pub use summary::{CancelReason, MatchOutcome, MatchRecorder, MatchSummary, RecordError};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ws::protocol::ServerMsg;

/// Player intent queued for a match loop; applied at the start of its next tick
#[derive(Debug, Clone)]
pub struct PlayerInput {
    pub user_id: Uuid,
    pub input: MatchInput,
    /// Where to report a rejected input
    pub reply_tx: Option<mpsc::Sender<ServerMsg>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchInput {
    /// Connection attached to the match
    Join,
    /// Connection dropped
    Leave,
    Ready,
    PaddleMove { side: Side, y: f32 },
    Forfeit,
}
