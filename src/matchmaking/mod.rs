//! Matchmaking: per-type queues and match creation

pub mod identity;
pub mod queue;
pub mod service;

pub use identity::{IdentityError, IdentityProvider};
pub use service::{EnqueueOutcome, MatchmakingError, MatchmakingService, MatchmakingSettings};
