//! Player identity lookup used when enqueueing

use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

use crate::ws::protocol::PlayerInfo;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("No profile for player {0}")]
    NotFound(Uuid),

    #[error("Identity backend error: {0}")]
    Backend(String),
}

/// Resolves a user id to the identity shown to opponents
pub trait IdentityProvider: Send + Sync {
    fn lookup(&self, user_id: Uuid) -> BoxFuture<'_, Result<PlayerInfo, IdentityError>>;
}
