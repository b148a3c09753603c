//! Player profiles, the identity source for matchmaking

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::matchmaking::{IdentityError, IdentityProvider};
use crate::ws::protocol::PlayerInfo;

use super::supabase::{SupabaseClient, SupabaseError};

/// User profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl UserProfile {
    /// Identity shown to opponents; falls back to a short id
    pub fn player_info(&self) -> PlayerInfo {
        let display_name = self
            .display_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| default_display_name(self.id));
        PlayerInfo::new(self.id, display_name)
    }
}

pub fn default_display_name(user_id: Uuid) -> String {
    format!("Player-{}", &user_id.simple().to_string()[..6])
}

/// New profile for insertion
#[derive(Debug, Clone, Serialize)]
pub struct NewProfile {
    pub id: Uuid,
    pub display_name: String,
}

/// Profile store operations
#[derive(Clone)]
pub struct ProfileStore {
    client: SupabaseClient,
}

impl ProfileStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }

    /// Get a user profile by ID
    pub async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, SupabaseError> {
        let query = format!("id=eq.{}", user_id);
        self.client.get_one("profiles", &query).await
    }

    /// Create a new user profile
    pub async fn create_profile(
        &self,
        user_id: Uuid,
        display_name: &str,
    ) -> Result<UserProfile, SupabaseError> {
        let profile = NewProfile {
            id: user_id,
            display_name: display_name.to_string(),
        };
        self.client.insert("profiles", &profile).await
    }

    /// Get or create profile (ensures profile exists)
    pub async fn ensure_profile(
        &self,
        user_id: Uuid,
        default_name: &str,
    ) -> Result<UserProfile, SupabaseError> {
        match self.get_profile(user_id).await? {
            Some(profile) => Ok(profile),
            None => self.create_profile(user_id, default_name).await,
        }
    }
}

impl IdentityProvider for ProfileStore {
    fn lookup(&self, user_id: Uuid) -> BoxFuture<'_, Result<PlayerInfo, IdentityError>> {
        Box::pin(async move {
            match self.get_profile(user_id).await {
                Ok(Some(profile)) => Ok(profile.player_info()),
                Ok(None) => Err(IdentityError::NotFound(user_id)),
                Err(e) => Err(IdentityError::Backend(e.to_string())),
            }
        })
    }
}
