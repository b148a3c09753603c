//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::{MatchRegistry, RuleBook};
use crate::matchmaking::MatchmakingService;
use crate::store::{MatchStore, ProfileStore, SupabaseClient};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub rules: Arc<RuleBook>,
    pub profile_store: ProfileStore,
    pub matchmaking: Arc<MatchmakingService>,
    pub match_registry: Arc<MatchRegistry>,
}

impl AppState {
    pub fn new(config: Config, rules: RuleBook) -> Self {
        let config = Arc::new(config);
        let rules = Arc::new(rules);

        // Initialize Supabase client
        let supabase = SupabaseClient::new(&config);

        // Initialize stores
        let profile_store = ProfileStore::new(supabase.clone());
        let match_store = MatchStore::new(supabase);

        // Initialize match registry
        let match_registry = Arc::new(MatchRegistry::new());

        // Initialize matchmaking service (Arc for sharing across cloned AppState)
        let matchmaking = Arc::new(MatchmakingService::new(
            match_registry.clone(),
            Arc::new(profile_store.clone()),
            Arc::new(match_store),
            rules.clone(),
            config.matchmaking_settings(),
        ));

        Self {
            config,
            rules,
            profile_store,
            matchmaking,
            match_registry,
        }
    }
}
