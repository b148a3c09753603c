//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::game::LifecycleSettings;
use crate::matchmaking::MatchmakingSettings;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Supabase project URL
    pub supabase_url: String,
    /// Supabase service role key (bypasses RLS - server only!)
    pub supabase_service_role_key: String,
    /// Supabase JWT secret for token verification
    pub supabase_jwt_secret: String,

    /// Allowed client origins for CORS, comma-separated
    pub client_origin: String,

    /// Longest wait in a matchmaking queue
    pub queue_timeout: Duration,
    /// How long a player may stay away from a running match
    pub reconnect_grace: Duration,
    /// Delay between both players being ready and the serve
    pub countdown: Duration,
    /// Overrides the per-type winning score
    pub winning_score: Option<u32>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            supabase_url: required("SUPABASE_URL")?,
            supabase_service_role_key: required("SUPABASE_SERVICE_ROLE_KEY")?,
            supabase_jwt_secret: required("SUPABASE_JWT_SECRET")?,
            client_origin: required("CLIENT_ORIGIN")?,

            queue_timeout: Duration::from_secs(parsed("QUEUE_TIMEOUT_SECS", 60)?),
            reconnect_grace: Duration::from_secs(parsed("RECONNECT_GRACE_SECS", 10)?),
            countdown: Duration::from_secs(parsed("COUNTDOWN_SECS", 3)?),
            winning_score: optional("WINNING_SCORE")?,
        })
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            reconnect_grace: self.reconnect_grace,
            countdown: self.countdown,
        }
    }

    pub fn matchmaking_settings(&self) -> MatchmakingSettings {
        MatchmakingSettings {
            queue_timeout: self.queue_timeout,
            lifecycle: self.lifecycle_settings(),
        }
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn optional<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    Ok(optional(key)?.unwrap_or(default))
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbers_and_rejects_garbage() {
        assert_eq!(parse_value::<u64>("COUNTDOWN_SECS", " 5 ").unwrap(), 5);
        let err = parse_value::<u32>("WINNING_SCORE", "many").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "WINNING_SCORE", .. }));
    }
}
