use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub vapid: VapidConfig,
    pub rate_limit: RateLimitConfig,
    pub intervals: IntervalsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory of static assets served at `/` (core spec §6, `index.html`).
    pub asset_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    /// Pinned to 1: the store is a single-writer engine serialized by
    /// [`crate::store::Store`]'s own mutex. A bigger pool would only hand
    /// out connections that immediately contend with each other.
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VapidConfig {
    /// The `sub` claim asserted in every push JWT (e.g. `mailto:admin@example.com`).
    pub subject: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for `/api/create_session`.
    pub session_per_second: u32,
    pub session_burst: u32,
}

/// Tunables named in core spec §6's CLI/environment table.
#[derive(Debug, Clone, Deserialize)]
pub struct IntervalsConfig {
    /// Seconds added to `next_pull` each time a query is leased to the crawler.
    pub refresh_interval_secs: i64,
    /// How long an `AdContentText` row suppresses a repeat notification.
    pub ad_text_expiration_secs: i64,
    /// Minimum spacing, per query, between two notification fan-outs.
    pub min_notify_interval_secs: i64,
    /// Bounded history per ad query.
    pub max_ad_history: i64,
    /// Clients idle longer than this are pruned by `cleanup_sessions`.
    pub session_expiration_secs: i64,
    /// Attempts allowed (including the first) before a push item is dropped
    /// and its client is unsubscribed.
    pub max_message_retries: i64,
    /// Seconds added to `retry_time` each time a push item is leased.
    pub message_retry_interval_secs: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                asset_dir: env::var("ASSET_DIR").unwrap_or_else(|_| "assets".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/ad_watch.db".to_string()),
                max_connections: 1,
            },
            vapid: VapidConfig {
                subject: env::var("VAPID_SUBJECT")
                    .unwrap_or_else(|_| "mailto:admin@localhost".to_string()),
            },
            rate_limit: RateLimitConfig {
                session_per_second: env::var("RATE_LIMIT_SESSION_PER_SECOND")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
                session_burst: env::var("RATE_LIMIT_SESSION_BURST")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            intervals: IntervalsConfig {
                refresh_interval_secs: env::var("REFRESH_INTERVAL_SECS")
                    .unwrap_or_else(|_| "900".to_string())
                    .parse()
                    .unwrap_or(900),
                ad_text_expiration_secs: env::var("AD_TEXT_EXPIRATION_SECS")
                    .unwrap_or_else(|_| (5 * 24 * 60 * 60).to_string())
                    .parse()
                    .unwrap_or(5 * 24 * 60 * 60),
                min_notify_interval_secs: env::var("MIN_NOTIFY_INTERVAL_SECS")
                    .unwrap_or_else(|_| (5 * 60).to_string())
                    .parse()
                    .unwrap_or(5 * 60),
                max_ad_history: env::var("MAX_AD_HISTORY")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .unwrap_or(50),
                session_expiration_secs: env::var("SESSION_EXPIRATION_SECS")
                    .unwrap_or_else(|_| (120 * 24 * 60 * 60).to_string())
                    .parse()
                    .unwrap_or(120 * 24 * 60 * 60),
                max_message_retries: env::var("MAX_MESSAGE_RETRIES")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
                message_retry_interval_secs: env::var("MESSAGE_RETRY_INTERVAL_SECS")
                    .unwrap_or_else(|_| (30 * 60).to_string())
                    .parse()
                    .unwrap_or(30 * 60),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                asset_dir: "assets".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/ad_watch.db".to_string(),
                max_connections: 1,
            },
            vapid: VapidConfig {
                subject: "mailto:admin@localhost".to_string(),
            },
            rate_limit: RateLimitConfig {
                session_per_second: 3,
                session_burst: 10,
            },
            intervals: IntervalsConfig {
                refresh_interval_secs: 900,
                ad_text_expiration_secs: 5 * 24 * 60 * 60,
                min_notify_interval_secs: 5 * 60,
                max_ad_history: 50,
                session_expiration_secs: 120 * 24 * 60 * 60,
                max_message_retries: 3,
                message_retry_interval_secs: 30 * 60,
            },
        }
    }
}
