//! Configuration for the reading session engine

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tuning knobs for sessions and sync
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between periodic checkpoints while reading
    pub checkpoint_interval: Duration,
    /// No navigation for this long pauses the session; also caps the time
    /// credited per tick
    pub idle_threshold: Duration,
    /// First retry delay after a transient sync failure
    pub backoff_base: Duration,
    /// Upper bound for the retry delay
    pub backoff_cap: Duration,
    /// Quiet period before a captured checkpoint triggers a sync
    pub sync_debounce: Duration,
    /// Pending checkpoints above this count raise the degraded signal
    pub degraded_pending_limit: usize,
    /// Pending checkpoints older than this raise the degraded signal
    pub degraded_pending_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            checkpoint_interval: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            sync_debounce: Duration::from_secs(2),
            degraded_pending_limit: 500,
            degraded_pending_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub authority: AuthorityConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            engine: EngineConfig::default(),
            authority: AuthorityConfig {
                url: "http://localhost:3000".to_string(),
                api_key: None,
                timeout: Duration::from_secs(10),
            },
            database: DatabaseConfig {
                url: "sqlite:./reader.db".to_string(),
            },
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
        }
    }
}

fn parsed<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={}", name, raw);
            default
        }),
        Err(_) => default,
    }
}

fn secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(parsed(name, default.as_secs()))
}

fn millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(parsed(name, default.as_millis() as u64))
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        EngineConfig {
            checkpoint_interval: secs("READER_CHECKPOINT_INTERVAL_SECS", defaults.checkpoint_interval),
            idle_threshold: secs("READER_IDLE_THRESHOLD_SECS", defaults.idle_threshold),
            backoff_base: millis("READER_BACKOFF_BASE_MS", defaults.backoff_base),
            backoff_cap: secs("READER_BACKOFF_CAP_SECS", defaults.backoff_cap),
            sync_debounce: millis("READER_SYNC_DEBOUNCE_MS", defaults.sync_debounce),
            degraded_pending_limit: parsed(
                "READER_DEGRADED_PENDING_LIMIT",
                defaults.degraded_pending_limit,
            ),
            degraded_pending_age: secs(
                "READER_DEGRADED_PENDING_AGE_SECS",
                defaults.degraded_pending_age,
            ),
        }
    }
}

impl Config {
    /// Read configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            engine: EngineConfig::from_env(),
            authority: AuthorityConfig {
                url: env::var("AUTHORITY_URL").unwrap_or(defaults.authority.url),
                api_key: env::var("AUTHORITY_API_KEY").ok(),
                timeout: secs("AUTHORITY_TIMEOUT_SECS", defaults.authority.timeout),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parsed("SERVER_PORT", defaults.server.port),
            },
        }
    }
}
