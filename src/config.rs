//! Server configuration loaded from the environment (after `dotenvy`)

use std::env;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Default bill-code allocation attempts before giving up
pub const DEFAULT_BILL_CODE_MAX_ATTEMPTS: u32 = 40;

/// Default broadcast buffer for live event subscribers
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Listen address for the HTTP API
    pub bind_addr: String,
    pub db_max_connections: u32,
    pub bill_code_max_attempts: u32,
    pub event_channel_capacity: usize,
    /// Apply pending migrations on startup
    pub run_migrations: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, BoxError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 10)?,
            bill_code_max_attempts: parse_or(
                "BILL_CODE_MAX_ATTEMPTS",
                DEFAULT_BILL_CODE_MAX_ATTEMPTS,
            )?,
            event_channel_capacity: parse_or(
                "EVENT_CHANNEL_CAPACITY",
                DEFAULT_EVENT_CHANNEL_CAPACITY,
            )?,
            run_migrations: parse_or("RUN_MIGRATIONS", true)?,
        })
    }
}

fn parse_or<T>(name: &str, default: T) -> Result<T, BoxError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| format!("{name} has invalid value {raw:?}: {e}").into()),
        _ => Ok(default),
    }
}
