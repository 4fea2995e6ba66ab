use serde::Deserialize;

/// Engine runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Postgres connection string.
    pub database_url: String,
    /// Maximum connections in the pool.
    pub max_connections: u32,
    /// Path to the trigger catalog file.
    pub catalog_path: String,
    /// Log level used when RUST_LOG is not set.
    pub log_level: String,
    /// Maximum events pulled per lock query per poll.
    pub lock_batch_size: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/chime".to_string(),
            max_connections: 10,
            catalog_path: "triggers.yaml".to_string(),
            log_level: "info".to_string(),
            lock_batch_size: 100,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("CHIME_DATABASE_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .unwrap_or(defaults.database_url),
            max_connections: std::env::var("CHIME_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            catalog_path: std::env::var("CHIME_CATALOG").unwrap_or(defaults.catalog_path),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            lock_batch_size: std::env::var("CHIME_LOCK_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.lock_batch_size),
        }
    }
}
