//! Engine configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the engine can start with zero
//! configuration.

use std::path::PathBuf;
use std::time::Duration;

use hearth_shared::constants::{
    DEFAULT_CONVERSATION_TTL_SECS, DEFAULT_DUPLICATE_WINDOW_SECS, DEFAULT_ENRICH_WORKERS,
    DEFAULT_FETCH_DEBOUNCE_MS, DEFAULT_MESSAGE_TTL_SECS, DEFAULT_PAGE_SIZE,
};

/// Synchronization engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long a fetched message list is served without a round-trip.
    /// Env: `HEARTH_MESSAGE_TTL_SECS`
    /// Default: 60 s
    pub message_ttl: Duration,

    /// How long a fetched conversation list is served without a round-trip.
    /// Env: `HEARTH_CONVERSATION_TTL_SECS`
    /// Default: 300 s
    pub conversation_ttl: Duration,

    /// Non-forced fetches started closer together than this are skipped.
    /// Env: `HEARTH_FETCH_DEBOUNCE_MS`
    /// Default: 300 ms
    pub fetch_debounce: Duration,

    /// Messages requested per container fetch.
    /// Env: `HEARTH_PAGE_SIZE`
    /// Default: 100
    pub page_size: u32,

    /// Workers computing unread counts in the background.
    /// Env: `HEARTH_ENRICH_WORKERS`
    /// Default: 4
    pub enrich_workers: usize,

    /// Maximum creation-time distance between an optimistic entry and the
    /// durable row matched to it.
    /// Env: `HEARTH_DUPLICATE_WINDOW_SECS`
    /// Default: 10 s
    pub duplicate_window: Duration,

    /// Explicit SQLite path for the demo binary.
    /// Env: `HEARTH_DB_PATH`
    /// Default: none (a file in the temp directory)
    pub db_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            message_ttl: Duration::from_secs(DEFAULT_MESSAGE_TTL_SECS),
            conversation_ttl: Duration::from_secs(DEFAULT_CONVERSATION_TTL_SECS),
            fetch_debounce: Duration::from_millis(DEFAULT_FETCH_DEBOUNCE_MS),
            page_size: DEFAULT_PAGE_SIZE,
            enrich_workers: DEFAULT_ENRICH_WORKERS,
            duplicate_window: Duration::from_secs(DEFAULT_DUPLICATE_WINDOW_SECS),
            db_path: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_number("HEARTH_MESSAGE_TTL_SECS") {
            config.message_ttl = Duration::from_secs(secs);
        }

        if let Some(secs) = env_number("HEARTH_CONVERSATION_TTL_SECS") {
            config.conversation_ttl = Duration::from_secs(secs);
        }

        if let Some(ms) = env_number("HEARTH_FETCH_DEBOUNCE_MS") {
            config.fetch_debounce = Duration::from_millis(ms);
        }

        if let Some(size) = env_number("HEARTH_PAGE_SIZE") {
            match u32::try_from(size) {
                Ok(size) if size > 0 => config.page_size = size,
                _ => tracing::warn!(value = size, "Invalid HEARTH_PAGE_SIZE, using default"),
            }
        }

        if let Some(workers) = env_number("HEARTH_ENRICH_WORKERS") {
            // At least one worker, otherwise unread counts never resolve.
            config.enrich_workers = (workers as usize).max(1);
        }

        if let Some(secs) = env_number("HEARTH_DUPLICATE_WINDOW_SECS") {
            config.duplicate_window = Duration::from_secs(secs);
        }

        if let Ok(path) = std::env::var("HEARTH_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        config
    }

    /// The duplicate window as a signed chrono duration, for comparing
    /// creation timestamps.
    pub fn duplicate_window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.duplicate_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_DUPLICATE_WINDOW_SECS as i64))
    }
}

fn env_number(name: &str) -> Option<u64> {
    let value = std::env::var(name).ok()?;
    let parsed = parse_number(&value);
    if parsed.is_none() {
        tracing::warn!(var = name, value = %value, "Invalid numeric setting, using default");
    }
    parsed
}

fn parse_number(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}
