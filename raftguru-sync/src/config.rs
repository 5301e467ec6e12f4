//! Engine configuration with environment overrides.

use std::path::PathBuf;
use std::time::Duration;

/// Sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket endpoint of the record server
    pub ws_url: String,
    /// Base URL of the record API (`/items`, `/auth`, `/users`)
    pub api_url: String,
    /// Upper bound on opening the socket
    pub connect_timeout: Duration,
    /// How long bootstrap waits for the first event of a subscription
    pub first_event_timeout: Duration,
    /// Pause between reconnect attempts
    pub reconnect_delay: Duration,
    /// Give up after this many consecutive failed attempts (None = never)
    pub max_reconnect_attempts: Option<u32>,
    /// Where the last active batch id is kept (None = in-memory only)
    pub token_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8055/websocket".to_string(),
            api_url: "http://localhost:8055".to_string(),
            connect_timeout: Duration::from_secs(10),
            first_event_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: None,
            token_path: None,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `RAFTGURU_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup("RAFTGURU_WS_URL") {
            config.ws_url = url;
        }
        if let Some(url) = lookup("RAFTGURU_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(path) = lookup("RAFTGURU_TOKEN_PATH") {
            config.token_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = seconds(&lookup, "RAFTGURU_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = secs;
        }
        if let Some(secs) = seconds(&lookup, "RAFTGURU_FIRST_EVENT_TIMEOUT_SECS") {
            config.first_event_timeout = secs;
        }
        if let Some(secs) = seconds(&lookup, "RAFTGURU_RECONNECT_DELAY_SECS") {
            config.reconnect_delay = secs;
        }
        if let Some(raw) = lookup("RAFTGURU_MAX_RECONNECT_ATTEMPTS") {
            match raw.parse() {
                Ok(attempts) => config.max_reconnect_attempts = Some(attempts),
                Err(_) => log::warn!("[Config] ignoring RAFTGURU_MAX_RECONNECT_ATTEMPTS={raw}"),
            }
        }
        config
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            log::warn!("[Config] ignoring {key}={raw}: not a number of seconds");
            None
        }
    }
}
