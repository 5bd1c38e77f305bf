//! Client-side collaboration settings.
//!
//! Durations are stored as milliseconds so the struct loads straight from
//! JSON; accessors hand out [`Duration`]s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for a collaboration session and its transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Base endpoint; the project id is appended as a path segment.
    pub server_url: String,
    /// Reconnects attempted after an unexpected close before giving up.
    pub max_reconnect_attempts: u32,
    /// Reconnect `n` waits `n * reconnect_base_delay_ms`.
    pub reconnect_base_delay_ms: u64,
    /// Quiet period before a local edit is broadcast.
    pub debounce_ms: u64,
    /// Lifetime of a "saved by someone else" notice.
    pub notice_ttl_ms: u64,
    /// Cursor poll fallback period.
    pub cursor_poll_interval_ms: u64,
    /// Event bus buffer per subscriber. Lagging subscribers lose events.
    pub bus_capacity: usize,
    /// Lossless event feed into the session loop; a full feed pushes back
    /// on the socket reader.
    pub inbound_capacity: usize,
    /// Frames in flight between the session and the socket writer.
    pub outbound_capacity: usize,
    /// Chat entries kept in memory.
    pub chat_history: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/ws/collaboration".to_string(),
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
            debounce_ms: 500,
            notice_ttl_ms: 3000,
            cursor_poll_interval_ms: 1000,
            bus_capacity: 256,
            inbound_capacity: 256,
            outbound_capacity: 256,
            chat_history: 200,
        }
    }
}

impl CollabConfig {
    /// Parse from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Base URL; project id and query are appended per connect.
    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = server_url.into();
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    /// Quiet period before a local edit is broadcast.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// How long a save notice stays visible.
    pub fn notice_ttl(&self) -> Duration {
        Duration::from_millis(self.notice_ttl_ms)
    }

    /// Cursor poll period, at least 1 ms.
    pub fn cursor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cursor_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.debounce(), Duration::from_millis(500));
        assert_eq!(config.notice_ttl(), Duration::from_secs(3));
    }

    #[test]
    fn test_reconnect_delay_grows_linearly() {
        let config = CollabConfig::default();
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(3), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CollabConfig::from_json(r#"{"debounce_ms": 50}"#).unwrap();
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.server_url, "ws://localhost:8080/ws/collaboration");
    }
}
