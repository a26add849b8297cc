//! Relay configuration
//!
//! Everything the relay needs to know about its endpoints lives here. The
//! library never reads the environment; callers build a [`RelayConfig`] (or
//! deserialize one) and hand it to [`crate::relay::SessionRelay::spawn`].

use serde::{Deserialize, Serialize};

pub const DEFAULT_TOKEN_URL: &str = "http://localhost:3000/token";
pub const DEFAULT_REALTIME_URL: &str = "https://api.openai.com/v1/realtime";
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";
pub const DEFAULT_CHANNEL_LABEL: &str = "oai-events";
pub const DEFAULT_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Local endpoint that mints ephemeral credentials
    pub token_url: String,
    /// Remote negotiation endpoint; the model is passed as a query parameter
    pub realtime_url: String,
    pub model: String,
    /// Label of the data channel carrying JSON events
    pub channel_label: String,
    /// Maximum number of entries kept in the event log
    pub log_capacity: usize,
    /// Record remote audio while the session runs. The local audio track is
    /// negotiated either way but stays muted.
    pub audio_enabled: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            token_url: DEFAULT_TOKEN_URL.to_string(),
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            audio_enabled: false,
        }
    }
}
