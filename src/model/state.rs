use std::fmt;

use serde::Serialize;

/// Lifecycle of a realtime session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session, or the last one was stopped
    #[default]
    Inactive,
    /// Credential fetch, offer/answer or ICE is in progress
    Connecting,
    /// The control channel is open
    Active,
    /// The remote side closed the channel or the transport died
    Closed,
}

impl SessionState {
    /// Whether `start()` may be called in this state.
    pub fn can_start(self) -> bool {
        matches!(self, SessionState::Inactive | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Inactive => "inactive",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
