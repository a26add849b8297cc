use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while running a realtime session.
///
/// `Credential`, `Media` and `Negotiation` abort `start()`. The remaining
/// variants show up while a session is running and are usually logged and
/// dropped rather than returned.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The local token endpoint failed or returned an unusable body
    #[error("credential fetch failed: {0}")]
    Credential(String),

    /// The local audio media line could not be added to the offer
    #[error("media acquisition failed: {0}")]
    Media(String),

    /// The offer/answer exchange with the remote endpoint failed
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Socket or ICE level failure on an established session
    #[error("transport error: {0}")]
    Transport(String),

    /// A control channel payload that is JSON but not an event object
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("webrtc error: {0}")]
    Rtc(#[from] str0m::RtcError),

    /// No control channel is open to write to
    #[error("no control channel is open")]
    NotConnected,

    #[error("a session is already connecting or active")]
    AlreadyStarted,

    /// The pending start was cancelled by `stop()`
    #[error("session was stopped before it connected")]
    Stopped,

    /// The relay task has shut down and no longer accepts commands
    #[error("relay task is no longer running")]
    RelayClosed,
}
