//! Realtime session relay
//!
//! Opens a WebRTC connection to a realtime model endpoint, negotiates it with
//! an ephemeral credential and relays JSON events over the `oai-events` data
//! channel, keeping a bounded newest-first log of everything exchanged.
//!
//! ```no_run
//! # async fn demo() -> realtime_rtc::error::Result<()> {
//! use realtime_rtc::{RelayConfig, SessionRelay, SessionState};
//!
//! let relay = SessionRelay::spawn(RelayConfig::default());
//! relay.start().await?;
//! relay.wait_for_state(SessionState::Active).await?;
//! relay.send_text("Hello!")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod util;

pub use config::RelayConfig;
pub use error::RelayError;
pub use model::{Direction, Event, LogEntry, Recording, SessionState};
pub use relay::{RelayHandle, SessionRelay};
pub use session::RelayUpdate;
