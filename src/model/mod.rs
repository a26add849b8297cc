//! Data models for realtime sessions
//!
//! This module contains the plain data structures shared by the relay: the
//! JSON events themselves, the bounded log they are kept in, the session
//! lifecycle and recorded audio.

pub mod event;
pub mod event_log;
pub mod recording;
pub mod state;

pub use event::Event;
pub use event_log::{Direction, EventLog, LogEntry};
pub use recording::{AudioRecorder, Recording};
pub use state::SessionState;
