//! Session state and event dispatch
//!
//! [`Session`] is the one place where session state changes. Commands from
//! the caller (`send`, `stop`, ...) and callbacks from the transport
//! ([`TransportEvent`]) both land here, so the event log, the lifecycle state
//! and the recorder are only ever touched by a single owner.

use str0m::media::{MediaKind, Mid};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::model::{
    AudioRecorder, Direction, Event, EventLog, LogEntry, Recording, SessionState,
};

/// Anything JSON events can be written to.
pub trait ControlChannel {
    fn send_text(&mut self, payload: &str) -> Result<()>;
}

/// What the transport reports back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The control channel finished opening
    ChannelOpen(String),
    /// A message arrived on the control channel
    ChannelData(Vec<u8>),
    /// The remote side closed the control channel
    ChannelClose,
    /// Socket level failure that did not kill the connection
    Error(String),
    /// The remote side added a media track
    RemoteTrack(Mid, MediaKind),
    /// A payload on the negotiated audio track
    Audio(Vec<u8>),
    /// The peer connection is gone
    Disconnected,
}

/// Pushed to subscribers whenever something visible changes.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayUpdate {
    StateChanged(SessionState),
    Logged(LogEntry),
    LogCleared,
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    log: EventLog,
    audio_enabled: bool,
    recorder: Option<AudioRecorder>,
    state_tx: watch::Sender<SessionState>,
    updates: broadcast::Sender<RelayUpdate>,
}

impl Session {
    pub fn new(
        config: &RelayConfig,
        state_tx: watch::Sender<SessionState>,
        updates: broadcast::Sender<RelayUpdate>,
    ) -> Session {
        Self {
            state: SessionState::Inactive,
            log: EventLog::with_capacity(config.log_capacity),
            audio_enabled: config.audio_enabled,
            recorder: None,
            state_tx,
            updates,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn events(&self) -> Vec<LogEntry> {
        self.log.snapshot()
    }

    /// Moves to `Connecting`. Fails if a session is already under way.
    pub fn begin_connecting(&mut self) -> Result<()> {
        if !self.state.can_start() {
            return Err(RelayError::AlreadyStarted);
        }
        if self.audio_enabled {
            self.recorder = Some(AudioRecorder::start());
        }
        self.set_state(SessionState::Connecting);
        Ok(())
    }

    /// Setup failed before the channel opened.
    pub fn connect_failed(&mut self, e: &RelayError) {
        error!("Session setup failed: {}", e);
        self.recorder = None;
        self.set_state(SessionState::Inactive);
    }

    /// Resets to `Inactive` and closes the remote audio sink, returning what
    /// it collected. Safe to call at any time.
    pub fn stop(&mut self) -> Option<Recording> {
        let recording = self.recorder.take().map(AudioRecorder::stop);
        if let Some(r) = &recording {
            info!(
                "🔈 Remote audio sink closed: {} chunks, {} bytes",
                r.chunks.len(),
                r.len_bytes()
            );
        }
        self.set_state(SessionState::Inactive);
        recording
    }

    /// Stamps, writes and logs one client event.
    ///
    /// Without an open channel nothing is written or logged. A write failure
    /// on an open channel is logged but the event still enters the log.
    pub fn send(
        &mut self,
        channel: Option<&mut (dyn ControlChannel + '_)>,
        mut event: Event,
    ) -> Result<Event> {
        let channel = match channel {
            Some(c) if self.state == SessionState::Active => c,
            _ => {
                error!(
                    "Failed to send message - no data channel available: {}",
                    event
                );
                return Err(RelayError::NotConnected);
            }
        };

        event.ensure_event_id();
        match event.to_wire() {
            Ok(payload) => {
                if let Err(e) = channel.send_text(&payload) {
                    error!("Error sending message {}: {}", event, e);
                }
            }
            Err(e) => error!("Error serializing message {}: {}", event, e),
        }

        debug!("📤 Sent {}", event);
        self.push(LogEntry::new(Direction::Client, event.clone()));
        Ok(event)
    }

    /// A user text item followed by a response trigger.
    pub fn send_text(
        &mut self,
        mut channel: Option<&mut (dyn ControlChannel + '_)>,
        text: &str,
    ) -> Result<()> {
        self.send(
            channel.as_deref_mut(),
            Event::conversation_item_create(text),
        )?;
        self.send(channel, Event::response_create())?;
        Ok(())
    }

    /// Parses and logs one inbound message. Malformed payloads are dropped.
    pub fn receive(&mut self, data: &[u8]) {
        match Event::parse(data) {
            Ok(event) => {
                debug!("📥 Received {}", event);
                self.push(LogEntry::new(Direction::Server, event));
            }
            Err(e) => error!(
                "Error parsing data channel message: {}: {}",
                e,
                String::from_utf8_lossy(data)
            ),
        }
    }

    /// Single dispatch point for everything the transport reports.
    pub fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ChannelOpen(label) if self.state != SessionState::Connecting => {
                warn!("Ignoring data channel '{}' opening while {}", label, self.state);
            }
            TransportEvent::ChannelOpen(label) => {
                info!("🎉 Data channel '{}' is open", label);
                self.log.clear();
                let _ = self.updates.send(RelayUpdate::LogCleared);
                self.set_state(SessionState::Active);
            }
            TransportEvent::ChannelData(data) => self.receive(&data),
            TransportEvent::ChannelClose => {
                info!("Data channel closed by remote");
                if self.state == SessionState::Active {
                    self.set_state(SessionState::Closed);
                }
            }
            TransportEvent::Error(e) => error!("Data channel error: {}", e),
            TransportEvent::RemoteTrack(mid, kind) => {
                if self.audio_enabled {
                    info!("Received remote {:?} track {:?}", kind, mid);
                } else {
                    debug!(
                        "Received remote {:?} track {:?} (audio disabled, not playing)",
                        kind, mid
                    );
                }
            }
            TransportEvent::Audio(data) => {
                if let Some(recorder) = self.recorder.as_mut() {
                    recorder.push(&data);
                }
            }
            TransportEvent::Disconnected => match self.state {
                SessionState::Connecting => {
                    warn!("Transport closed before the data channel opened");
                    self.recorder = None;
                    self.set_state(SessionState::Inactive);
                }
                SessionState::Active => {
                    warn!("Transport disconnected");
                    self.set_state(SessionState::Closed);
                }
                SessionState::Inactive | SessionState::Closed => {}
            },
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.log.push(entry.clone());
        let _ = self.updates.send(RelayUpdate::Logged(entry));
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        info!("Session {} -> {}", self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
        let _ = self.updates.send(RelayUpdate::StateChanged(state));
    }
}
