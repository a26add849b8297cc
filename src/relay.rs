//! The session relay task
//!
//! [`SessionRelay`] is a single task that owns the [`Session`] and the
//! [`PeerConnection`]. Everything else talks to it through a [`RelayHandle`],
//! which only sends commands and reads the mirrored state. The task's loop
//! multiplexes four inputs: commands, the pending `start()`, UDP datagrams
//! and the `str0m` timeout.

use std::time::{Duration, Instant};

use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::{JoinError, JoinHandle},
};
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::model::{Event, LogEntry, Recording, SessionState};
use crate::peer::PeerConnection;
use crate::session::{ControlChannel, RelayUpdate, Session, TransportEvent};

/// How long the loop sleeps when there is no peer to drive.
const IDLE_TICK: Duration = Duration::from_millis(100);

const UPDATE_BUFFER: usize = 256;

enum Command {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Option<Recording>>),
    Send(Event),
    SendText(String),
    Events(oneshot::Sender<Vec<LogEntry>>),
}

/// A `start()` that is still fetching credentials or negotiating.
struct Connecting {
    task: JoinHandle<Result<PeerConnection>>,
    reply: oneshot::Sender<Result<()>>,
}

/// Cloneable handle to a running [`SessionRelay`].
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    updates: broadcast::Sender<RelayUpdate>,
}

impl RelayHandle {
    /// Opens a session. Resolves once the answer SDP has been accepted; the
    /// state turns `Active` later, when the control channel opens.
    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Start(tx))?;
        rx.await.map_err(|_| RelayError::RelayClosed)?
    }

    /// Tears the session down, returning the remote audio if audio was enabled.
    pub async fn stop(&self) -> Result<Option<Recording>> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Stop(tx))?;
        rx.await.map_err(|_| RelayError::RelayClosed)
    }

    /// Queues an event for the control channel. Delivery problems are
    /// logged by the relay, not returned here.
    pub fn send(&self, event: Event) -> Result<()> {
        self.command(Command::Send(event))
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.command(Command::SendText(text.into()))
    }

    /// The event log, newest first.
    pub async fn events(&self) -> Result<Vec<LogEntry>> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Events(tx))?;
        rx.await.map_err(|_| RelayError::RelayClosed)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Resolves once the session reaches `target`.
    pub async fn wait_for_state(&self, target: SessionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map_err(|_| RelayError::RelayClosed)?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayUpdate> {
        self.updates.subscribe()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| RelayError::RelayClosed)
    }
}

pub struct SessionRelay {
    config: RelayConfig,
    http: reqwest::Client,
    session: Session,
    peer: Option<PeerConnection>,
    connecting: Option<Connecting>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl SessionRelay {
    /// Spawns the relay on the current tokio runtime.
    pub fn spawn(config: RelayConfig) -> RelayHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Inactive);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);

        let relay = SessionRelay {
            session: Session::new(&config, state_tx, updates.clone()),
            config,
            http: reqwest::Client::new(),
            peer: None,
            connecting: None,
            commands: commands_rx,
        };
        tokio::spawn(relay.run());

        RelayHandle {
            commands: commands_tx,
            state: state_rx,
            updates,
        }
    }

    async fn run(mut self) {
        let mut timeout = Instant::now() + IDLE_TICK;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All relay handles dropped, shutting down");
                        let _ = self.stop();
                        return;
                    }
                },
                result = wait_connecting(&mut self.connecting) => self.finish_connecting(result),
                received = recv_datagram(&mut self.peer) => match received {
                    Ok((n, source)) => {
                        if let Some(peer) = self.peer.as_mut() {
                            peer.handle_datagram(n, source);
                        }
                    }
                    Err(e) => self
                        .session
                        .handle_transport(TransportEvent::Error(format!("socket read: {e}"))),
                },
                _ = tokio::time::sleep_until(timeout.into()) => {
                    if let Some(peer) = self.peer.as_mut() {
                        peer.handle_timeout();
                    }
                }
            }

            timeout = self.drive_peer().await;
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                if let Err(e) = self.session.begin_connecting() {
                    let _ = reply.send(Err(e));
                    return;
                }
                // A closed session may still hold its old transport.
                if let Some(mut old) = self.peer.take() {
                    old.close();
                }
                info!("Starting session against {}", self.config.realtime_url);
                let task = tokio::spawn(PeerConnection::establish(
                    self.config.clone(),
                    self.http.clone(),
                ));
                self.connecting = Some(Connecting { task, reply });
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.stop());
            }
            Command::Send(event) => {
                let mut channel = self.peer.as_mut().and_then(|p| p.channel());
                let channel = channel.as_mut().map(|c| c as &mut dyn ControlChannel);
                if let Err(e) = self.session.send(channel, event) {
                    debug!("Event dropped: {}", e);
                }
            }
            Command::SendText(text) => {
                let mut channel = self.peer.as_mut().and_then(|p| p.channel());
                let channel = channel.as_mut().map(|c| c as &mut dyn ControlChannel);
                if let Err(e) = self.session.send_text(channel, &text) {
                    debug!("Text message dropped: {}", e);
                }
            }
            Command::Events(reply) => {
                let _ = reply.send(self.session.events());
            }
        }
    }

    fn finish_connecting(&mut self, result: std::result::Result<Result<PeerConnection>, JoinError>) {
        let Some(connecting) = self.connecting.take() else {
            return;
        };

        let outcome = match result {
            Ok(Ok(peer)) => {
                self.peer = Some(peer);
                Ok(())
            }
            Ok(Err(e)) => {
                self.session.connect_failed(&e);
                Err(e)
            }
            Err(e) => {
                let e = RelayError::Transport(format!("setup task failed: {e}"));
                self.session.connect_failed(&e);
                Err(e)
            }
        };

        let _ = connecting.reply.send(outcome);
    }

    /// Polls the peer until it wants a timeout and dispatches what it reported.
    async fn drive_peer(&mut self) -> Instant {
        let Some(peer) = self.peer.as_mut() else {
            return Instant::now() + IDLE_TICK;
        };

        let mut events = vec![];
        let timeout = peer.poll_until_timeout(&mut events).await;

        let mut disconnected = false;
        for event in events {
            disconnected |= event == TransportEvent::Disconnected;
            self.session.handle_transport(event);
        }
        if disconnected {
            self.peer = None;
            return Instant::now() + IDLE_TICK;
        }

        timeout
    }

    fn stop(&mut self) -> Option<Recording> {
        if let Some(connecting) = self.connecting.take() {
            info!("Aborting session setup");
            connecting.task.abort();
            let _ = connecting.reply.send(Err(RelayError::Stopped));
        }
        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
        self.session.stop()
    }
}

async fn wait_connecting(
    connecting: &mut Option<Connecting>,
) -> std::result::Result<Result<PeerConnection>, JoinError> {
    match connecting {
        Some(c) => (&mut c.task).await,
        None => std::future::pending().await,
    }
}

async fn recv_datagram(
    peer: &mut Option<PeerConnection>,
) -> std::io::Result<(usize, std::net::SocketAddr)> {
    match peer {
        Some(p) => p.recv().await,
        None => std::future::pending().await,
    }
}
