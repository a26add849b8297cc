//! WebRTC peer connection
//!
//! This module owns the `str0m` state machine and the UDP socket it talks
//! through. [`PeerConnection::establish`] runs the whole setup sequence:
//!
//! 1. Fetches an ephemeral credential from the token endpoint
//! 2. Binds a UDP socket and adds a host ICE candidate for it
//! 3. Adds the (muted) local audio line and the control data channel
//! 4. Posts the offer to the realtime endpoint and accepts the answer
//!
//! After that the relay drives it: datagrams and timeouts go in, transmits go
//! out on the socket, and anything the session cares about comes back as a
//! [`TransportEvent`].

use std::{
    io,
    net::{IpAddr, SocketAddr},
    time::Instant,
};

use str0m::{
    change::SdpAnswer,
    channel::{Channel, ChannelId},
    media::{Direction, MediaKind, Mid},
    net::{Protocol, Receive},
    Candidate, Event, IceConnectionState, Input, Output, Rtc,
};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::session::{ControlChannel, TransportEvent};
use crate::signaling::{exchange_sdp, fetch_credential};
use crate::util::host_address;

const DATAGRAM_SIZE: usize = 2000;

pub struct PeerConnection {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    channel_id: ChannelId,
    audio_mid: Mid,
    buf: Vec<u8>,
}

impl PeerConnection {
    /// Runs credential fetch, media setup and offer/answer in order.
    ///
    /// Takes owned arguments so it can run as its own task while the relay
    /// keeps serving commands.
    pub async fn establish(config: RelayConfig, http: reqwest::Client) -> Result<PeerConnection> {
        let credential = fetch_credential(&http, &config.token_url).await?;

        let (mut rtc, socket, local_addr) = bind(host_address()).await?;

        let mut change = rtc.sdp_api();
        // The remote end expects an audio line even for text-only sessions.
        // Nothing is ever written to it unless audio is enabled.
        let audio_mid = change.add_media(MediaKind::Audio, Direction::SendRecv, None, None, None);
        let channel_id = change.add_channel(config.channel_label.clone());
        let (offer, pending) = change
            .apply()
            .ok_or_else(|| RelayError::Media("no changes to offer".to_string()))?;

        info!(
            "📝 Requested data channel '{}' ({:?}) and audio line {:?}",
            config.channel_label, channel_id, audio_mid
        );

        let answer_sdp = exchange_sdp(
            &http,
            &config.realtime_url,
            &config.model,
            &credential,
            offer.to_sdp_string(),
        )
        .await?;

        let answer = SdpAnswer::from_sdp_string(&answer_sdp)
            .map_err(|e| RelayError::Negotiation(format!("unparseable answer SDP: {e}")))?;
        rtc.sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| RelayError::Negotiation(format!("answer rejected: {e}")))?;

        info!("✅ Answer accepted, waiting for ICE and the data channel to open...");

        Ok(PeerConnection {
            rtc,
            socket,
            local_addr,
            channel_id,
            audio_mid,
            buf: vec![0; DATAGRAM_SIZE],
        })
    }

    /// The control channel, once it is open.
    pub fn channel(&mut self) -> Option<Channel<'_>> {
        self.rtc.channel(self.channel_id)
    }

    /// Waits for the next datagram. Feed it back with [`Self::handle_datagram`].
    pub async fn recv(&mut self) -> io::Result<(usize, SocketAddr)> {
        self.buf.resize(DATAGRAM_SIZE, 0);
        self.socket.recv_from(&mut self.buf).await
    }

    pub fn handle_datagram(&mut self, n: usize, source: SocketAddr) {
        // Parse data to a DatagramRecv, which help preparse network data to
        // figure out the multiplexing of all protocols on one UDP port.
        let Ok(contents) = self.buf[..n].try_into() else {
            debug!("Dropping unrecognised datagram from {}", source);
            return;
        };

        let input = Input::Receive(
            Instant::now(),
            Receive {
                proto: Protocol::Udp,
                source,
                destination: self.local_addr,
                contents,
            },
        );
        drive(&mut self.rtc, input);
    }

    /// Drive time forward.
    pub fn handle_timeout(&mut self) {
        drive(&mut self.rtc, Input::Timeout(Instant::now()));
    }

    /// Poll all output until `str0m` asks for a timeout. Transmits go out on
    /// the socket, session relevant events are collected into `events`.
    pub async fn poll_until_timeout(&mut self, events: &mut Vec<TransportEvent>) -> Instant {
        loop {
            if !self.rtc.is_alive() {
                events.push(TransportEvent::Disconnected);
                return Instant::now();
            }

            match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => return t,
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self
                        .socket
                        .send_to(&transmit.contents, transmit.destination)
                        .await
                    {
                        events.push(TransportEvent::Error(format!(
                            "sending to {}: {}",
                            transmit.destination, e
                        )));
                    }
                }
                Ok(Output::Event(event)) => {
                    if let Some(e) = self.handle_event(event) {
                        events.push(e);
                    }
                }
                Err(e) => {
                    warn!("Peer poll_output failed: {:?}", e);
                    self.rtc.disconnect();
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> Option<TransportEvent> {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("🔌 ICE Connection State: {:?}", state);
                if state == IceConnectionState::Disconnected {
                    // No ICE restart, the session has to be started again.
                    self.rtc.disconnect();
                }
                None
            }
            Event::Connected => {
                info!("DTLS connected");
                None
            }
            Event::ChannelOpen(id, label) if id == self.channel_id => {
                Some(TransportEvent::ChannelOpen(label))
            }
            Event::ChannelData(data) if data.id == self.channel_id => {
                if data.binary {
                    debug!("Binary message on control channel ({} bytes)", data.data.len());
                }
                Some(TransportEvent::ChannelData(data.data))
            }
            Event::ChannelClose(id) if id == self.channel_id => Some(TransportEvent::ChannelClose),
            Event::MediaAdded(added) => Some(TransportEvent::RemoteTrack(added.mid, added.kind)),
            Event::MediaData(data) if data.mid == self.audio_mid => {
                Some(TransportEvent::Audio(data.data))
            }
            other => {
                debug!("Event (other): {:?}", other);
                None
            }
        }
    }

    /// Closes the data channel and the transport.
    pub fn close(&mut self) {
        if self.rtc.is_alive() {
            info!("Closing peer connection");
            self.rtc.disconnect();
        }
    }
}

fn drive(rtc: &mut Rtc, input: Input) {
    if !rtc.is_alive() {
        return;
    }

    if let Err(e) = rtc.handle_input(input) {
        warn!("Peer disconnected: {:?}", e);
        rtc.disconnect();
    }
}

/// Binds a UDP socket on `host` and registers it as the only host candidate.
async fn bind(host: IpAddr) -> Result<(Rtc, UdpSocket, SocketAddr)> {
    let socket = UdpSocket::bind(SocketAddr::new(host, 0)).await?;
    let local_addr = socket.local_addr()?;
    info!("Bound UDP port: {}", local_addr);

    let mut rtc = Rtc::new();
    let candidate = Candidate::host(local_addr, Protocol::Udp)
        .map_err(|e| RelayError::Transport(format!("host candidate {local_addr}: {e}")))?;
    if rtc.add_local_candidate(candidate).is_none() {
        return Err(RelayError::Transport(format!(
            "host candidate {local_addr} was rejected"
        )));
    }

    Ok((rtc, socket, local_addr))
}

impl ControlChannel for Channel<'_> {
    fn send_text(&mut self, payload: &str) -> Result<()> {
        self.write(false, payload.as_bytes())?;
        Ok(())
    }
}
