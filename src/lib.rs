//! rstream-transport: reliable-over-UDP media transport.
//!
//! A single-connection, encrypted datagram protocol carrying segmented application frames
//! with forward error correction, selective retransmission, bandwidth-adaptive congestion
//! control, ping/pong liveness, and ring-buffered reassembly with stream-reset escalation.
//! `Transport` is the facade both endpoints instantiate symmetrically.

pub mod config;
pub mod congestion;
pub mod crypto;
pub mod error;
pub mod fec;
pub mod gf256;
pub mod nack_buffer;
pub mod net;
pub mod receiver;
pub mod ring_buffer;
pub mod segment;
pub mod sender;
pub mod session;
pub mod throttle;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

pub use config::{NackBufferConfig, NetworkSettings, RingBufferConfig, StreamKind, TransportConfig};
pub use error::{Result, TransportError};
pub use ring_buffer::Frame;

use net::{Link, UdpLink};
use nack_buffer::NackBuffer;
use receiver::{Dispatched, Receiver};
use ring_buffer::RingBuffer;
use sender::Sender;
use session::Session;

/// The reliable-over-UDP media transport. Both endpoints of a session instantiate one of
/// these; the API is the same on either side (§6).
pub struct Transport {
    session: Arc<Session>,
    sender: Sender,
    receiver: Receiver,
    recv_timeout: Duration,
}

impl Transport {
    /// Bind a socket, run the handshake (blocking up to `config.connect_timeout`), and return
    /// a ready-to-use transport. Callers must still [`Transport::register_nack_buffer`] /
    /// [`Transport::register_ring_buffer`] for every stream they intend to use.
    pub fn create(config: TransportConfig) -> Result<Self> {
        let link = Arc::new(UdpLink::bind(config.bind_addr, config.recv_timeout)?);
        if let Some(peer) = config.peer_addr {
            link.set_peer(peer);
        }
        Self::create_with_link(config, link)
    }

    /// Same as [`Transport::create`] but over a caller-supplied [`Link`] (the `FakeUDP` of §9,
    /// used by the test scenarios in `tests/scenarios.rs`).
    pub fn create_with_link(config: TransportConfig, link: Arc<dyn Link>) -> Result<Self> {
        let session = Arc::new(Session::new(&config, link));

        if config.is_server {
            session.handshake_server(config.connect_timeout)?;
            debug!("handshake complete (server)");
        } else {
            session.handshake_client(config.connect_timeout)?;
            debug!("handshake complete (client)");
        }

        Ok(Transport {
            session,
            sender: Sender::new(config.initial_network_settings.burst_bitrate_bps),
            receiver: Receiver::new(config.initial_network_settings),
            recv_timeout: config.recv_timeout,
        })
    }

    /// Register a sender-side NACK buffer for `stream`, required before any `send_frame` on
    /// a stream whose frames may span more than one segment.
    pub fn register_nack_buffer(&self, stream: StreamKind, config: NackBufferConfig) {
        self.sender.register_stream(stream, NackBuffer::new(config));
    }

    /// Register a receiver-side ring reassembler for `stream`.
    pub fn register_ring_buffer(&self, stream: StreamKind, config: RingBufferConfig) {
        self.receiver.register_stream(stream, RingBuffer::new(stream, config));
    }

    /// Same as [`Transport::register_ring_buffer`] but with a caller-supplied recovery-point
    /// predicate for the render-pointer catch-up policy (§4.4, §9 Open Questions) — the exact
    /// set of recovery-point frame types is defined by the codec adapter, not hard-coded here.
    pub fn register_ring_buffer_with_recovery_predicate(
        &self,
        stream: StreamKind,
        config: RingBufferConfig,
        predicate: Box<dyn Fn(&[u8]) -> bool + Send + Sync>,
    ) {
        self.receiver.register_stream(stream, RingBuffer::with_recovery_predicate(stream, config, predicate));
    }

    /// Segment, retain, pace, encrypt, and send one application frame. `is_recovery_point`
    /// clears any pending server-side recovery request for this stream.
    pub fn send_frame(&self, stream: StreamKind, payload: &[u8], frame_id: u32, is_recovery_point: bool) -> Result<()> {
        self.session.guard()?;
        self.sender.send_frame(&self.session, stream, frame_id, payload)?;
        if is_recovery_point {
            self.receiver.clear_recovery_requested(stream);
        }
        Ok(())
    }

    /// Drain all currently-available datagrams, run liveness/nack-scheduling housekeeping, and
    /// return `false` once the connection is lost. The only three suspension points are the
    /// link's bounded recv, the throttler's wait (inside `send_frame`), and this method's own
    /// bounded loop (§5).
    pub fn poll(&self) -> bool {
        if self.session.is_connection_lost() {
            return false;
        }

        let deadline = std::time::Instant::now() + self.recv_timeout;
        loop {
            match self.session.recv_datagram() {
                Ok(Some(datagram)) => {
                    if let Err(e) = self.handle_datagram(&datagram) {
                        warn!("dropping datagram: {e}");
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    warn!("fatal transport error: {e}");
                    return false;
                }
                Err(e) => {
                    warn!("recv error: {e}");
                    break;
                }
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
        }

        if !self.session.is_server {
            if let Err(e) = self.session.maybe_send_ping() {
                warn!("ping send failed: {e}");
            }
            if let Err(e) = self.session.check_pong_timeout() {
                warn!("connection lost: {e}");
                return false;
            }
        }

        self.run_nack_housekeeping();
        !self.session.is_connection_lost()
    }

    fn handle_datagram(&self, datagram: &[u8]) -> Result<()> {
        let plaintext = match self.session.open_envelope(datagram) {
            Ok(p) => p,
            Err(e) => {
                warn!("envelope open failed: {e}");
                return Ok(()); // decrypt failure is a warning, not fatal (§4.8)
            }
        };

        match self.receiver.dispatch(&self.session, &plaintext)? {
            Dispatched::Nack { stream, frame_id, segment_index } => {
                self.sender.request_resend(stream, frame_id, segment_index);
            }
            Dispatched::BitarrayNack { stream, frame_id, indices } => {
                self.sender.request_resend_many(stream, frame_id, &indices);
            }
            Dispatched::NetworkSettingsChanged(settings) => {
                // Our own congestion controller just derived this from an arriving segment, so
                // we are the receiving end of that stream; tell the peer, which is the sender.
                self.session.send_packet(&wire::Packet::NetworkSettings(settings))?;
            }
            Dispatched::NetworkSettingsReceived(settings) => {
                // The peer computed this and sent it to us; apply it to our own Sender and stop
                // here (forwarding it back would just echo it forever).
                self.sender.set_burst_bitrate(settings.burst_bitrate_bps);
                self.sender.set_fec_ratio(StreamKind::Video, settings.video_fec_ratio);
                self.sender.set_fec_ratio(StreamKind::Audio, settings.audio_fec_ratio);
            }
            Dispatched::Segment { .. } | Dispatched::Nothing => {}
        }
        Ok(())
    }

    fn run_nack_housekeeping(&self) {
        let rtt_us = self.session.rtt_us();
        for &stream in StreamKind::ALL.iter() {
            let mut nacks = Vec::new();
            self.receiver.ring_for(stream, |ring| nacks = ring.schedule_nacks(rtt_us));
            for nack in nacks {
                match nack {
                    ring_buffer::PendingNack::Single { frame_id, segment_index } => {
                        self.sender.request_resend(stream, frame_id, segment_index);
                    }
                    ring_buffer::PendingNack::Many { frame_id, start_index, indices_mask } => {
                        let indices: Vec<u16> = (0..64)
                            .filter(|bit| indices_mask & (1 << bit) != 0)
                            .map(|bit| start_index + bit as u16)
                            .collect();
                        self.sender.request_resend_many(stream, frame_id, &indices);
                    }
                }
            }
            if let Err(e) = self.sender.drain_nacks(&self.session, stream) {
                warn!("nack drain failed for {stream:?}: {e}");
            }
        }
    }

    /// Proactively schedule a duplicate resend of an already-sent segment, with no NACK from
    /// the peer (§4.7). Drained on the next nack pass like any other resend; its count is
    /// folded into the next frame's `prev_frame_duplicate_count`.
    pub fn send_duplicate(&self, stream: StreamKind, frame_id: u32, segment_index: u16) {
        self.sender.request_duplicate(stream, frame_id, segment_index);
    }

    /// Nonblocking pull of the next frame for `stream`, applying the stream-kind-specific
    /// catch-up policy (§4.4).
    pub fn next_frame(&self, stream: StreamKind) -> Option<Frame> {
        let mut frame = None;
        self.receiver.ring_for(stream, |ring| frame = ring.next_frame());
        frame
    }

    pub fn pending_stream_reset(&self, stream: StreamKind) -> Option<i32> {
        self.receiver.pending_stream_reset(stream)
    }

    /// Whether the peer has asked (via `STREAM_RESET`) that our next frame on `stream` be a
    /// recovery point.
    pub fn recovery_requested(&self, stream: StreamKind) -> bool {
        self.receiver.recovery_requested(stream)
    }

    pub fn current_network_settings(&self) -> NetworkSettings {
        self.receiver.current_network_settings()
    }

    /// Directly set a stream's FEC ratio, bypassing the congestion controller. Used by tests
    /// and by applications that want to force FEC on for a known-lossy link rather than
    /// waiting for `NETWORK_SETTINGS` to converge.
    pub fn set_fec_ratio(&self, stream: StreamKind, ratio: f64) {
        self.sender.set_fec_ratio(stream, ratio);
    }

    /// Server-only: estimated instant of the client-side event currently being responded to.
    pub fn client_input_timestamp(&self) -> u64 {
        self.session.client_input_timestamp()
    }

    pub fn is_connection_lost(&self) -> bool {
        self.session.is_connection_lost()
    }
}
