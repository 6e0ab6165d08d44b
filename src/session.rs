//! Handshake, AES key binding, per-connection liveness (§4.1).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::TransportConfig;
use crate::crypto::Cipher;
use crate::error::{Result, TransportError};
use crate::net::Link;
use crate::wire::{Envelope, Packet};

fn now_us(epoch: Instant) -> u64 {
    epoch.elapsed().as_micros() as u64
}

/// Timestamps guarded together (the "timestamp mutex" of §5): read by the latency exporter,
/// written by the ping sender and the pong handler.
#[derive(Debug, Clone, Copy, Default)]
struct PingTimestamps {
    last_ping_id: u32,
    last_ping_sent_us: u64,
    last_pong_received_us: u64,
    last_ping_client_time_us: u64,
    last_ping_server_time_us: u64,
}

/// Per-connection state shared by the sender and receiver threads.
pub struct Session {
    epoch: Instant,
    pub cipher: Cipher,
    pub link: Arc<dyn Link>,
    pub is_server: bool,
    pub connection_lost: AtomicBool,
    timestamps: Mutex<PingTimestamps>,
    rtt_us: Mutex<f64>,
    pong_timeout: Duration,
    ping_interval: Duration,
}

impl Session {
    pub fn new(config: &TransportConfig, link: Arc<dyn Link>) -> Self {
        Session {
            epoch: Instant::now(),
            cipher: Cipher::new(&config.aes_key),
            link,
            is_server: config.is_server,
            connection_lost: AtomicBool::new(false),
            timestamps: Mutex::new(PingTimestamps::default()),
            rtt_us: Mutex::new(0.0),
            pong_timeout: Duration::from_millis(crate::config::PONG_TIMEOUT_MS),
            ping_interval: Duration::from_millis(crate::config::PING_INTERVAL_MS),
        }
    }

    pub fn now_us(&self) -> u64 {
        now_us(self.epoch)
    }

    pub fn is_connection_lost(&self) -> bool {
        self.connection_lost.load(Ordering::Acquire)
    }

    fn latch_fatal(&self, reason: &str) -> TransportError {
        self.connection_lost.store(true, Ordering::Release);
        TransportError::Fatal(reason.to_string())
    }

    pub fn guard(&self) -> Result<()> {
        if self.is_connection_lost() {
            return Err(TransportError::Fatal("connection_lost is set".into()));
        }
        Ok(())
    }

    fn seal_and_send(&self, packet: &Packet) -> Result<()> {
        let plaintext = packet.encode()?;
        let envelope = Envelope::seal(&self.cipher, &plaintext)?;
        self.link.send(envelope.as_bytes())?;
        Ok(())
    }

    /// Server side: block (with the link's recv timeout) until a `CONNECTION_ATTEMPT` arrives
    /// from some peer, then reply with `NUM_CONFIRMATION_MESSAGES` copies of
    /// `CONNECTION_CONFIRMATION`.
    pub fn handshake_server(&self, connect_timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + connect_timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(TransportError::Fatal("handshake timed out waiting for CONNECTION_ATTEMPT".into()));
            }
            let datagram = match self.link.recv()? {
                Some(d) => d,
                None => continue,
            };
            let plaintext = match Envelope::open(&self.cipher, &datagram) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if let Ok(Packet::ConnectionAttempt) = Packet::decode(&plaintext) {
                for _ in 0..crate::config::NUM_CONFIRMATION_MESSAGES {
                    self.seal_and_send(&Packet::ConnectionConfirmation)?;
                }
                return Ok(());
            }
        }
    }

    /// Client side: send `CONNECTION_ATTEMPT` every `CONNECTION_ATTEMPT_INTERVAL_MS` until a
    /// `CONNECTION_CONFIRMATION` arrives or the budget elapses.
    pub fn handshake_client(&self, connect_timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + connect_timeout;
        let retry_interval = Duration::from_millis(crate::config::CONNECTION_ATTEMPT_INTERVAL_MS);
        let mut next_send = Instant::now();

        loop {
            if Instant::now() >= deadline {
                return Err(TransportError::Fatal("handshake timed out waiting for CONNECTION_CONFIRMATION".into()));
            }
            if Instant::now() >= next_send {
                self.seal_and_send(&Packet::ConnectionAttempt)?;
                next_send = Instant::now() + retry_interval;
            }
            let datagram = match self.link.recv()? {
                Some(d) => d,
                None => continue,
            };
            let plaintext = match Envelope::open(&self.cipher, &datagram) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if let Ok(Packet::ConnectionConfirmation) = Packet::decode(&plaintext) {
                return Ok(());
            }
        }
    }

    /// Called periodically by the client's update loop.
    pub fn maybe_send_ping(&self) -> Result<()> {
        self.guard()?;
        let mut ts = self.timestamps.lock();
        let elapsed = now_us(self.epoch).saturating_sub(ts.last_ping_sent_us);
        if ts.last_ping_sent_us != 0 && elapsed < self.ping_interval.as_micros() as u64 {
            return Ok(());
        }
        let id = ts.last_ping_id.wrapping_add(1);
        let send_time = now_us(self.epoch);
        ts.last_ping_id = id;
        ts.last_ping_sent_us = send_time;
        drop(ts);
        self.seal_and_send(&Packet::Ping(crate::wire::packet::Ping { id, send_timestamp_us: send_time }))
    }

    /// Called periodically by the client's update loop: fails the connection if no pong has
    /// arrived within `PONG_TIMEOUT_MS` of the last ping.
    pub fn check_pong_timeout(&self) -> Result<()> {
        let ts = *self.timestamps.lock();
        if ts.last_ping_sent_us == 0 {
            return Ok(());
        }
        let since_ping = now_us(self.epoch).saturating_sub(ts.last_ping_sent_us);
        let since_pong = now_us(self.epoch).saturating_sub(ts.last_pong_received_us);
        if since_ping > self.pong_timeout.as_micros() as u64 && since_pong > self.pong_timeout.as_micros() as u64 {
            return Err(self.latch_fatal("pong timeout"));
        }
        Ok(())
    }

    /// Responder (server) side: answer a `PING` with a `PONG`, recording timestamps for the
    /// latency exporter.
    pub fn handle_ping(&self, ping: crate::wire::packet::Ping) -> Result<()> {
        let mut ts = self.timestamps.lock();
        ts.last_ping_client_time_us = ping.send_timestamp_us;
        ts.last_ping_server_time_us = now_us(self.epoch);
        drop(ts);
        self.seal_and_send(&Packet::Pong(crate::wire::packet::Pong {
            id: ping.id,
            ping_send_timestamp_us: ping.send_timestamp_us,
        }))
    }

    /// Initiator (client) side: update the RTT EWMA and reset the pong-timeout clock.
    pub fn handle_pong(&self, pong: crate::wire::packet::Pong) {
        let now = now_us(self.epoch);
        let mut ts = self.timestamps.lock();
        ts.last_pong_received_us = now;
        if pong.id != ts.last_ping_id {
            return;
        }
        let sample_us = now.saturating_sub(pong.ping_send_timestamp_us) as f64;
        drop(ts);

        let mut rtt = self.rtt_us.lock();
        *rtt = if *rtt == 0.0 {
            sample_us
        } else {
            crate::config::PING_LAMBDA * *rtt + (1.0 - crate::config::PING_LAMBDA) * sample_us
        };
    }

    pub fn rtt_us(&self) -> f64 {
        *self.rtt_us.lock()
    }

    /// Server-side: estimated instant of the client-side event currently being responded to.
    pub fn client_input_timestamp(&self) -> u64 {
        let ts = *self.timestamps.lock();
        let now = now_us(self.epoch);
        ts.last_ping_client_time_us + now.saturating_sub(ts.last_ping_server_time_us)
    }

    pub fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.guard()?;
        self.seal_and_send(packet)
    }

    pub fn recv_datagram(&self) -> Result<Option<Vec<u8>>> {
        self.guard()?;
        self.link.recv()
    }

    pub fn open_envelope(&self, datagram: &[u8]) -> Result<Vec<u8>> {
        Envelope::open(&self.cipher, datagram)
    }
}
