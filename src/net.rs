//! The `Link` abstraction: a thin sum type over a real UDP socket and an
//! in-memory fake for deterministic tests, per the source's function-pointer
//! socket-context polymorphism.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Result, TransportError};

/// Either sends a datagram to the peer or returns the next one received from it, bounded by
/// a short read timeout so update loops stay responsive (the suspension point of §5).
pub trait Link: Send + Sync {
    fn send(&self, buf: &[u8]) -> Result<usize>;
    /// Blocks up to the configured read timeout; `Ok(None)` on timeout, never an error for it.
    fn recv(&self) -> Result<Option<Vec<u8>>>;
    fn set_peer(&self, peer: SocketAddr);
}

/// A real UDP socket, connected to a single peer after the handshake binds it.
pub struct UdpLink {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
}

impl UdpLink {
    pub fn bind(bind_addr: SocketAddr, recv_timeout: Duration) -> Result<Self> {
        let domain = if bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TransportError::io_fatal(None, e))?;
        socket.set_reuse_address(true).map_err(|e| TransportError::io_fatal(None, e))?;
        socket.bind(&bind_addr.into()).map_err(|e| TransportError::io_fatal(Some(bind_addr), e))?;
        socket
            .set_read_timeout(Some(recv_timeout))
            .map_err(|e| TransportError::io_fatal(None, e))?;
        let _ = socket.set_recv_buffer_size(1024 * 1024);
        let _ = socket.set_send_buffer_size(1024 * 1024);

        Ok(UdpLink { socket: socket.into(), peer: Mutex::new(None) })
    }
}

impl Link for UdpLink {
    fn send(&self, buf: &[u8]) -> Result<usize> {
        let peer = *self.peer.lock().unwrap();
        match peer {
            Some(addr) => self.socket.send_to(buf, addr).map_err(|e| classify_send_error(addr, e)),
            None => Err(TransportError::Fatal("send before peer is bound".into())),
        }
    }

    fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; 65536];
        match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                // Handshake binds the peer implicitly: the server learns its peer from the
                // first datagram it receives.
                let mut peer = self.peer.lock().unwrap();
                if peer.is_none() {
                    *peer = Some(from);
                }
                buf.truncate(len);
                Ok(Some(buf))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                Err(TransportError::Fatal(format!("peer refused connection: {e}")))
            }
            Err(e) => Err(TransportError::Transient(format!("recv error: {e}"))),
        }
    }

    fn set_peer(&self, peer: SocketAddr) {
        *self.peer.lock().unwrap() = Some(peer);
    }
}

fn classify_send_error(peer: SocketAddr, e: io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::ConnectionRefused => TransportError::Fatal(format!("{peer} refused connection")),
        ErrorKind::WouldBlock => TransportError::ResourceExhausted(format!("send buffer full for {peer}")),
        _ => TransportError::Transient(format!("send error to {peer}: {e}")),
    }
}

/// In-memory [`Link`] used by `tests/scenarios.rs`: deterministic loss, latency, and
/// bandwidth-cap simulation without touching a real socket. Two `FakeLink`s share one
/// [`FakeNetwork`] and address each other by index (0 = server, 1 = client).
pub struct FakeLink {
    network: Arc<FakeNetwork>,
    side: usize,
}

impl FakeLink {
    pub fn new(network: Arc<FakeNetwork>, side: usize) -> Self {
        FakeLink { network, side }
    }
}

impl Link for FakeLink {
    fn send(&self, buf: &[u8]) -> Result<usize> {
        self.network.send(self.side, buf)
    }

    fn recv(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.network.recv(self.side))
    }

    fn set_peer(&self, _peer: SocketAddr) {}
}

struct InFlight {
    bytes: Vec<u8>,
    arrival: Instant,
}

/// Shared medium between two [`FakeLink`]s: independent per-packet loss probability,
/// fixed one-way latency, and optional burst-loss simulation (a run of `burst_len` drops
/// triggered every `burst_period` packets), matching scenarios S1-S4.
pub struct FakeNetwork {
    one_way_latency: Duration,
    loss_probability: f64,
    burst_len: u64,
    burst_period: u64,
    sent_counter: AtomicU64,
    queues: [Mutex<Vec<InFlight>>; 2],
    rng_state: AtomicU64,
}

impl FakeNetwork {
    pub fn new(one_way_latency: Duration, loss_probability: f64) -> Arc<Self> {
        Arc::new(FakeNetwork {
            one_way_latency,
            loss_probability,
            burst_len: 0,
            burst_period: 0,
            sent_counter: AtomicU64::new(0),
            queues: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            rng_state: AtomicU64::new(0x9E3779B97F4A7C15),
        })
    }

    pub fn with_burst_loss(one_way_latency: Duration, burst_len: u64, burst_period: u64) -> Arc<Self> {
        Arc::new(FakeNetwork {
            one_way_latency,
            loss_probability: 0.0,
            burst_len,
            burst_period,
            sent_counter: AtomicU64::new(0),
            queues: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            rng_state: AtomicU64::new(0x9E3779B97F4A7C15),
        })
    }

    fn next_rand(&self) -> f64 {
        // xorshift64*, good enough for deterministic test-only loss simulation.
        let mut x = self.rng_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state.store(x, Ordering::Relaxed);
        (x >> 11) as f64 / (1u64 << 53) as f64
    }

    fn should_drop(&self) -> bool {
        if self.burst_period > 0 {
            let n = self.sent_counter.fetch_add(1, Ordering::Relaxed);
            return (n % self.burst_period) < self.burst_len;
        }
        if self.loss_probability > 0.0 {
            return self.next_rand() < self.loss_probability;
        }
        false
    }

    fn send(&self, from: usize, buf: &[u8]) -> Result<usize> {
        if self.should_drop() {
            return Ok(buf.len());
        }
        let to = 1 - from;
        let mut queue = self.queues[to].lock().unwrap();
        queue.push(InFlight { bytes: buf.to_vec(), arrival: Instant::now() + self.one_way_latency });
        Ok(buf.len())
    }

    fn recv(&self, side: usize) -> Option<Vec<u8>> {
        let mut queue = self.queues[side].lock().unwrap();
        let now = Instant::now();
        let ready_idx = queue.iter().position(|pkt| pkt.arrival <= now)?;
        Some(queue.remove(ready_idx).bytes)
    }
}
