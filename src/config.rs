//! Protocol constants and the caller-supplied configuration.
//!
//! Concrete defaults are lifted from `protocol/whist/network/udp.c`/`udp.h`
//! in the original source tree this spec was distilled from.

use std::net::SocketAddr;
use std::time::Duration;

/// A `SEGMENT`'s envelope (AES-GCM metadata + kind tag + header + payload) must fit in one
/// UDP datagram below the path MTU. 1200 bytes keeps us under the common 1280-1500 byte MTU
/// range after IP/UDP/AES-GCM overhead.
pub const MAX_SEGMENT_SIZE: usize = 1200;

/// Ceiling on `segment_count` to reject impossible segment geometry outright.
pub const MAX_TOTAL_PACKETS: usize = 4096;

/// Hard ceiling on the parity fraction of a FEC-protected frame.
pub const MAX_FEC_RATIO: f64 = 0.5;

/// Size, in frame slots, of the ring reassembler and NACK buffer (per stream).
pub const DEFAULT_RING_BUFFER_SIZE: usize = 64;

/// Maximum retained segments per NACK-buffer frame slot.
pub const DEFAULT_MAX_INDICES: usize = 256;

/// Size of the congestion controller's group-stats circular array.
pub const MAX_GROUP_STATS: usize = 8;

pub const PING_INTERVAL_MS: u64 = 500;
pub const PONG_TIMEOUT_MS: u64 = 5000;
/// RTT EWMA smoothing constant.
pub const PING_LAMBDA: f64 = 0.6;

pub const CONNECTION_ATTEMPT_INTERVAL_MS: u64 = 5;
pub const NUM_CONFIRMATION_MESSAGES: usize = 10;

/// Retries before a segment is dropped on persistent `ENOBUFS`-class exhaustion.
pub const RETRIES_ON_BUFFER_FULL: usize = 5;

/// Token-bucket credit window for the Throttler.
pub const THROTTLER_BUCKET_MS: f64 = 5.0;

/// Sliding window used by the incoming-bitrate estimator.
pub const INCOMING_BITRATE_WINDOW_MS: u64 = 256;
pub const INCOMING_BITRATE_NUM_BUCKETS: u64 = 16;
pub const DURATION_PER_BUCKET_MS: u64 = INCOMING_BITRATE_WINDOW_MS / INCOMING_BITRATE_NUM_BUCKETS;

/// Audio jumps straight to `max_id` once more than this many frames are buffered.
pub const MAX_AUDIO_FRAMES: i64 = 10;

/// Frames older than `max_id - RESET_THRESHOLD` trigger a `STREAM_RESET` request.
pub const RESET_THRESHOLD: i64 = 96;

/// Frames older than `max_id - SAFETY_MARGIN` become eligible for nack scheduling.
pub const SAFETY_MARGIN: i64 = 2;

pub const MAX_NACK_ATTEMPTS: u32 = 5;
/// Floor on the nack cooldown; the live value is derived from the current RTT estimate.
pub const MIN_NACK_COOLDOWN_MS: u64 = 10;

/// Logical stream kinds carried by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum StreamKind {
    Video = 0,
    Audio = 1,
    Message = 2,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Video, StreamKind::Audio, StreamKind::Message];

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(StreamKind::Video),
            1 => Some(StreamKind::Audio),
            2 => Some(StreamKind::Message),
            _ => None,
        }
    }

    /// Only video and audio streams have a ring reassembler / nack buffer; message streams
    /// use a single-slot pending buffer and never split.
    pub fn is_segmented(self) -> bool {
        !matches!(self, StreamKind::Message)
    }
}

/// Recommended bandwidth and FEC settings, produced by the receiver's congestion controller
/// and obeyed by the sender's Segmenter/Throttler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSettings {
    pub bitrate_bps: u64,
    pub burst_bitrate_bps: u64,
    pub audio_fec_ratio: f64,
    pub video_fec_ratio: f64,
}

impl NetworkSettings {
    pub const fn default_const() -> Self {
        NetworkSettings {
            bitrate_bps: 10_000_000,
            burst_bitrate_bps: 12_000_000,
            audio_fec_ratio: 0.0,
            video_fec_ratio: 0.0,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self::default_const()
    }
}

/// Top-level configuration used to create a [`crate::Transport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local address to bind the UDP socket to.
    pub bind_addr: SocketAddr,
    /// Peer to connect to. `None` on the server side: it waits for a `CONNECTION_ATTEMPT`
    /// from any peer and binds to whoever shows up first.
    pub peer_addr: Option<SocketAddr>,
    /// 128-bit AES key, exchanged out of band.
    pub aes_key: [u8; 16],
    /// Timeout applied to each blocking `recv_from` call.
    pub recv_timeout: Duration,
    /// Overall budget for handshake completion.
    pub connect_timeout: Duration,
    pub is_server: bool,
    pub initial_network_settings: NetworkSettings,
}

impl TransportConfig {
    pub fn new(bind_addr: SocketAddr, aes_key: [u8; 16], is_server: bool) -> Self {
        Self {
            bind_addr,
            peer_addr: None,
            aes_key,
            recv_timeout: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(10),
            is_server,
            initial_network_settings: NetworkSettings::default(),
        }
    }
}

/// Per-stream registration for the sender-side NACK buffer.
#[derive(Debug, Clone, Copy)]
pub struct NackBufferConfig {
    pub max_frame_size: usize,
    pub num_buffers: usize,
}

impl Default for NackBufferConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 2 * 1024 * 1024,
            num_buffers: DEFAULT_RING_BUFFER_SIZE,
        }
    }
}

/// Per-stream registration for the receiver-side ring reassembler.
#[derive(Debug, Clone, Copy)]
pub struct RingBufferConfig {
    pub max_frame_size: usize,
    pub num_buffers: usize,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 2 * 1024 * 1024,
            num_buffers: DEFAULT_RING_BUFFER_SIZE,
        }
    }
}
