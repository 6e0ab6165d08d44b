//! Receiver dispatch (§4.8): pulls one datagram at a time, decrypts, and dispatches by kind.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::{StreamKind, MAX_GROUP_STATS};
use crate::congestion::{CongestionController, GroupStats};
use crate::error::Result;
use crate::ring_buffer::RingBuffer;
use crate::session::Session;
use crate::wire::packet::{BitarrayNack, Nack, Segment, StreamReset};
use crate::wire::Packet;

/// What the Receiver wants the rest of Transport to do after dispatching one datagram.
pub enum Dispatched {
    Segment { stream: StreamKind },
    Nack { stream: StreamKind, frame_id: u32, segment_index: u16 },
    BitarrayNack { stream: StreamKind, frame_id: u32, indices: Vec<u16> },
    /// Our own congestion controller just computed new settings from an arriving segment;
    /// these must be sent to the peer (we are the receiver of this stream).
    NetworkSettingsChanged(crate::config::NetworkSettings),
    /// The peer sent us `NETWORK_SETTINGS`; apply them to our own Sender, do not forward.
    NetworkSettingsReceived(crate::config::NetworkSettings),
    Nothing,
}

/// Accumulated `(departure, arrival, bytes)` for one group_id, kept in a small circular
/// array keyed by `group_id mod MAX_GROUP_STATS` (mirrors `CongestionController`'s own
/// group history) rather than an unbounded map.
#[derive(Debug, Clone, Copy)]
struct GroupAccum {
    group_id: u32,
    departure_time_us: u64,
    arrival_time_us: u64,
    bytes: u64,
}

struct StreamState {
    ring: RingBuffer,
    last_group_id: Option<u32>,
    group_stats: [Option<GroupAccum>; MAX_GROUP_STATS],
}

pub struct Receiver {
    streams: Mutex<HashMap<StreamKind, StreamState>>,
    congestion: Mutex<CongestionController>,
    message_pending: Mutex<Option<Vec<u8>>>,
    /// Set when a `STREAM_RESET` names this stream; cleared once the caller marks its next
    /// `send_frame` as a recovery point for that stream (§4.4 "Stream reset").
    recovery_requested: Mutex<HashMap<StreamKind, bool>>,
}

impl Receiver {
    pub fn new(initial_settings: crate::config::NetworkSettings) -> Self {
        Receiver {
            streams: Mutex::new(HashMap::new()),
            congestion: Mutex::new(CongestionController::new(initial_settings, 256_000)),
            message_pending: Mutex::new(None),
            recovery_requested: Mutex::new(HashMap::new()),
        }
    }

    pub fn recovery_requested(&self, stream: StreamKind) -> bool {
        *self.recovery_requested.lock().get(&stream).unwrap_or(&false)
    }

    pub fn clear_recovery_requested(&self, stream: StreamKind) {
        self.recovery_requested.lock().insert(stream, false);
    }

    pub fn register_stream(&self, stream: StreamKind, ring: RingBuffer) {
        self.streams.lock().insert(stream, StreamState { ring, last_group_id: None, group_stats: [None; MAX_GROUP_STATS] });
    }

    pub fn ring_for(&self, stream: StreamKind, f: impl FnOnce(&RingBuffer)) {
        if let Some(state) = self.streams.lock().get(&stream) {
            f(&state.ring);
        }
    }

    pub fn pending_stream_reset(&self, stream: StreamKind) -> Option<i32> {
        self.streams.lock().get(&stream).and_then(|s| s.ring.pending_stream_reset())
    }

    pub fn current_network_settings(&self) -> crate::config::NetworkSettings {
        self.congestion.lock().current_settings()
    }

    pub fn take_pending_message(&self) -> Option<Vec<u8>> {
        self.message_pending.lock().take()
    }

    /// Handle one decrypted plaintext packet, per the kind-dispatch table of §4.8.
    pub fn dispatch(&self, session: &Session, plaintext: &[u8]) -> Result<Dispatched> {
        let packet = Packet::decode(plaintext)?;
        match packet {
            Packet::Segment(segment) => self.dispatch_segment(session, segment),
            Packet::Nack(Nack { stream_kind, frame_id, segment_index }) => {
                Ok(Dispatched::Nack { stream: stream_kind, frame_id, segment_index })
            }
            Packet::BitarrayNack(b) => {
                let indices = b.indices();
                let BitarrayNack { stream_kind, frame_id, .. } = b;
                Ok(Dispatched::BitarrayNack { stream: stream_kind, frame_id, indices })
            }
            Packet::Ping(ping) => {
                session.handle_ping(ping)?;
                Ok(Dispatched::Nothing)
            }
            Packet::Pong(pong) => {
                session.handle_pong(pong);
                Ok(Dispatched::Nothing)
            }
            Packet::StreamReset(StreamReset { stream_kind, .. }) => {
                self.recovery_requested.lock().insert(stream_kind, true);
                Ok(Dispatched::Nothing)
            }
            Packet::NetworkSettings(settings) => {
                *self.congestion.lock() = CongestionController::new(settings, 256_000);
                Ok(Dispatched::NetworkSettingsReceived(settings))
            }
            Packet::ConnectionAttempt | Packet::ConnectionConfirmation => Ok(Dispatched::Nothing),
        }
    }

    fn dispatch_segment(&self, session: &Session, segment: Segment) -> Result<Dispatched> {
        let stream = segment.stream_kind;
        let arrival_time_us = session.now_us();

        if !stream.is_segmented() {
            *self.message_pending.lock() = Some(segment.bytes.clone());
            return Ok(Dispatched::Segment { stream });
        }

        let is_cc_eligible = stream == StreamKind::Video && !segment.is_nack && !segment.is_duplicate;
        let mut network_settings_update = None;

        {
            let mut streams = self.streams.lock();
            if let Some(state) = streams.get_mut(&stream) {
                state.ring.insert(&segment);

                if is_cc_eligible {
                    let eligible = state.last_group_id.map(|curr| segment.group_id >= curr).unwrap_or(true);
                    if eligible {
                        state.last_group_id = Some(segment.group_id);
                        let slot = (segment.group_id as usize) % MAX_GROUP_STATS;
                        match &mut state.group_stats[slot] {
                            Some(acc) if acc.group_id == segment.group_id => {
                                acc.departure_time_us = acc.departure_time_us.max(segment.departure_time_us);
                                acc.arrival_time_us = arrival_time_us;
                                acc.bytes += segment.bytes.len() as u64;
                            }
                            other => {
                                *other = Some(GroupAccum {
                                    group_id: segment.group_id,
                                    departure_time_us: segment.departure_time_us,
                                    arrival_time_us,
                                    bytes: segment.bytes.len() as u64,
                                });
                            }
                        }
                        let acc = state.group_stats[slot].unwrap();

                        let loss_ratio = state.ring.current_loss_ratio();
                        network_settings_update = self.congestion.lock().on_group_arrival(
                            GroupStats {
                                group_id: segment.group_id,
                                departure_time_us: acc.departure_time_us,
                                arrival_time_us: acc.arrival_time_us,
                                bytes: acc.bytes,
                            },
                            arrival_time_us,
                            loss_ratio,
                        );
                    }
                }
            }
        }

        if let Some(settings) = network_settings_update {
            return Ok(Dispatched::NetworkSettingsChanged(settings));
        }
        Ok(Dispatched::Segment { stream })
    }
}
