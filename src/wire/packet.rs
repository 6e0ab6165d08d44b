//! Plaintext packet kinds (the envelope's ciphertext, once decrypted).

use crate::config::{NetworkSettings, StreamKind};
use crate::error::{Result, TransportError};

/// One-octet tag identifying the kind of the plaintext body that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Segment = 0,
    Nack = 1,
    BitarrayNack = 2,
    StreamReset = 3,
    Ping = 4,
    Pong = 5,
    NetworkSettings = 6,
    ConnectionAttempt = 7,
    ConnectionConfirmation = 8,
}

impl PacketKind {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => PacketKind::Segment,
            1 => PacketKind::Nack,
            2 => PacketKind::BitarrayNack,
            3 => PacketKind::StreamReset,
            4 => PacketKind::Ping,
            5 => PacketKind::Pong,
            6 => PacketKind::NetworkSettings,
            7 => PacketKind::ConnectionAttempt,
            8 => PacketKind::ConnectionConfirmation,
            other => return Err(TransportError::Malformed(format!("unknown packet kind tag {other}"))),
        })
    }
}

/// A segmented fragment of an application frame, plus congestion-control and FEC metadata.
#[derive(Debug, Clone)]
pub struct Segment {
    pub stream_kind: StreamKind,
    pub departure_time_us: u64,
    pub frame_id: u32,
    pub segment_index: u16,
    pub segment_count: u16,
    pub fec_segment_count: u16,
    pub is_nack: bool,
    pub is_duplicate: bool,
    pub prev_frame_duplicate_count: u16,
    pub group_id: u32,
    pub bytes: Vec<u8>,
}

impl Segment {
    /// `segment_index` is one of the original, non-parity segments.
    pub fn is_data(&self) -> bool {
        (self.segment_index as u32) < (self.segment_count - self.fec_segment_count) as u32
    }

    fn validate_geometry(&self) -> Result<()> {
        if self.segment_index >= self.segment_count {
            return Err(TransportError::Malformed(format!(
                "segment_index {} >= segment_count {}",
                self.segment_index, self.segment_count
            )));
        }
        if self.fec_segment_count > self.segment_count {
            return Err(TransportError::Malformed("fec_segment_count exceeds segment_count".into()));
        }
        if self.segment_count as usize > crate::config::MAX_TOTAL_PACKETS {
            return Err(TransportError::Malformed("segment_count exceeds MAX_TOTAL_PACKETS".into()));
        }
        if self.bytes.len() > crate::config::MAX_SEGMENT_SIZE {
            return Err(TransportError::Malformed("segment payload exceeds MAX_SEGMENT_SIZE".into()));
        }
        Ok(())
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        self.validate_geometry()?;
        out.push(self.stream_kind as u8);
        out.extend_from_slice(&self.departure_time_us.to_le_bytes());
        out.extend_from_slice(&self.frame_id.to_le_bytes());
        out.extend_from_slice(&self.segment_index.to_le_bytes());
        out.extend_from_slice(&self.segment_count.to_le_bytes());
        out.extend_from_slice(&self.fec_segment_count.to_le_bytes());
        let segment_size = self.bytes.len() as u16;
        out.extend_from_slice(&segment_size.to_le_bytes());
        out.extend_from_slice(&self.prev_frame_duplicate_count.to_le_bytes());
        out.push(self.is_nack as u8);
        out.push(self.is_duplicate as u8);
        out.extend_from_slice(&self.group_id.to_le_bytes());
        out.extend_from_slice(&self.bytes);
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let stream_kind = StreamKind::from_u8(r.u8()?)
            .ok_or_else(|| TransportError::Malformed("invalid stream_kind".into()))?;
        let departure_time_us = r.u64()?;
        let frame_id = r.u32()?;
        let segment_index = r.u16()?;
        let segment_count = r.u16()?;
        let fec_segment_count = r.u16()?;
        let segment_size = r.u16()?;
        let prev_frame_duplicate_count = r.u16()?;
        let is_nack = r.u8()? != 0;
        let is_duplicate = r.u8()? != 0;
        let group_id = r.u32()?;
        let bytes = r.take(segment_size as usize)?.to_vec();
        r.finish()?;

        let seg = Segment {
            stream_kind,
            departure_time_us,
            frame_id,
            segment_index,
            segment_count,
            fec_segment_count,
            is_nack,
            is_duplicate,
            prev_frame_duplicate_count,
            group_id,
            bytes,
        };
        seg.validate_geometry()?;
        Ok(seg)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Nack {
    pub stream_kind: StreamKind,
    pub frame_id: u32,
    pub segment_index: u16,
}

#[derive(Debug, Clone)]
pub struct BitarrayNack {
    pub stream_kind: StreamKind,
    pub frame_id: u32,
    pub start_index: u32,
    pub num_bits: u32,
    pub bitmap: Vec<u8>,
}

impl BitarrayNack {
    pub fn new(stream_kind: StreamKind, frame_id: u32, start_index: u32, indices: &[u16]) -> Self {
        let num_bits = indices.iter().map(|&i| i as u32 - start_index + 1).max().unwrap_or(0);
        let mut bitmap = vec![0u8; num_bits.div_ceil(8) as usize];
        for &idx in indices {
            let bit = idx as u32 - start_index;
            bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        BitarrayNack { stream_kind, frame_id, start_index, num_bits, bitmap }
    }

    /// Segment indices named by this request, always within `[start_index, start_index +
    /// num_bits)` by construction (see Open Question resolution in DESIGN.md).
    pub fn indices(&self) -> Vec<u16> {
        (0..self.num_bits)
            .filter(|&bit| self.bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
            .map(|bit| (self.start_index + bit) as u16)
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamReset {
    pub stream_kind: StreamKind,
    pub greatest_failed_id: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct Ping {
    pub id: u32,
    pub send_timestamp_us: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Pong {
    pub id: u32,
    pub ping_send_timestamp_us: u64,
}

/// The full set of plaintext packet bodies.
#[derive(Debug, Clone)]
pub enum Packet {
    Segment(Segment),
    Nack(Nack),
    BitarrayNack(BitarrayNack),
    StreamReset(StreamReset),
    Ping(Ping),
    Pong(Pong),
    NetworkSettings(NetworkSettings),
    ConnectionAttempt,
    ConnectionConfirmation,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Segment(_) => PacketKind::Segment,
            Packet::Nack(_) => PacketKind::Nack,
            Packet::BitarrayNack(_) => PacketKind::BitarrayNack,
            Packet::StreamReset(_) => PacketKind::StreamReset,
            Packet::Ping(_) => PacketKind::Ping,
            Packet::Pong(_) => PacketKind::Pong,
            Packet::NetworkSettings(_) => PacketKind::NetworkSettings,
            Packet::ConnectionAttempt => PacketKind::ConnectionAttempt,
            Packet::ConnectionConfirmation => PacketKind::ConnectionConfirmation,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        out.push(self.kind() as u8);
        match self {
            Packet::Segment(s) => s.encode(&mut out)?,
            Packet::Nack(n) => {
                out.push(n.stream_kind as u8);
                out.extend_from_slice(&n.frame_id.to_le_bytes());
                out.extend_from_slice(&n.segment_index.to_le_bytes());
            }
            Packet::BitarrayNack(b) => {
                out.push(b.stream_kind as u8);
                out.extend_from_slice(&b.frame_id.to_le_bytes());
                out.extend_from_slice(&b.start_index.to_le_bytes());
                out.extend_from_slice(&b.num_bits.to_le_bytes());
                out.extend_from_slice(&b.bitmap);
            }
            Packet::StreamReset(s) => {
                out.push(s.stream_kind as u8);
                out.extend_from_slice(&s.greatest_failed_id.to_le_bytes());
            }
            Packet::Ping(p) => {
                out.extend_from_slice(&p.id.to_le_bytes());
                out.extend_from_slice(&p.send_timestamp_us.to_le_bytes());
            }
            Packet::Pong(p) => {
                out.extend_from_slice(&p.id.to_le_bytes());
                out.extend_from_slice(&p.ping_send_timestamp_us.to_le_bytes());
            }
            Packet::NetworkSettings(n) => {
                out.extend_from_slice(&n.bitrate_bps.to_le_bytes());
                out.extend_from_slice(&n.burst_bitrate_bps.to_le_bytes());
                out.extend_from_slice(&n.audio_fec_ratio.to_bits().to_le_bytes());
                out.extend_from_slice(&n.video_fec_ratio.to_bits().to_le_bytes());
            }
            Packet::ConnectionAttempt | Packet::ConnectionConfirmation => {}
        }
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(TransportError::Malformed("empty plaintext".into()));
        }
        let kind = PacketKind::from_u8(buf[0])?;
        let body = &buf[1..];
        Ok(match kind {
            PacketKind::Segment => Packet::Segment(Segment::decode(body)?),
            PacketKind::Nack => {
                let mut r = Reader::new(body);
                let stream_kind = StreamKind::from_u8(r.u8()?)
                    .ok_or_else(|| TransportError::Malformed("invalid stream_kind".into()))?;
                let frame_id = r.u32()?;
                let segment_index = r.u16()?;
                r.finish()?;
                Packet::Nack(Nack { stream_kind, frame_id, segment_index })
            }
            PacketKind::BitarrayNack => {
                let mut r = Reader::new(body);
                let stream_kind = StreamKind::from_u8(r.u8()?)
                    .ok_or_else(|| TransportError::Malformed("invalid stream_kind".into()))?;
                let frame_id = r.u32()?;
                let start_index = r.u32()?;
                let num_bits = r.u32()?;
                let bitmap = r.take(num_bits.div_ceil(8) as usize)?.to_vec();
                r.finish()?;
                Packet::BitarrayNack(BitarrayNack { stream_kind, frame_id, start_index, num_bits, bitmap })
            }
            PacketKind::StreamReset => {
                let mut r = Reader::new(body);
                let stream_kind = StreamKind::from_u8(r.u8()?)
                    .ok_or_else(|| TransportError::Malformed("invalid stream_kind".into()))?;
                let greatest_failed_id = r.i32()?;
                r.finish()?;
                Packet::StreamReset(StreamReset { stream_kind, greatest_failed_id })
            }
            PacketKind::Ping => {
                let mut r = Reader::new(body);
                let id = r.u32()?;
                let send_timestamp_us = r.u64()?;
                r.finish()?;
                Packet::Ping(Ping { id, send_timestamp_us })
            }
            PacketKind::Pong => {
                let mut r = Reader::new(body);
                let id = r.u32()?;
                let ping_send_timestamp_us = r.u64()?;
                r.finish()?;
                Packet::Pong(Pong { id, ping_send_timestamp_us })
            }
            PacketKind::NetworkSettings => {
                let mut r = Reader::new(body);
                let bitrate_bps = r.u64()?;
                let burst_bitrate_bps = r.u64()?;
                let audio_fec_ratio = f64::from_bits(r.u64()?);
                let video_fec_ratio = f64::from_bits(r.u64()?);
                r.finish()?;
                Packet::NetworkSettings(NetworkSettings {
                    bitrate_bps,
                    burst_bitrate_bps,
                    audio_fec_ratio,
                    video_fec_ratio,
                })
            }
            PacketKind::ConnectionAttempt => Packet::ConnectionAttempt,
            PacketKind::ConnectionConfirmation => Packet::ConnectionConfirmation,
        })
    }
}

/// A small cursor over a byte slice, used for hand-rolled little-endian decoding.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(TransportError::Malformed("packet body truncated".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(TransportError::Malformed("trailing bytes in packet body".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_round_trips() {
        let seg = Segment {
            stream_kind: StreamKind::Video,
            departure_time_us: 123_456,
            frame_id: 42,
            segment_index: 1,
            segment_count: 3,
            fec_segment_count: 1,
            is_nack: true,
            is_duplicate: false,
            prev_frame_duplicate_count: 2,
            group_id: 7,
            bytes: vec![1, 2, 3, 4, 5],
        };
        let packet = Packet::Segment(seg.clone());
        let encoded = packet.encode().unwrap();
        let decoded = Packet::decode(&encoded).unwrap();
        match decoded {
            Packet::Segment(d) => {
                assert_eq!(d.frame_id, seg.frame_id);
                assert_eq!(d.segment_index, seg.segment_index);
                assert_eq!(d.bytes, seg.bytes);
                assert_eq!(d.is_nack, seg.is_nack);
                assert_eq!(d.group_id, seg.group_id);
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn bitarray_nack_bits_stay_within_range() {
        let b = BitarrayNack::new(StreamKind::Video, 9, 10, &[10, 12, 15]);
        let mut indices = b.indices();
        indices.sort();
        assert_eq!(indices, vec![10, 12, 15]);
        assert!(indices.iter().all(|&i| i >= 10 && (i as u32) < 10 + b.num_bits));
    }

    #[test]
    fn connection_attempt_round_trips_with_empty_body() {
        let encoded = Packet::ConnectionAttempt.encode().unwrap();
        assert_eq!(encoded, vec![PacketKind::ConnectionAttempt as u8]);
        matches!(Packet::decode(&encoded).unwrap(), Packet::ConnectionAttempt);
    }

    #[test]
    fn network_settings_round_trips_floats_exactly() {
        let ns = NetworkSettings {
            bitrate_bps: 10_000_000,
            burst_bitrate_bps: 12_000_000,
            audio_fec_ratio: 0.1,
            video_fec_ratio: 0.25,
        };
        let encoded = Packet::NetworkSettings(ns).encode().unwrap();
        match Packet::decode(&encoded).unwrap() {
            Packet::NetworkSettings(d) => {
                assert_eq!(d.bitrate_bps, ns.bitrate_bps);
                assert_eq!(d.video_fec_ratio, ns.video_fec_ratio);
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn truncated_packet_is_malformed_not_panicking() {
        let seg = Packet::Segment(Segment {
            stream_kind: StreamKind::Audio,
            departure_time_us: 1,
            frame_id: 1,
            segment_index: 0,
            segment_count: 1,
            fec_segment_count: 0,
            is_nack: false,
            is_duplicate: false,
            prev_frame_duplicate_count: 0,
            group_id: 0,
            bytes: vec![9, 9, 9],
        });
        let mut encoded = seg.encode().unwrap();
        encoded.truncate(encoded.len() - 2);
        assert!(Packet::decode(&encoded).is_err());
    }
}
