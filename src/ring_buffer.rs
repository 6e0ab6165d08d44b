//! Client-side ring reassembler (§4.4): per-stream reassembly of segmented frames, FEC
//! recovery, nack scheduling, stream-reset escalation, and the render-pointer catch-up
//! policy that the application drives through [`RingBuffer::next_frame`].

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{
    RingBufferConfig, StreamKind, MAX_AUDIO_FRAMES, MAX_NACK_ATTEMPTS, MIN_NACK_COOLDOWN_MS, RESET_THRESHOLD,
    SAFETY_MARGIN,
};
use crate::fec::ReedSolomon;
use crate::wire::packet::Segment;

/// A fully reassembled application frame handed back to the caller.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream: StreamKind,
    pub frame_id: u32,
    pub is_recovery_point: bool,
    pub bytes: Vec<u8>,
}

/// A resend this reassembler wants issued, queued up by the periodic nack-scheduling pass.
#[derive(Debug, Clone, Copy)]
pub enum PendingNack {
    Single { frame_id: u32, segment_index: u16 },
    Many { frame_id: u32, start_index: u16, indices_mask: u64 },
}

struct SlotData {
    frame_id: i64, // -1: empty
    segment_count: u16,
    fec_segment_count: u16,
    present: Vec<bool>,
    bytes: Vec<Option<Vec<u8>>>,
    first_seen: Instant,
    last_nack: Vec<Option<Instant>>,
    nack_attempts: Vec<u32>,
    assembled_bytes: Option<Vec<u8>>,
    is_recovery_point: bool,
    reset_requested: bool,
}

impl SlotData {
    fn empty() -> Self {
        SlotData {
            frame_id: -1,
            segment_count: 0,
            fec_segment_count: 0,
            present: Vec::new(),
            bytes: Vec::new(),
            first_seen: Instant::now(),
            last_nack: Vec::new(),
            nack_attempts: Vec::new(),
            assembled_bytes: None,
            is_recovery_point: false,
            reset_requested: false,
        }
    }

    fn reset_for(&mut self, frame_id: u32, segment_count: u16, fec_segment_count: u16) {
        self.frame_id = frame_id as i64;
        self.segment_count = segment_count;
        self.fec_segment_count = fec_segment_count;
        self.present = vec![false; segment_count as usize];
        self.bytes = vec![None; segment_count as usize];
        self.first_seen = Instant::now();
        self.last_nack = vec![None; segment_count as usize];
        self.nack_attempts = vec![0; segment_count as usize];
        self.assembled_bytes = None;
        self.is_recovery_point = false;
        self.reset_requested = false;
    }

    fn data_count(&self) -> usize {
        self.segment_count as usize - self.fec_segment_count as usize
    }

    fn can_decode(&self) -> bool {
        let data_count = self.data_count();
        let all_data_present = self.present[..data_count].iter().all(|&p| p);
        let total_present = self.present.iter().filter(|&&p| p).count();
        all_data_present || total_present >= data_count
    }
}

pub struct RingBuffer {
    stream: StreamKind,
    num_buffers: usize,
    slots: Mutex<Vec<SlotData>>,
    assembled: Vec<AtomicBool>,
    max_id: AtomicI64,
    last_rendered_id: AtomicI64,
    pending_stream_reset: Mutex<Option<i32>>,
    recovery_predicate: Box<dyn Fn(&[u8]) -> bool + Send + Sync>,
}

impl RingBuffer {
    pub fn new(stream: StreamKind, config: RingBufferConfig) -> Self {
        Self::with_recovery_predicate(stream, config, Box::new(|_| false))
    }

    pub fn with_recovery_predicate(
        stream: StreamKind,
        config: RingBufferConfig,
        recovery_predicate: Box<dyn Fn(&[u8]) -> bool + Send + Sync>,
    ) -> Self {
        RingBuffer {
            stream,
            num_buffers: config.num_buffers,
            slots: Mutex::new((0..config.num_buffers).map(|_| SlotData::empty()).collect()),
            assembled: (0..config.num_buffers).map(|_| AtomicBool::new(false)).collect(),
            max_id: AtomicI64::new(-1),
            last_rendered_id: AtomicI64::new(-1),
            pending_stream_reset: Mutex::new(None),
            recovery_predicate,
        }
    }

    /// Record a newly-arrived `SEGMENT`. Returns `true` if this completed the frame.
    pub fn insert(&self, segment: &Segment) -> bool {
        let slot_idx = segment.frame_id as usize % self.num_buffers;
        let mut slots = self.slots.lock();

        let max_id = self.max_id.load(Ordering::Acquire);
        if (segment.frame_id as i64) < max_id - (self.num_buffers as i64) {
            return false; // far enough in the past that it can't be this slot's current owner
        }

        {
            let slot = &mut slots[slot_idx];
            if slot.frame_id != segment.frame_id as i64 {
                if slot.frame_id > segment.frame_id as i64 {
                    return false; // newer frame already owns this slot
                }
                slot.reset_for(segment.frame_id, segment.segment_count, segment.fec_segment_count);
                self.assembled[slot_idx].store(false, Ordering::Release);
            }
        }

        let slot = &mut slots[slot_idx];
        let index = segment.segment_index as usize;
        if index >= slot.present.len() {
            return false;
        }
        if slot.present[index] {
            return false; // duplicate, silently dropped
        }
        slot.present[index] = true;
        slot.bytes[index] = Some(segment.bytes.clone());

        self.max_id.fetch_max(segment.frame_id as i64, Ordering::AcqRel);

        if slot.assembled_bytes.is_none() && slot.can_decode() {
            if let Some(assembled) = decode_slot(slot) {
                slot.is_recovery_point = (self.recovery_predicate)(&assembled);
                slot.assembled_bytes = Some(assembled);
                self.assembled[slot_idx].store(true, Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Pull the next frame per the catch-up policy (§4.4 "Render pointer"). Non-blocking.
    pub fn next_frame(&self) -> Option<Frame> {
        let last_rendered = self.last_rendered_id.load(Ordering::Acquire);
        let max_id = self.max_id.load(Ordering::Acquire);
        if max_id < 0 {
            return None;
        }

        let mut slots = self.slots.lock();

        if self.stream == StreamKind::Audio {
            let buffered = self.count_assembled_ahead(&slots, last_rendered, max_id);
            if buffered as i64 > MAX_AUDIO_FRAMES {
                return self.take_and_render(&mut slots, max_id);
            }
        }

        if self.stream == StreamKind::Video {
            if let Some(recovery_id) = self.find_recovery_point(&slots, last_rendered, max_id) {
                if recovery_id > last_rendered + 1 {
                    return self.take_and_render(&mut slots, recovery_id);
                }
            }
        }

        let candidate = last_rendered + 1;
        if candidate > max_id {
            return None;
        }
        let slot_idx = (candidate as usize) % self.num_buffers;
        if slots[slot_idx].frame_id != candidate || slots[slot_idx].assembled_bytes.is_none() {
            return None;
        }
        self.take_and_render(&mut slots, candidate)
    }

    fn count_assembled_ahead(&self, slots: &[SlotData], from_exclusive: i64, to_inclusive: i64) -> usize {
        let mut count = 0;
        let mut id = from_exclusive + 1;
        while id <= to_inclusive {
            let idx = (id as usize) % self.num_buffers;
            if slots[idx].frame_id == id && slots[idx].assembled_bytes.is_some() {
                count += 1;
            }
            id += 1;
        }
        count
    }

    fn find_recovery_point(&self, slots: &[SlotData], from_exclusive: i64, to_inclusive: i64) -> Option<i64> {
        let mut best = None;
        let mut id = from_exclusive + 1;
        while id <= to_inclusive {
            let idx = (id as usize) % self.num_buffers;
            if slots[idx].frame_id == id && slots[idx].assembled_bytes.is_some() && slots[idx].is_recovery_point {
                best = Some(id);
            }
            id += 1;
        }
        best
    }

    fn take_and_render(&self, slots: &mut [SlotData], frame_id: i64) -> Option<Frame> {
        let idx = (frame_id as usize) % self.num_buffers;
        let slot = &mut slots[idx];
        if slot.frame_id != frame_id {
            return None;
        }
        let bytes = slot.assembled_bytes.take()?;
        let is_recovery_point = slot.is_recovery_point;
        self.last_rendered_id.store(frame_id, Ordering::Release);
        if is_recovery_point {
            *self.pending_stream_reset.lock() = None;
        }
        Some(Frame { stream: self.stream, frame_id: frame_id as u32, is_recovery_point, bytes })
    }

    /// Periodic pass (driven by the receiver's update loop): schedule resends for incomplete
    /// slots old enough to need them, and escalate to a stream reset if one has fallen too far
    /// behind. `rtt_us` derives the nack cooldown.
    pub fn schedule_nacks(&self, rtt_us: f64) -> Vec<PendingNack> {
        let max_id = self.max_id.load(Ordering::Acquire);
        if max_id < 0 {
            return Vec::new();
        }
        let cooldown = Duration::from_millis(((rtt_us / 1000.0) as u64).max(MIN_NACK_COOLDOWN_MS));
        let mut out = Vec::new();
        let mut slots = self.slots.lock();
        let now = Instant::now();

        let floor = (max_id - SAFETY_MARGIN).max(0);
        let horizon = (max_id - self.num_buffers as i64 + 1).max(0);
        let mut id = horizon;
        while id <= floor {
            let idx = (id as usize) % self.num_buffers;
            let slot = &mut slots[idx];
            if slot.frame_id == id && slot.assembled_bytes.is_none() {
                for seg_idx in 0..slot.present.len() {
                    if slot.present[seg_idx] {
                        continue;
                    }
                    if slot.nack_attempts[seg_idx] >= MAX_NACK_ATTEMPTS {
                        continue;
                    }
                    let due = slot.last_nack[seg_idx].map(|t| now.duration_since(t) >= cooldown).unwrap_or(true);
                    if due {
                        slot.last_nack[seg_idx] = Some(now);
                        slot.nack_attempts[seg_idx] += 1;
                        out.push(PendingNack::Single { frame_id: id as u32, segment_index: seg_idx as u16 });
                    }
                }
            }
            id += 1;
        }

        // Stream-reset escalation: a frame older than max_id - RESET_THRESHOLD still unassembled.
        if horizon > 0 {
            let oldest_incomplete = (0..self.num_buffers.min((floor - horizon + 1).max(0) as usize))
                .map(|offset| horizon + offset as i64)
                .find(|&id| {
                    let idx = (id as usize) % self.num_buffers;
                    slots[idx].frame_id == id && slots[idx].assembled_bytes.is_none()
                });
            if let Some(oldest) = oldest_incomplete {
                if oldest < max_id - RESET_THRESHOLD {
                    let idx = (oldest as usize) % self.num_buffers;
                    if !slots[idx].reset_requested {
                        slots[idx].reset_requested = true;
                        *self.pending_stream_reset.lock() = Some(oldest as i32);
                    }
                }
            }
        }

        out
    }

    pub fn pending_stream_reset(&self) -> Option<i32> {
        *self.pending_stream_reset.lock()
    }

    /// Snapshot loss ratio across every slot the ring still has state for: missing segments
    /// over expected segments (§4.5 control input — fed into the congestion controller
    /// alongside delay gradient and incoming bitrate).
    pub fn current_loss_ratio(&self) -> f64 {
        let slots = self.slots.lock();
        let mut expected = 0u64;
        let mut missing = 0u64;
        for slot in slots.iter() {
            if slot.frame_id < 0 {
                continue;
            }
            expected += slot.present.len() as u64;
            missing += slot.present.iter().filter(|&&p| !p).count() as u64;
        }
        if expected == 0 {
            0.0
        } else {
            missing as f64 / expected as f64
        }
    }
}

fn decode_slot(slot: &SlotData) -> Option<Vec<u8>> {
    let data_count = slot.data_count();
    let concatenated = if slot.present[..data_count].iter().all(|&p| p) {
        let mut out = Vec::new();
        for i in 0..data_count {
            out.extend_from_slice(slot.bytes[i].as_ref()?);
        }
        out
    } else {
        let rs = ReedSolomon::new(data_count, slot.fec_segment_count as usize).ok()?;
        let present: Vec<(usize, &[u8])> = slot
            .bytes
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_deref().map(|b| (i, b)))
            .collect();
        let shards = rs.decode(&present).ok()?;
        let mut out = Vec::new();
        for shard in shards {
            out.extend_from_slice(&shard);
        }
        out
    };

    if slot.fec_segment_count > 0 {
        trim_padding(concatenated)
    } else {
        Some(concatenated)
    }
}

/// FEC shards are zero-padded to a common length and prefixed with the true original length
/// (a 4-byte little-endian `u32`) by the Segmenter; strip both back off here. Non-FEC frames
/// are sliced exactly and never carry this prefix, so `decode_slot` skips this for them.
fn trim_padding(bytes: Vec<u8>) -> Option<Vec<u8>> {
    if bytes.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    bytes.get(4..4 + len).map(|s| s.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segmenter;

    fn config() -> RingBufferConfig {
        RingBufferConfig { max_frame_size: 2 * 1024 * 1024, num_buffers: 8 }
    }

    #[test]
    fn single_segment_frame_assembles_immediately() {
        let ring = RingBuffer::new(StreamKind::Video, config());
        let segmenter = Segmenter::new();
        let segs = segmenter.segment_frame(StreamKind::Video, 1, 0, 0, b"hello").unwrap();
        assert!(ring.insert(&segs[0]));
        let frame = ring.next_frame().unwrap();
        assert_eq!(frame.frame_id, 1);
        assert_eq!(frame.bytes, b"hello");
    }

    #[test]
    fn frames_render_in_order() {
        let ring = RingBuffer::new(StreamKind::Video, config());
        let segmenter = Segmenter::new();
        for id in 1..=3u32 {
            let segs = segmenter.segment_frame(StreamKind::Video, id, 0, 0, format!("frame-{id}").as_bytes()).unwrap();
            for s in &segs {
                ring.insert(s);
            }
        }
        let f1 = ring.next_frame().unwrap();
        let f2 = ring.next_frame().unwrap();
        let f3 = ring.next_frame().unwrap();
        assert_eq!((f1.frame_id, f2.frame_id, f3.frame_id), (1, 2, 3));
        assert!(ring.next_frame().is_none());
    }

    #[test]
    fn fec_recovers_missing_data_segment() {
        let ring = RingBuffer::new(StreamKind::Video, config());
        let mut segmenter = Segmenter::new();
        segmenter.set_fec_ratio(0.34);
        let bytes = vec![42u8; 4000];
        let segs = segmenter.segment_frame(StreamKind::Video, 1, 0, 0, &bytes).unwrap();
        for (i, s) in segs.iter().enumerate() {
            if i == 1 {
                continue; // drop one data segment; FEC should cover it
            }
            ring.insert(s);
        }
        let frame = ring.next_frame().unwrap();
        assert_eq!(frame.frame_id, 1);
    }

    #[test]
    fn audio_catches_up_when_overbuffered() {
        let ring = RingBuffer::new(StreamKind::Audio, config());
        let segmenter = Segmenter::new();
        for id in 1..=(MAX_AUDIO_FRAMES as u32 + 5) {
            let segs = segmenter.segment_frame(StreamKind::Audio, id, 0, 0, b"a").unwrap();
            ring.insert(&segs[0]);
        }
        let frame = ring.next_frame().unwrap();
        assert_eq!(frame.frame_id as i64, MAX_AUDIO_FRAMES as i64 + 5);
    }
}
