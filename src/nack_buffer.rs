//! Server-side NACK buffer (§4.3): a ring of `N` frame slots, each retaining up to
//! `MAX_INDICES` sent segments plus a parallel validity bitmap, so a resend request can be
//! served without re-segmenting or re-encoding.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::config::NackBufferConfig;
use crate::wire::packet::Segment;

struct Slot {
    frame_id: Option<u32>,
    segments: Vec<Option<Segment>>,
}

impl Slot {
    fn empty(max_indices: usize) -> Self {
        Slot { frame_id: None, segments: vec![None; max_indices] }
    }
}

/// A single pending resend request, queued so the sender drains it at a segment boundary
/// rather than mid-send of a later frame (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct NackRequest {
    pub frame_id: u32,
    pub segment_index: u16,
    pub is_duplicate: bool,
}

struct Inner {
    slots: Vec<Slot>,
    queue: VecDeque<NackRequest>,
}

pub struct NackBuffer {
    inner: Mutex<Inner>,
    num_buffers: usize,
    max_indices: usize,
}

impl NackBuffer {
    pub fn new(config: NackBufferConfig) -> Self {
        let max_indices = crate::config::DEFAULT_MAX_INDICES.min(config.max_frame_size);
        NackBuffer {
            inner: Mutex::new(Inner {
                slots: (0..config.num_buffers).map(|_| Slot::empty(max_indices)).collect(),
                queue: VecDeque::new(),
            }),
            num_buffers: config.num_buffers,
            max_indices,
        }
    }

    /// Retain a just-sent segment so a later `NACK`/`BITARRAY_NACK` can be served.
    pub fn retain(&self, segment: Segment) {
        if segment.segment_index as usize >= self.max_indices {
            return; // geometry beyond what we retain; server will rely on FEC/reset instead
        }
        let slot_idx = segment.frame_id as usize % self.num_buffers;
        let mut inner = self.inner.lock();
        let index = segment.segment_index as usize;
        let slot = &mut inner.slots[slot_idx];
        if slot.frame_id != Some(segment.frame_id) {
            *slot = Slot::empty(self.max_indices);
            slot.frame_id = Some(segment.frame_id);
        }
        slot.segments[index] = Some(segment);
    }

    /// Enqueue a single-index nack for later draining.
    pub fn request_resend(&self, frame_id: u32, segment_index: u16) {
        self.inner.lock().queue.push_back(NackRequest { frame_id, segment_index, is_duplicate: false });
    }

    /// Enqueue every index named by a `BITARRAY_NACK`.
    pub fn request_resend_many(&self, frame_id: u32, indices: &[u16]) {
        let mut inner = self.inner.lock();
        for &index in indices {
            inner.queue.push_back(NackRequest { frame_id, segment_index: index, is_duplicate: false });
        }
    }

    /// Proactively schedule a duplicate resend (no client nack), per §4.7.
    pub fn request_duplicate(&self, frame_id: u32, segment_index: u16) {
        self.inner.lock().queue.push_back(NackRequest { frame_id, segment_index, is_duplicate: true });
    }

    /// Drain the queue, resolving each request against the retained ring. Requests for a
    /// frame_id that has since been overwritten are silently dropped (best-effort, §4.3).
    pub fn drain_pending(&self) -> Vec<Segment> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.queue.len());
        while let Some(req) = inner.queue.pop_front() {
            let slot_idx = req.frame_id as usize % self.num_buffers;
            let slot = &inner.slots[slot_idx];
            if slot.frame_id != Some(req.frame_id) {
                continue;
            }
            let Some(stored) = slot.segments.get(req.segment_index as usize).and_then(|s| s.as_ref()) else {
                continue;
            };
            let mut resend = stored.clone();
            resend.is_nack = !req.is_duplicate;
            resend.is_duplicate = req.is_duplicate;
            out.push(resend);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamKind;

    fn seg(frame_id: u32, index: u16) -> Segment {
        Segment {
            stream_kind: StreamKind::Video,
            departure_time_us: 0,
            frame_id,
            segment_index: index,
            segment_count: 4,
            fec_segment_count: 0,
            is_nack: false,
            is_duplicate: false,
            prev_frame_duplicate_count: 0,
            group_id: 0,
            bytes: vec![1, 2, 3],
        }
    }

    #[test]
    fn resend_request_is_served_from_retained_segment() {
        let buf = NackBuffer::new(NackBufferConfig::default());
        buf.retain(seg(10, 2));
        buf.request_resend(10, 2);
        let resends = buf.drain_pending();
        assert_eq!(resends.len(), 1);
        assert!(resends[0].is_nack);
        assert_eq!(resends[0].segment_index, 2);
    }

    #[test]
    fn overwritten_slot_drops_nack_silently() {
        let config = NackBufferConfig { max_frame_size: 2 * 1024 * 1024, num_buffers: 4 };
        let buf = NackBuffer::new(config);
        buf.retain(seg(1, 0));
        buf.retain(seg(5, 0)); // same slot (1 % 4 == 5 % 4), overwrites frame 1
        buf.request_resend(1, 0);
        assert!(buf.drain_pending().is_empty());
    }

    #[test]
    fn duplicate_resend_is_marked_accordingly() {
        let buf = NackBuffer::new(NackBufferConfig::default());
        buf.retain(seg(3, 1));
        buf.request_duplicate(3, 1);
        let resends = buf.drain_pending();
        assert!(resends[0].is_duplicate);
        assert!(!resends[0].is_nack);
    }
}
