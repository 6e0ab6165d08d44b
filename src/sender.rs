//! Sender path: segment, retain for nacks, pace, encrypt, transmit (§4.2, §4.6, §9
//! "cooperative" design note — a single `poll()`-driven loop rather than a dedicated thread).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::StreamKind;
use crate::error::Result;
use crate::nack_buffer::NackBuffer;
use crate::segment::Segmenter;
use crate::session::Session;
use crate::throttle::Throttler;
use crate::wire::packet::Segment;
use crate::wire::Packet;

/// Audio's fixed reservation subtracted from the throttler's burst budget (§4.6).
const AUDIO_RESERVED_BPS: u64 = 256_000;

pub struct StreamSender {
    segmenter: Mutex<Segmenter>,
    nack_buffer: NackBuffer,
    duplicate_count: Mutex<u16>,
}

pub struct Sender {
    streams: Mutex<HashMap<StreamKind, StreamSender>>,
    throttler: Throttler,
}

impl Sender {
    pub fn new(initial_burst_bps: u64) -> Self {
        Sender {
            streams: Mutex::new(HashMap::new()),
            throttler: Throttler::new(initial_burst_bps.saturating_sub(AUDIO_RESERVED_BPS)),
        }
    }

    pub fn register_stream(&self, stream: StreamKind, nack_buffer: NackBuffer) {
        self.streams.lock().insert(
            stream,
            StreamSender { segmenter: Mutex::new(Segmenter::new()), nack_buffer, duplicate_count: Mutex::new(0) },
        );
    }

    pub fn set_fec_ratio(&self, stream: StreamKind, ratio: f64) {
        if let Some(s) = self.streams.lock().get(&stream) {
            s.segmenter.lock().set_fec_ratio(ratio);
        }
    }

    pub fn set_burst_bitrate(&self, burst_bps: u64) {
        self.throttler.set_burst_bitrate(burst_bps.saturating_sub(AUDIO_RESERVED_BPS));
    }

    /// Segment, retain, pace (video only), encrypt, and transmit one application frame.
    pub fn send_frame(&self, session: &Session, stream: StreamKind, frame_id: u32, bytes: &[u8]) -> Result<()> {
        session.guard()?;
        let streams = self.streams.lock();
        let stream_sender = streams
            .get(&stream)
            .ok_or_else(|| crate::error::TransportError::Malformed(format!("no NACK buffer registered for {stream:?}")))?;

        let departure_time_us = session.now_us();
        let group_id = if stream == StreamKind::Video {
            self.throttler.wait_for_allocation(bytes.len())
        } else {
            0
        };

        let pending_duplicates = std::mem::take(&mut *stream_sender.duplicate_count.lock());

        let segments = {
            let mut segmenter = stream_sender.segmenter.lock();
            segmenter.record_duplicate_count(pending_duplicates);
            segmenter.segment_frame(stream, frame_id, group_id, departure_time_us, bytes)?
        };

        for segment in segments {
            self.transmit(session, stream_sender, segment)?;
        }

        Ok(())
    }

    fn transmit(&self, session: &Session, stream_sender: &StreamSender, segment: Segment) -> Result<()> {
        stream_sender.nack_buffer.retain(segment.clone());
        session.send_packet(&Packet::Segment(segment))?;
        // AES-GCM appends a fixed 16-byte tag beyond the plaintext; charge it back so the
        // pacing bound (§8 property 5) accounts for on-wire bytes, not just payload bytes.
        const GCM_TAG_LEN: usize = 16;
        self.throttler.charge_encryption_overhead(GCM_TAG_LEN);
        Ok(())
    }

    /// Drain and resend everything the NACK responder has queued for one stream.
    pub fn drain_nacks(&self, session: &Session, stream: StreamKind) -> Result<()> {
        let streams = self.streams.lock();
        let Some(stream_sender) = streams.get(&stream) else { return Ok(()) };
        for segment in stream_sender.nack_buffer.drain_pending() {
            session.send_packet(&Packet::Segment(segment))?;
        }
        Ok(())
    }

    pub fn request_resend(&self, stream: StreamKind, frame_id: u32, segment_index: u16) {
        if let Some(s) = self.streams.lock().get(&stream) {
            s.nack_buffer.request_resend(frame_id, segment_index);
        }
    }

    pub fn request_resend_many(&self, stream: StreamKind, frame_id: u32, indices: &[u16]) {
        if let Some(s) = self.streams.lock().get(&stream) {
            s.nack_buffer.request_resend_many(frame_id, indices);
        }
    }

    /// Proactively schedule a duplicate resend (§4.7); counted so the next frame's segments
    /// carry an accurate `prev_frame_duplicate_count`.
    pub fn request_duplicate(&self, stream: StreamKind, frame_id: u32, segment_index: u16) {
        if let Some(s) = self.streams.lock().get(&stream) {
            s.nack_buffer.request_duplicate(frame_id, segment_index);
            *s.duplicate_count.lock() += 1;
        }
    }
}
