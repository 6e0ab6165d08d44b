//! Segmenter (§4.2): splits an application frame into fixed-max-size segments and, when a
//! nonzero FEC ratio is configured, asks the Reed-Solomon coder in [`crate::fec`] for parity.

use crate::config::{StreamKind, MAX_FEC_RATIO, MAX_SEGMENT_SIZE};
use crate::error::{Result, TransportError};
use crate::fec::ReedSolomon;
use crate::wire::packet::Segment;

pub struct Segmenter {
    fec_ratio: f64,
    prev_frame_duplicate_count: u16,
}

impl Segmenter {
    pub fn new() -> Self {
        Segmenter { fec_ratio: 0.0, prev_frame_duplicate_count: 0 }
    }

    pub fn set_fec_ratio(&mut self, ratio: f64) {
        self.fec_ratio = ratio.clamp(0.0, MAX_FEC_RATIO);
    }

    pub fn record_duplicate_count(&mut self, count: u16) {
        self.prev_frame_duplicate_count = count;
    }

    /// Split `bytes` for `(stream, frame_id)` into segments. Only `VIDEO`/`AUDIO` streams (the
    /// ones with a NACK buffer registered) may span more than one segment; `MESSAGE` frames
    /// larger than one segment are a caller error.
    ///
    /// Without FEC, segments are sliced linearly with no padding, so reassembly is byte-exact.
    /// With FEC, Reed-Solomon needs equal-length shards; the true length is carried as a 4-byte
    /// little-endian prefix ahead of the payload so the reassembler can trim the padding back
    /// off after decode (see `ring_buffer::trim_padding`).
    pub fn segment_frame(
        &self,
        stream: StreamKind,
        frame_id: u32,
        group_id: u32,
        departure_time_us: u64,
        bytes: &[u8],
    ) -> Result<Vec<Segment>> {
        let plain_k = bytes.len().div_ceil(MAX_SEGMENT_SIZE).max(1);
        if !stream.is_segmented() && plain_k > 1 {
            return Err(TransportError::Malformed(format!(
                "{stream:?} frame of {} bytes exceeds a single segment and has no NACK buffer",
                bytes.len()
            )));
        }

        if self.fec_ratio <= 0.0 {
            return Ok(self.segment_without_fec(stream, frame_id, group_id, departure_time_us, bytes, plain_k));
        }

        let mut framed = Vec::with_capacity(4 + bytes.len());
        framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        framed.extend_from_slice(bytes);

        let k = framed.len().div_ceil(MAX_SEGMENT_SIZE).max(1);
        let raw = (k as f64 * self.fec_ratio / (1.0 - self.fec_ratio)).ceil() as usize;
        // p / (k+p) <= MAX_FEC_RATIO
        let max_p = ((k as f64 * MAX_FEC_RATIO) / (1.0 - MAX_FEC_RATIO)).floor() as usize;
        let p = raw.min(max_p);

        if p == 0 {
            return Ok(self.segment_without_fec(stream, frame_id, group_id, departure_time_us, bytes, plain_k));
        }

        let shard_len = framed.len().div_ceil(k).max(1);
        let mut data_shards: Vec<Vec<u8>> = Vec::with_capacity(k);
        for i in 0..k {
            let start = i * shard_len;
            let end = (start + shard_len).min(framed.len());
            let mut shard = vec![0u8; shard_len];
            if start < framed.len() {
                shard[..end - start].copy_from_slice(&framed[start..end]);
            }
            data_shards.push(shard);
        }

        let rs = ReedSolomon::new(k, p)?;
        let parity_shards = rs.encode_parity(&data_shards)?;

        let segment_count = (k + p) as u16;
        let mut segments = Vec::with_capacity(k + p);
        for (i, shard) in data_shards.into_iter().chain(parity_shards).enumerate() {
            segments.push(Segment {
                stream_kind: stream,
                departure_time_us,
                frame_id,
                segment_index: i as u16,
                segment_count,
                fec_segment_count: p as u16,
                is_nack: false,
                is_duplicate: false,
                prev_frame_duplicate_count: self.prev_frame_duplicate_count,
                group_id,
                bytes: shard,
            });
        }

        Ok(segments)
    }

    /// Linear, unpadded slicing: the last segment simply carries whatever remainder is left, so
    /// concatenation reproduces `bytes` exactly.
    fn segment_without_fec(
        &self,
        stream: StreamKind,
        frame_id: u32,
        group_id: u32,
        departure_time_us: u64,
        bytes: &[u8],
        k: usize,
    ) -> Vec<Segment> {
        let segment_count = k as u16;
        let mut segments = Vec::with_capacity(k);
        for i in 0..k {
            let start = i * MAX_SEGMENT_SIZE;
            let end = (start + MAX_SEGMENT_SIZE).min(bytes.len());
            segments.push(Segment {
                stream_kind: stream,
                departure_time_us,
                frame_id,
                segment_index: i as u16,
                segment_count,
                fec_segment_count: 0,
                is_nack: false,
                is_duplicate: false,
                prev_frame_duplicate_count: self.prev_frame_duplicate_count,
                group_id,
                bytes: bytes[start..end].to_vec(),
            });
        }
        segments
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_frame_has_no_parity_by_default() {
        let segmenter = Segmenter::new();
        let segs = segmenter.segment_frame(StreamKind::Video, 1, 0, 0, b"small frame").unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].fec_segment_count, 0);
    }

    #[test]
    fn large_frame_splits_into_multiple_data_segments() {
        let segmenter = Segmenter::new();
        let bytes = vec![7u8; MAX_SEGMENT_SIZE * 3 + 10];
        let segs = segmenter.segment_frame(StreamKind::Video, 1, 0, 0, &bytes).unwrap();
        assert_eq!(segs.len(), 4);
        assert!(segs.iter().all(|s| s.segment_count == 4 && s.fec_segment_count == 0));
    }

    #[test]
    fn fec_ratio_adds_parity_segments() {
        let mut segmenter = Segmenter::new();
        segmenter.set_fec_ratio(0.25);
        let bytes = vec![1u8; MAX_SEGMENT_SIZE * 4];
        let segs = segmenter.segment_frame(StreamKind::Video, 1, 0, 0, &bytes).unwrap();
        assert!(segs.iter().all(|s| s.fec_segment_count > 0));
        let p = segs[0].fec_segment_count as f64;
        let total = segs.len() as f64;
        assert!(p / total <= MAX_FEC_RATIO + 1e-9);
    }

    #[test]
    fn message_frame_larger_than_one_segment_is_rejected() {
        let segmenter = Segmenter::new();
        let bytes = vec![0u8; MAX_SEGMENT_SIZE * 2];
        assert!(segmenter.segment_frame(StreamKind::Message, 1, 0, 0, &bytes).is_err());
    }
}
