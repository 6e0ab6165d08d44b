//! Wire encoding: the encrypted envelope and the plaintext packet kinds of
//! `spec.md` §6.
//!
//! All multi-byte integers are little-endian, resolving the BE/LE
//! inconsistency in the distilled spec in favor of its own final note
//! ("All multi-byte integers are little-endian on the wire as implemented").
//! Packets are hand-encoded with `to_le_bytes`/`from_le_bytes` in the same
//! manual byte-slicing style as the teacher's `RtpHeader::parse`/`encode`
//! (`bass-rtp/src/rtp/header.rs`), not a derive-based serialization crate.

pub mod envelope;
pub mod packet;

pub use envelope::Envelope;
pub use packet::{Packet, PacketKind, Segment};
