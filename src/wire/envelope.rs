//! The encrypted envelope every datagram is wrapped in before it touches the
//! socket: `aes_metadata (IV || GCM tag) || payload_len: u32 || ciphertext`.

use crate::crypto::{Cipher, IV_LEN};
use crate::error::{Result, TransportError};

const TAG_LEN: usize = 16;
const HEADER_LEN: usize = IV_LEN + TAG_LEN + 4;

/// An encrypted datagram, ready to hand to a [`crate::net::Link`].
#[derive(Debug, Clone)]
pub struct Envelope {
    bytes: Vec<u8>,
}

impl Envelope {
    /// Encrypt `plaintext` (a [`crate::wire::Packet`]'s encoding) under `cipher`.
    pub fn seal(cipher: &Cipher, plaintext: &[u8]) -> Result<Self> {
        let (iv, tag, ciphertext) = cipher.encrypt(plaintext)?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        bytes.extend_from_slice(&iv);
        bytes.extend_from_slice(&tag);
        bytes.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&ciphertext);
        Ok(Envelope { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Validate `payload_len` against the datagram length before attempting decryption, then
    /// decrypt and authenticate in place.
    pub fn open(cipher: &Cipher, datagram: &[u8]) -> Result<Vec<u8>> {
        if datagram.len() < HEADER_LEN {
            return Err(TransportError::Malformed("datagram shorter than envelope header".into()));
        }
        let iv: [u8; IV_LEN] = datagram[0..IV_LEN].try_into().unwrap();
        let tag: [u8; TAG_LEN] = datagram[IV_LEN..IV_LEN + TAG_LEN].try_into().unwrap();
        let payload_len = u32::from_le_bytes(datagram[IV_LEN + TAG_LEN..HEADER_LEN].try_into().unwrap()) as usize;

        let ciphertext = &datagram[HEADER_LEN..];
        if payload_len != ciphertext.len() {
            return Err(TransportError::Malformed(format!(
                "envelope payload_len {} does not match datagram remainder {}",
                payload_len,
                ciphertext.len()
            )));
        }

        cipher.decrypt(&iv, &tag, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_round_trips() {
        let cipher = Cipher::new(&[7u8; 16]);
        let plaintext = b"hello over the wire";
        let envelope = Envelope::seal(&cipher, plaintext).unwrap();
        let opened = Envelope::open(&cipher, envelope.as_bytes()).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let cipher = Cipher::new(&[7u8; 16]);
        let envelope = Envelope::seal(&cipher, b"integrity matters").unwrap();
        let mut tampered = envelope.as_bytes().to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;
        assert!(Envelope::open(&cipher, &tampered).is_err());
    }

    #[test]
    fn mismatched_payload_len_is_rejected_before_decrypt() {
        let cipher = Cipher::new(&[7u8; 16]);
        let envelope = Envelope::seal(&cipher, b"some payload").unwrap();
        let mut corrupted = envelope.as_bytes().to_vec();
        corrupted.truncate(corrupted.len() - 3);
        assert!(Envelope::open(&cipher, &corrupted).is_err());
    }

    #[test]
    fn short_datagram_is_rejected() {
        let cipher = Cipher::new(&[7u8; 16]);
        assert!(Envelope::open(&cipher, &[0u8; 4]).is_err());
    }
}
