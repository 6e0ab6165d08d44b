//! AES-128-GCM wrapper around the `aes-gcm` crate.
//!
//! The wire format's envelope carries a 16-byte IV field (§6), but the crate's `Aes128Gcm`
//! nonce is fixed at 96 bits; we draw the full 16 random bytes for the field and use only the
//! first 12 as the actual GCM nonce, leaving the last 4 reserved and unused. This keeps the
//! on-wire layout byte-for-byte as specified while staying on the standard crate's nonce size.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::{Result, TransportError};

pub const IV_LEN: usize = 16;
const GCM_NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A bound AES-128-GCM key, ready to seal or open envelopes.
pub struct Cipher {
    inner: Aes128Gcm,
}

impl Cipher {
    pub fn new(key: &[u8; 16]) -> Self {
        let key = Key::<Aes128Gcm>::from_slice(key);
        Cipher { inner: Aes128Gcm::new(key) }
    }

    /// Returns `(iv, tag, ciphertext)`. `ciphertext` excludes the tag, which `aes-gcm` appends
    /// to its output by default; we split it off here so the wire format can place the tag in
    /// the fixed-size envelope header ahead of the variable-length ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<([u8; IV_LEN], [u8; TAG_LEN], Vec<u8>)> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv[..GCM_NONCE_LEN]);

        let mut sealed = self
            .inner
            .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
            .map_err(|_| TransportError::Fatal("AES-GCM encryption failed".into()))?;

        let tag_start = sealed.len() - TAG_LEN;
        let tag_bytes = sealed.split_off(tag_start);
        let tag: [u8; TAG_LEN] = tag_bytes.try_into().unwrap();
        Ok((iv, tag, sealed))
    }

    pub fn decrypt(&self, iv: &[u8; IV_LEN], tag: &[u8; TAG_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(&iv[..GCM_NONCE_LEN]);
        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        self.inner
            .decrypt(nonce, Payload { msg: &sealed, aad: &[] })
            .map_err(|_| TransportError::Malformed("AES-GCM authentication failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cipher = Cipher::new(&[1u8; 16]);
        let (iv, tag, ciphertext) = cipher.encrypt(b"the quick brown fox").unwrap();
        let plaintext = cipher.decrypt(&iv, &tag, &ciphertext).unwrap();
        assert_eq!(plaintext, b"the quick brown fox");
    }

    #[test]
    fn different_keys_cannot_decrypt_each_other() {
        let a = Cipher::new(&[1u8; 16]);
        let b = Cipher::new(&[2u8; 16]);
        let (iv, tag, ciphertext) = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&iv, &tag, &ciphertext).is_err());
    }

    #[test]
    fn ivs_are_not_reused_across_calls() {
        let cipher = Cipher::new(&[3u8; 16]);
        let (iv1, _, _) = cipher.encrypt(b"one").unwrap();
        let (iv2, _, _) = cipher.encrypt(b"two").unwrap();
        assert_ne!(iv1, iv2);
    }
}
