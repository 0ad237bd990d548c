//! Authenticated encryption for wire records.
//!
//! Uses XChaCha20-Poly1305, the extended-nonce variant of ChaCha20-Poly1305.
//! The 192-bit nonce is wide enough to draw at random for every record
//! without meaningful collision risk over the lifetime of a key, which is
//! exactly how the framing layer uses it.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit},
    XChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{SecureRandom, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for AeadKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A per-record nonce.
///
/// Must be unique for each seal under the same key. Every record carries
/// a freshly sampled nonce in its header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Draw a fresh random nonce from the OS CSPRNG.
    pub fn random() -> Self {
        Self(SecureRandom::bytes())
    }

    /// Create a nonce from raw bytes (the receive path, off the wire).
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// XChaCha20-Poly1305 cipher bound to one transport key.
pub struct Aead {
    cipher: XChaCha20Poly1305,
}

impl Aead {
    /// Create a new AEAD instance with the given key.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Seal a plaintext record.
    ///
    /// Returns ciphertext || tag (16 bytes appended).
    pub fn seal(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(nonce.as_bytes().into(), plaintext)
            .map_err(|_| Error::crypto("sealing failed"))
    }

    /// Open a sealed record.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if authentication fails (wrong key, wrong
    /// nonce, tampered ciphertext).
    pub fn open(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::crypto(format!(
                "ciphertext shorter than tag: {} bytes",
                ciphertext.len()
            )));
        }

        self.cipher
            .decrypt(nonce.as_bytes().into(), ciphertext)
            .map_err(|_| Error::crypto("authentication failed"))
    }
}

/// Calculate the ciphertext length for a given plaintext length.
pub const fn sealed_len(plaintext_len: usize) -> usize {
    plaintext_len + TAG_SIZE
}
