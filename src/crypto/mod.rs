//! Cryptographic primitives for the relay.
//!
//! This module provides:
//! - X25519 Elliptic Curve Diffie-Hellman key exchange
//! - XChaCha20-Poly1305 authenticated encryption (secretbox-style)
//! - HKDF key derivation for the transport key
//! - Secure random number generation
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod aead;
mod kdf;
mod keys;
mod random;

pub use aead::{Aead, AeadKey, Nonce};
pub use kdf::derive_transport_key;
pub use keys::{EphemeralSecret, PublicKey, SharedSecret};
pub use random::SecureRandom;

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (192 bits for XChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 24;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of X25519 public keys in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;
