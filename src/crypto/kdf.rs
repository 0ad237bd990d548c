//! Key derivation.
//!
//! Uses HKDF (HMAC-based Key Derivation Function) with SHA-256 to turn the
//! raw X25519 shared secret into the symmetric transport key. Both legs of
//! a handshake derive the same key, so a single derivation covers both
//! directions, matching the secretbox precomputed-key model.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::crypto::{AeadKey, SharedSecret, KEY_SIZE};

/// Domain separation for the transport key derivation.
const KDF_SALT: &[u8] = b"saltpipe/v1";
const KDF_INFO: &[u8] = b"transport key";

/// Derive the symmetric transport key from a DH shared secret.
///
/// Deterministic: both peers derive the identical key from the identical
/// shared secret.
pub fn derive_transport_key(shared: &SharedSecret) -> AeadKey {
    let hkdf = Hkdf::<Sha256>::new(Some(KDF_SALT), shared.as_bytes());

    let mut okm = [0u8; KEY_SIZE];
    // 32-byte output is always a valid HKDF-SHA256 length
    hkdf.expand(KDF_INFO, &mut okm)
        .expect("HKDF output length is valid");

    AeadKey::from_bytes(okm)
}
