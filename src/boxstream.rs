//! Authenticated-encryption framing over a non-blocking socket.
//!
//! A `BoxStream` wraps one leg's descriptor and presents the same
//! byte-stream interface as a raw socket, while internally exchanging
//! length-prefixed sealed records:
//!
//! ```text
//! u16 length (big endian) | nonce[24] | ciphertext[length]
//! ```
//!
//! `length` counts the ciphertext (plaintext + 16-byte tag) and never
//! exceeds [`MAX_RECORD`]. The handshake is a fixed-size, unframed swap of
//! 32-byte X25519 public keys; each side then derives the same transport
//! key from the Diffie-Hellman result. Every seal draws a fresh random
//! nonce; uniqueness over the key lifetime rests on the 192-bit nonce
//! space.
//!
//! All operations are resumable: partial progress is recorded in byte
//! counters and picked up on the next readiness signal.

use std::os::fd::RawFd;

use tracing::{debug, trace};
use zeroize::Zeroize;

use crate::crypto::{
    derive_transport_key, Aead, EphemeralSecret, Nonce, PublicKey, NONCE_SIZE, PUBLIC_KEY_SIZE,
    TAG_SIZE,
};
use crate::error::{Error, Result};
use crate::net::{self, IoStep, Transport};

/// Largest plaintext carried by a single record.
pub const MAX_PLAINTEXT: usize = 4096;

/// Largest ciphertext length that may appear in a record header.
pub const MAX_RECORD: usize = MAX_PLAINTEXT + TAG_SIZE;

/// Wire header: ciphertext length plus the per-record nonce.
pub const HEADER_SIZE: usize = 2 + NONCE_SIZE;

/// Progress report from a resumable handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Key exchange complete; the codec is in the data phase
    Done,
    /// Waiting for the peer's public key; ask for readable readiness
    WantRead,
    /// The local public key is partially flushed; ask for writable readiness
    WantWrite,
}

/// In-flight public key exchange.
struct KeyExchange {
    secret: EphemeralSecret,
    local_pk: [u8; PUBLIC_KEY_SIZE],
    sent: usize,
    peer_pk: [u8; PUBLIC_KEY_SIZE],
    received: usize,
}

/// Framing codec state for one encrypted leg.
pub struct BoxStream {
    fd: RawFd,
    exchange: Option<KeyExchange>,
    cipher: Option<Aead>,

    // Inbound record pipeline
    header: [u8; HEADER_SIZE],
    header_received: usize,
    record_len: usize,
    ciphertext: [u8; MAX_RECORD],
    ciphertext_received: usize,
    plaintext: Vec<u8>,
    plaintext_pos: usize,

    // Outbound record pipeline
    wire: Vec<u8>,
    wire_sent: usize,
    staged_plaintext: usize,
}

impl BoxStream {
    /// Create a codec for the given descriptor and draw its keypair.
    pub fn new(fd: RawFd) -> Self {
        let secret = EphemeralSecret::random();
        let local_pk = PublicKey::from(&secret).to_bytes();

        Self {
            fd,
            exchange: Some(KeyExchange {
                secret,
                local_pk,
                sent: 0,
                peer_pk: [0u8; PUBLIC_KEY_SIZE],
                received: 0,
            }),
            cipher: None,
            header: [0u8; HEADER_SIZE],
            header_received: 0,
            record_len: 0,
            ciphertext: [0u8; MAX_RECORD],
            ciphertext_received: 0,
            plaintext: Vec::new(),
            plaintext_pos: 0,
            wire: Vec::with_capacity(HEADER_SIZE + MAX_RECORD),
            wire_sent: 0,
            staged_plaintext: 0,
        }
    }

    /// Whether the key exchange has completed.
    pub fn is_established(&self) -> bool {
        self.cipher.is_some()
    }

    /// Drive the key exchange one step.
    ///
    /// Sends the remaining local public-key bytes, then accumulates the
    /// peer's. Partial progress suspends with [`HandshakeStatus::WantRead`]
    /// or [`HandshakeStatus::WantWrite`]; a read-zero at any point is a
    /// handshake failure. Once both keys have crossed, the transport key
    /// is derived and the codec enters the data phase.
    pub fn handshake(&mut self) -> Result<HandshakeStatus> {
        let Some(hs) = self.exchange.as_mut() else {
            return Ok(HandshakeStatus::Done);
        };

        while hs.sent < PUBLIC_KEY_SIZE {
            match net::send(self.fd, &hs.local_pk[hs.sent..])? {
                IoStep::Bytes(n) => hs.sent += n,
                IoStep::WouldBlock => return Ok(HandshakeStatus::WantWrite),
                IoStep::Closed => {
                    return Err(Error::handshake("peer closed during key exchange"))
                }
            }
        }

        while hs.received < PUBLIC_KEY_SIZE {
            match net::recv(self.fd, &mut hs.peer_pk[hs.received..])? {
                IoStep::Bytes(n) => hs.received += n,
                IoStep::WouldBlock => return Ok(HandshakeStatus::WantRead),
                IoStep::Closed => {
                    return Err(Error::handshake("peer closed during key exchange"))
                }
            }
        }

        let Some(hs) = self.exchange.take() else {
            return Ok(HandshakeStatus::Done);
        };

        let peer = PublicKey::from_bytes(hs.peer_pk);
        let shared = hs.secret.diffie_hellman(&peer);
        self.cipher = Some(Aead::new(&derive_transport_key(&shared)));

        debug!(fd = self.fd, "key exchange complete");
        Ok(HandshakeStatus::Done)
    }

    /// Reset the inbound pipeline after a record is fully delivered.
    fn reset_inbound(&mut self) {
        self.header.zeroize();
        self.header_received = 0;
        self.record_len = 0;
        self.ciphertext.zeroize();
        self.ciphertext_received = 0;
        self.plaintext.zeroize();
        self.plaintext.clear();
        self.plaintext_pos = 0;
    }

    fn cipher(&self) -> Result<&Aead> {
        self.cipher
            .as_ref()
            .ok_or_else(|| Error::handshake("codec used before key exchange"))
    }
}

impl Transport for BoxStream {
    /// Receive decrypted bytes.
    ///
    /// Drives the four-phase inbound pipeline: header accumulation,
    /// ciphertext accumulation, authenticated open, plaintext drain. At
    /// most one record is decoded at a time; the caller receives up to
    /// `min(buf.len(), remaining plaintext)` bytes per call.
    fn read(&mut self, buf: &mut [u8]) -> Result<IoStep> {
        if self.plaintext_pos == self.plaintext.len() {
            while self.header_received < HEADER_SIZE {
                match net::recv(self.fd, &mut self.header[self.header_received..])? {
                    IoStep::Bytes(n) => self.header_received += n,
                    other => return Ok(other),
                }
            }

            if self.record_len == 0 {
                let len = u16::from_be_bytes([self.header[0], self.header[1]]) as usize;
                if !(TAG_SIZE..=MAX_RECORD).contains(&len) {
                    return Err(Error::crypto(format!("bad record length {len}")));
                }
                self.record_len = len;
                trace!(fd = self.fd, len, "record header complete");
            }

            while self.ciphertext_received < self.record_len {
                let window = &mut self.ciphertext[self.ciphertext_received..self.record_len];
                match net::recv(self.fd, window)? {
                    IoStep::Bytes(n) => self.ciphertext_received += n,
                    other => return Ok(other),
                }
            }

            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&self.header[2..]);
            self.plaintext = self
                .cipher()?
                .open(&Nonce::from_bytes(nonce), &self.ciphertext[..self.record_len])?;
            self.plaintext_pos = 0;
            trace!(fd = self.fd, len = self.plaintext.len(), "record opened");
        }

        let n = buf.len().min(self.plaintext.len() - self.plaintext_pos);
        buf[..n].copy_from_slice(&self.plaintext[self.plaintext_pos..self.plaintext_pos + n]);
        self.plaintext_pos += n;

        if self.plaintext_pos == self.plaintext.len() {
            self.reset_inbound();
        }

        Ok(IoStep::Bytes(n))
    }

    /// Send plaintext as one sealed record.
    ///
    /// When no record is staged, clamps the input to [`MAX_PLAINTEXT`],
    /// seals it under a fresh random nonce, and stages header + nonce +
    /// ciphertext contiguously. The staged record is then drained across
    /// calls; the clamped plaintext length is credited only once the whole
    /// record is on the wire.
    fn write(&mut self, buf: &[u8]) -> Result<IoStep> {
        if self.wire.is_empty() {
            let take = buf.len().min(MAX_PLAINTEXT);
            let nonce = Nonce::random();
            let sealed = self.cipher()?.seal(&nonce, &buf[..take])?;
            debug_assert!(sealed.len() <= MAX_RECORD);

            self.wire.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
            self.wire.extend_from_slice(nonce.as_bytes());
            self.wire.extend_from_slice(&sealed);
            self.wire_sent = 0;
            self.staged_plaintext = take;
            trace!(fd = self.fd, plaintext = take, wire = self.wire.len(), "record staged");
        }

        while self.wire_sent < self.wire.len() {
            match net::send(self.fd, &self.wire[self.wire_sent..])? {
                IoStep::Bytes(n) => self.wire_sent += n,
                other => return Ok(other),
            }
        }

        let credited = self.staged_plaintext;
        self.wire.zeroize();
        self.wire.clear();
        self.wire_sent = 0;
        self.staged_plaintext = 0;

        Ok(IoStep::Bytes(credited))
    }
}
