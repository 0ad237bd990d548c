//! # saltpipe
//!
//! A single-process, bidirectional TCP relay that can wrap either leg of
//! every forwarded connection in authenticated-encryption framing.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Connection Engine (accept, handshake, forward, drain)  │
//! ├────────────────────────────┬────────────────────────────┤
//! │  Forward Buffers           │  Framing Codec (BoxStream) │
//! │  (one record per direction)│  (X25519 + XChaCha20-P1305)│
//! ├────────────────────────────┴────────────────────────────┤
//! │  Event Loop (poll(2) readiness over a fixed fd table)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Socket Helpers (non-blocking listen / connect / io)    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Chainable**: three relays back-to-back give an encrypted hop in
//!    the middle of an otherwise cleartext TCP session
//! 2. **Cooperative**: a single thread, driven entirely by readiness
//! 3. **Ordered**: one in-flight chunk per direction gives backpressure with
//!    no multi-record queues
//! 4. **Contained**: a failed connection never takes the listener down

#![warn(rust_2018_idioms)]

pub mod boxstream;
pub mod buffer;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod net;
pub mod relay;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use relay::Relay;
