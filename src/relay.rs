//! The connection engine.
//!
//! A [`Relay`] owns the listening socket, the readiness table, and every
//! live connection pair. Pairs live in a slot table keyed by a stable
//! index; the event table tags each registered descriptor with a
//! [`Token`] naming either the listener or one leg of one pair, and
//! dispatch matches on the leg's lifecycle phase:
//!
//! ```text
//! accept → [pending connect] → [handshake]* → forward → half-close → drop
//! ```
//!
//! Per-connection failures (upstream refused, handshake failure, crypto
//! error, table capacity) tear down one pair and leave the listener
//! running. Only listener failures and poll failures end the run loop.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::boxstream::{BoxStream, HandshakeStatus};
use crate::buffer::{ForwardBuffer, TransferStatus};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::event::{EventLoop, Interest, Readiness};
use crate::net::{self, Connect, IoStep, Transport};

/// Poll timeout. Bounds how long shutdown can lag the run flag when no
/// traffic is flowing.
const POLL_INTERVAL_MS: i32 = 500;

/// Which leg of a pair a registration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The accepted, client-facing socket
    Client,
    /// The outbound, server-facing socket
    Server,
}

impl Side {
    fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Event table tag.
#[derive(Debug, Clone, Copy)]
enum Token {
    Listener,
    Conn { id: usize, side: Side },
}

/// Per-leg lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Outbound connect in flight; waiting for writable readiness
    PendingConnect,
    /// Key exchange in progress on an encrypted leg
    Handshake,
    /// Shuttling bytes
    Forward,
}

/// One socket of a connection pair.
struct Leg {
    /// `None` once the leg has half-closed
    socket: Option<TcpStream>,
    encrypted: bool,
    codec: Option<BoxStream>,
    phase: Phase,
}

impl Leg {
    fn new(socket: TcpStream, encrypted: bool, phase: Phase) -> Self {
        Self {
            socket: Some(socket),
            encrypted,
            codec: None,
            phase,
        }
    }

    fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }
}

impl Transport for Leg {
    fn read(&mut self, buf: &mut [u8]) -> Result<IoStep> {
        match (&mut self.codec, &self.socket) {
            (Some(codec), _) => codec.read(buf),
            (None, Some(socket)) => net::recv(socket.as_raw_fd(), buf),
            (None, None) => Ok(IoStep::Closed),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<IoStep> {
        match (&mut self.codec, &self.socket) {
            (Some(codec), _) => codec.write(buf),
            (None, Some(socket)) => net::send(socket.as_raw_fd(), buf),
            (None, None) => Ok(IoStep::Closed),
        }
    }
}

/// The two legs of one forwarded connection and their forward buffers.
struct Pair {
    client: Leg,
    server: Leg,
    /// Bytes headed to the client leg (filled by server-side receives)
    to_client: ForwardBuffer,
    /// Bytes headed to the server leg (filled by client-side receives)
    to_server: ForwardBuffer,
}

impl Pair {
    fn leg(&self, side: Side) -> &Leg {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    fn leg_mut(&mut self, side: Side) -> &mut Leg {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    /// The receiving leg together with the buffer it fills (the one
    /// destined for its peer).
    fn recv_parts(&mut self, side: Side) -> (&mut Leg, &mut ForwardBuffer) {
        match side {
            Side::Client => (&mut self.client, &mut self.to_server),
            Side::Server => (&mut self.server, &mut self.to_client),
        }
    }

    /// The sending leg together with its own outbound buffer.
    fn send_parts(&mut self, side: Side) -> (&mut Leg, &mut ForwardBuffer) {
        match side {
            Side::Client => (&mut self.client, &mut self.to_client),
            Side::Server => (&mut self.server, &mut self.to_server),
        }
    }

    /// The buffer whose contents are destined for `side`.
    fn outbound(&self, side: Side) -> &ForwardBuffer {
        match side {
            Side::Client => &self.to_client,
            Side::Server => &self.to_server,
        }
    }
}

/// Slot table of live pairs; indices stay stable until removal.
struct PairTable {
    slots: Vec<Option<Pair>>,
    free: Vec<usize>,
}

impl PairTable {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, pair: Pair) -> usize {
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(pair);
                id
            }
            None => {
                self.slots.push(Some(pair));
                self.slots.len() - 1
            }
        }
    }

    fn get_mut(&mut self, id: usize) -> Option<&mut Pair> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    fn remove(&mut self, id: usize) -> Option<Pair> {
        let pair = self.slots.get_mut(id).and_then(Option::take);
        if pair.is_some() {
            self.free.push(id);
        }
        pair
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn ids(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, s)| s.as_ref().map(|_| id))
            .collect()
    }
}

/// A bound relay, ready to run.
pub struct Relay {
    config: RelayConfig,
    listener: TcpListener,
    events: EventLoop<Token>,
    pairs: PairTable,
}

impl Relay {
    /// Bind the listener described by `config`.
    pub fn bind(config: RelayConfig) -> Result<Self> {
        let listener = net::listen(&config.bind_addr, config.bind_port)?;
        Ok(Self {
            config,
            listener,
            events: EventLoop::new(),
            pairs: PairTable::new(),
        })
    }

    /// The bound listener address (resolves port 0 binds).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of live connection pairs.
    pub fn active_pairs(&self) -> usize {
        self.pairs.len()
    }

    /// Run the engine until `run_flag` goes false or a fatal error.
    ///
    /// On exit, clean or not, every pair is destroyed and the event
    /// table emptied; the listener stays bound so `run` can be called
    /// again.
    pub fn run(&mut self, run_flag: &AtomicBool) -> Result<()> {
        self.events
            .add(self.listener.as_raw_fd(), Interest::Readable, Token::Listener)?;
        info!(
            "relaying {} -> {}:{} (client leg {}, server leg {})",
            self.local_addr()?,
            self.config.server_addr,
            self.config.server_port,
            if self.config.encrypt_client { "encrypted" } else { "clear" },
            if self.config.encrypt_server { "encrypted" } else { "clear" },
        );

        let result = self.serve(run_flag);

        for id in self.pairs.ids() {
            self.destroy_pair(id);
        }
        let _ = self.events.remove(self.listener.as_raw_fd());

        result
    }

    fn serve(&mut self, run_flag: &AtomicBool) -> Result<()> {
        while run_flag.load(Ordering::Relaxed) {
            if self.events.wait(POLL_INTERVAL_MS)? == 0 {
                continue;
            }

            let mut idx = 0;
            while idx < self.events.high_water() {
                if let Some((fd, ready, token)) = self.events.ready(idx) {
                    match token {
                        Token::Listener => self.on_listener(ready)?,
                        Token::Conn { id, side } => self.on_conn(id, side, fd, ready)?,
                    }
                }
                idx += 1;
            }
        }

        info!("run flag cleared; shutting down");
        Ok(())
    }

    /// Listener readiness: accept one client and start its pair.
    fn on_listener(&mut self, ready: Readiness) -> Result<()> {
        if ready.error() || ready.hangup() || ready.invalid() || ready.writable() {
            return Err(Error::Listener(format!("unexpected readiness {ready:?}")));
        }
        if !ready.readable() {
            return Ok(());
        }

        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                return match err.raw_os_error() {
                    Some(libc::ECONNABORTED) | Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => {
                        debug!("transient accept failure: {err}");
                        Ok(())
                    }
                    _ => Err(Error::Listener(err.to_string())),
                };
            }
        };
        debug!("accepted client {peer}");

        if let Err(err) = self.start_pair(stream) {
            // Keep listening: this client is dropped, the relay is fine.
            info!("dropping new connection: {err}");
        }
        Ok(())
    }

    /// Build a pair for an accepted client and initiate the upstream
    /// connect. Any failure here is connection-scoped.
    fn start_pair(&mut self, client_stream: TcpStream) -> Result<()> {
        client_stream.set_nonblocking(true)?;

        let (server_stream, pending) =
            match net::connect(&self.config.server_addr, self.config.server_port)? {
                Connect::Established(s) => (s, false),
                Connect::Pending(s) => (s, true),
            };
        let server_fd = server_stream.as_raw_fd();

        let server_phase = if pending {
            Phase::PendingConnect
        } else {
            Phase::Forward
        };
        let pair = Pair {
            client: Leg::new(client_stream, self.config.encrypt_client, Phase::Forward),
            server: Leg::new(server_stream, self.config.encrypt_server, server_phase),
            to_client: ForwardBuffer::new(),
            to_server: ForwardBuffer::new(),
        };
        let id = self.pairs.insert(pair);

        let registered = if pending {
            self.events
                .add(server_fd, Interest::Writable, Token::Conn { id, side: Side::Server })
        } else {
            self.register_data_events(id)
        };

        if let Err(err) = registered {
            self.destroy_pair(id);
            return Err(err);
        }

        debug!(id, pending, "pair created");
        Ok(())
    }

    /// Register both legs for data flow: encrypted legs start their
    /// handshake (writable first: the public key goes out immediately),
    /// cleartext legs go straight to forwarding.
    fn register_data_events(&mut self, id: usize) -> Result<()> {
        self.register_leg(id, Side::Client)?;
        self.register_leg(id, Side::Server)?;
        Ok(())
    }

    fn register_leg(&mut self, id: usize, side: Side) -> Result<()> {
        let Some(pair) = self.pairs.get_mut(id) else {
            return Ok(());
        };
        let leg = pair.leg_mut(side);
        let Some(fd) = leg.fd() else {
            return Ok(());
        };

        if leg.encrypted {
            if leg.codec.is_none() {
                leg.codec = Some(BoxStream::new(fd));
            }
            leg.phase = Phase::Handshake;
            self.events
                .add(fd, Interest::Writable, Token::Conn { id, side })
        } else {
            leg.phase = Phase::Forward;
            self.events
                .add(fd, Interest::Readable, Token::Conn { id, side })
        }
    }

    fn on_conn(&mut self, id: usize, side: Side, fd: RawFd, ready: Readiness) -> Result<()> {
        let Some(pair) = self.pairs.get_mut(id) else {
            // `ready` skips slots vacated within this sweep, so a missing
            // pair means the table and the pair store disagree.
            return Err(Error::StaleEntry(fd));
        };

        match pair.leg(side).phase {
            Phase::PendingConnect => self.on_pending_connect(id, fd, ready),
            Phase::Handshake => self.on_handshake(id, side, ready),
            Phase::Forward => self.on_forward(id, side, fd, ready),
        }
    }

    /// Writable readiness on a leg whose connect is in flight.
    fn on_pending_connect(&mut self, id: usize, fd: RawFd, ready: Readiness) -> Result<()> {
        if ready.invalid() {
            self.destroy_pair(id);
            return Ok(());
        }
        if !(ready.error() || ready.hangup() || ready.writable()) {
            return Ok(());
        }

        match net::socket_error(fd) {
            Err(err) => {
                warn!("SO_ERROR query failed: {err}");
                self.destroy_pair(id);
            }
            Ok(code) if code != 0 => {
                info!(
                    "upstream connect failed: {}",
                    io::Error::from_raw_os_error(code)
                );
                self.destroy_pair(id);
            }
            Ok(_) => {
                // Connect complete: swap the pending registration for the
                // two data registrations.
                let _ = self.events.remove(fd);
                if let Err(err) = self.register_data_events(id) {
                    info!("dropping connection: {err}");
                    self.destroy_pair(id);
                }
            }
        }
        Ok(())
    }

    /// Drive one step of an encrypted leg's key exchange.
    fn on_handshake(&mut self, id: usize, side: Side, ready: Readiness) -> Result<()> {
        if ready.error() || ready.hangup() || ready.invalid() {
            debug!(id, ?side, "handshake leg failed ({ready:?})");
            self.destroy_pair(id);
            return Ok(());
        }

        let Some(pair) = self.pairs.get_mut(id) else {
            return Ok(());
        };
        // Once established, start writable if forwarded bytes are already
        // waiting for this leg.
        let interest_after = if pair.outbound(side).is_empty() {
            Interest::Readable
        } else {
            Interest::Writable
        };

        let leg = pair.leg_mut(side);
        let (Some(fd), Some(codec)) = (leg.fd(), leg.codec.as_mut()) else {
            self.destroy_pair(id);
            return Ok(());
        };

        match codec.handshake() {
            Ok(HandshakeStatus::Done) => {
                leg.phase = Phase::Forward;
                let _ = self.events.remove(fd);
                if let Err(err) = self.events.add(fd, interest_after, Token::Conn { id, side }) {
                    info!("dropping connection: {err}");
                    self.destroy_pair(id);
                }
                Ok(())
            }
            Ok(HandshakeStatus::WantRead) => self.events.modify(fd, Interest::Readable),
            Ok(HandshakeStatus::WantWrite) => self.events.modify(fd, Interest::Writable),
            Err(err) => {
                info!(id, ?side, "handshake failed: {err}");
                self.destroy_pair(id);
                Ok(())
            }
        }
    }

    /// Forwarding leg readiness: receive before send, so bytes that just
    /// arrived get their transmission scheduled within the same wake.
    fn on_forward(&mut self, id: usize, side: Side, fd: RawFd, ready: Readiness) -> Result<()> {
        if ready.invalid() {
            warn!("closed socket {fd} still in the event table");
            return Err(Error::StaleEntry(fd));
        }
        if ready.error() || ready.hangup() {
            debug!(id, ?side, "leg error/hangup ({ready:?})");
            self.destroy_pair(id);
            return Ok(());
        }

        let mut alive = true;
        if ready.readable() {
            alive = self.handle_recv(id, side)?;
        }
        if alive && ready.writable() {
            self.handle_send(id, side)?;
        }
        Ok(())
    }

    /// Receive from side `side` into the buffer headed for its peer.
    ///
    /// Returns whether the pair is still alive.
    fn handle_recv(&mut self, id: usize, side: Side) -> Result<bool> {
        let (status, buffered) = {
            let Some(pair) = self.pairs.get_mut(id) else {
                return Ok(false);
            };
            let (leg, buf) = pair.recv_parts(side);

            // Backpressure: the previous chunk has not been forwarded yet.
            if !buf.is_empty() {
                return Ok(true);
            }

            let status = buf.fill_from(leg);
            let buffered = !buf.is_empty();
            (status, buffered)
        };

        let status = match status {
            Ok(status) => status,
            Err(err) => {
                info!(id, ?side, "recv failed: {err}");
                self.destroy_pair(id);
                return Ok(false);
            }
        };

        match status {
            // Spurious wake or input fully drained for now
            TransferStatus::WouldBlock => Ok(true),

            TransferStatus::Disconnected if !buffered => {
                debug!(id, ?side, "disconnect with nothing pending");
                self.destroy_pair(id);
                Ok(false)
            }

            TransferStatus::Complete | TransferStatus::Disconnected => {
                if status == TransferStatus::Disconnected {
                    // Half-close: this leg is done, but the peer still owes
                    // the bytes that arrived with the close.
                    debug!(id, ?side, "disconnect with pending data; draining peer");
                    self.half_close_leg(id, side);
                }

                let peer_fd = self
                    .pairs
                    .get_mut(id)
                    .and_then(|p| p.leg(side.peer()).fd());
                match peer_fd {
                    Some(peer_fd) => {
                        // Wake the peer for writing; its next turn drains
                        // the chunk we just staged.
                        self.events.modify(peer_fd, Interest::Both)?;
                        Ok(true)
                    }
                    None => {
                        debug!(id, "peer already closed; nothing can drain");
                        self.destroy_pair(id);
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Drain side `side`'s own outbound buffer.
    fn handle_send(&mut self, id: usize, side: Side) -> Result<()> {
        let status = {
            let Some(pair) = self.pairs.get_mut(id) else {
                return Ok(());
            };
            let (leg, buf) = pair.send_parts(side);
            if buf.is_empty() {
                return Ok(()); // spurious writable
            }
            buf.drain_to(leg)
        };

        let status = match status {
            Ok(status) => status,
            Err(err) => {
                info!(id, ?side, "send failed: {err}");
                self.destroy_pair(id);
                return Ok(());
            }
        };

        match status {
            TransferStatus::WouldBlock => Ok(()),
            TransferStatus::Disconnected => {
                debug!(id, ?side, "peer reset while draining");
                self.destroy_pair(id);
                Ok(())
            }
            TransferStatus::Complete => {
                let Some(pair) = self.pairs.get_mut(id) else {
                    return Ok(());
                };
                if pair.leg(side.peer()).socket.is_none() {
                    // That was the final flush after the peer's disconnect.
                    debug!(id, ?side, "flushed residual bytes; closing");
                    self.destroy_pair(id);
                    Ok(())
                } else {
                    let Some(fd) = pair.leg(side).fd() else {
                        self.destroy_pair(id);
                        return Ok(());
                    };
                    self.events.modify(fd, Interest::Readable)
                }
            }
        }
    }

    /// Detach and close one leg while the pair lives on to drain.
    fn half_close_leg(&mut self, id: usize, side: Side) {
        if let Some(pair) = self.pairs.get_mut(id) {
            let leg = pair.leg_mut(side);
            if let Some(socket) = leg.socket.take() {
                let _ = self.events.remove(socket.as_raw_fd());
            }
            leg.codec = None;
        }
    }

    /// Tear down one pair: unregister both legs and drop everything.
    fn destroy_pair(&mut self, id: usize) {
        if let Some(mut pair) = self.pairs.remove(id) {
            for leg in [&mut pair.client, &mut pair.server] {
                if let Some(socket) = leg.socket.take() {
                    let _ = self.events.remove(socket.as_raw_fd());
                }
            }
            debug!(id, "pair destroyed");
            // Sockets closed on drop above; buffers and codec state drop
            // with the pair.
        }
    }
}
