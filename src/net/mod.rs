//! Socket helpers for the relay.
//!
//! Listeners, non-blocking outbound connects, and thin wrappers over the
//! raw `send`/`recv` syscalls that translate errno into the status
//! taxonomy the rest of the engine speaks. All sockets are non-blocking
//! and close-on-exec; sends carry `MSG_NOSIGNAL` so a dead peer surfaces
//! as `EPIPE` instead of killing the process.

use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{FromRawFd, RawFd};

use crate::error::{Error, Result};

/// Outcome of a single transfer attempt on a non-blocking socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStep {
    /// Bytes transferred
    Bytes(usize),
    /// The socket is not ready; retry after the next readiness signal
    WouldBlock,
    /// Orderly close: read returned zero, or the peer reset the stream
    Closed,
}

/// A byte-stream endpoint the forward buffer can fill from and drain to.
///
/// Implemented by raw sockets and by the framing codec, so the buffer
/// layer does not care whether a leg is encrypted.
pub trait Transport {
    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<IoStep>;

    /// Write up to `buf.len()` bytes.
    fn write(&mut self, buf: &[u8]) -> Result<IoStep>;
}

/// Result of initiating a non-blocking outbound connect.
#[derive(Debug)]
pub enum Connect {
    /// The connect completed immediately
    Established(TcpStream),
    /// `EINPROGRESS`: completion will be reported via writable readiness
    Pending(TcpStream),
}

/// Read from a non-blocking socket.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> Result<IoStep> {
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n >= 0 {
            return Ok(if n == 0 {
                IoStep::Closed
            } else {
                IoStep::Bytes(n as usize)
            });
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return Ok(IoStep::WouldBlock),
            _ => return Err(Error::Network(err)),
        }
    }
}

/// Write to a non-blocking socket with `MSG_NOSIGNAL`.
pub fn send(fd: RawFd, buf: &[u8]) -> Result<IoStep> {
    loop {
        let n = unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) };
        if n >= 0 {
            return Ok(IoStep::Bytes(n as usize));
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return Ok(IoStep::WouldBlock),
            Some(libc::EPIPE) | Some(libc::ECONNRESET) => return Ok(IoStep::Closed),
            _ => return Err(Error::Network(err)),
        }
    }
}

/// Create a non-blocking listening socket on a numeric v4/v6 address.
pub fn listen(addr: &str, port: u16) -> Result<TcpListener> {
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| Error::address(format!("bind address must be numeric: {addr}")))?;

    let listener = TcpListener::bind(SocketAddr::new(ip, port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Initiate a non-blocking connect to the upstream server.
///
/// Resolves `host` synchronously (numeric or named) and tries each
/// candidate address in order. A `0` return from `connect` means the
/// connection is already established; `-1` with `EINPROGRESS` means the
/// kernel will report completion through writable readiness.
pub fn connect(host: &str, port: u16) -> Result<Connect> {
    let candidates = (host, port).to_socket_addrs()?;

    let mut last_err: Option<io::Error> = None;
    for addr in candidates {
        let fd = match nonblocking_socket(&addr) {
            Ok(fd) => fd,
            Err(err) => {
                last_err = Some(err);
                continue;
            }
        };

        let (storage, len) = sockaddr_from(&addr);
        let rc = unsafe { libc::connect(fd, (&storage as *const libc::sockaddr_storage).cast(), len) };
        // Safety: fd is a freshly created, unowned socket descriptor
        let stream = unsafe { TcpStream::from_raw_fd(fd) };

        if rc == 0 {
            return Ok(Connect::Established(stream));
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            return Ok(Connect::Pending(stream));
        }

        last_err = Some(err);
        // stream drops here, closing the socket; try the next candidate
    }

    match last_err {
        Some(err) => Err(Error::Network(err)),
        None => Err(Error::address(format!("no addresses for {host}:{port}"))),
    }
}

/// Query and clear the pending socket-level error (`SO_ERROR`).
///
/// Used when a pending connect reports writable readiness: zero means the
/// connect completed, anything else is the connect failure code.
pub fn socket_error(fd: RawFd) -> Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc == -1 {
        return Err(Error::Network(io::Error::last_os_error()));
    }
    Ok(err)
}

fn nonblocking_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>() = sin;
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in6>() = sin6;
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}
