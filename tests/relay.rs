//! End-to-end relay scenarios over real sockets.
//!
//! Each test binds an ephemeral listener, runs the engine on a background
//! thread, and drives it with ordinary blocking clients. Encrypted-leg
//! tests chain two relays (`-o` into `-i`) or speak the framing directly
//! through `BoxStream`.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::RngCore;

use saltpipe::boxstream::{BoxStream, HandshakeStatus, MAX_PLAINTEXT};
use saltpipe::net::{IoStep, Transport};
use saltpipe::{Relay, RelayConfig};

struct RelayHandle {
    port: u16,
    run: Arc<AtomicBool>,
    thread: JoinHandle<saltpipe::Result<()>>,
}

impl RelayHandle {
    /// Clear the run flag and wait for a clean exit.
    fn stop(self) {
        self.run.store(false, Ordering::Relaxed);
        self.thread
            .join()
            .expect("relay thread panicked")
            .expect("relay exited with an error");
    }
}

fn spawn_relay(
    bind_addr: &str,
    upstream: (&str, u16),
    encrypt_client: bool,
    encrypt_server: bool,
) -> RelayHandle {
    let config = RelayConfig {
        bind_addr: bind_addr.to_string(),
        bind_port: 0,
        server_addr: upstream.0.to_string(),
        server_port: upstream.1,
        encrypt_client,
        encrypt_server,
    };

    let mut relay = Relay::bind(config).expect("bind relay");
    let port = relay.local_addr().unwrap().port();

    let run = Arc::new(AtomicBool::new(true));
    let run_flag = Arc::clone(&run);
    let thread = thread::spawn(move || relay.run(&run_flag));

    RelayHandle { port, run, thread }
}

/// Echo server: every accepted connection echoes until EOF.
fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}

fn connect_client(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    stream
}

/// Connect and complete the framing handshake as a client.
fn encrypted_client(port: u16) -> (TcpStream, BoxStream) {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_nonblocking(true).unwrap();

    let mut codec = BoxStream::new(stream.as_raw_fd());
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match codec.handshake().unwrap() {
            HandshakeStatus::Done => break,
            _ => {
                assert!(Instant::now() < deadline, "handshake timed out");
                thread::sleep(Duration::from_millis(2));
            }
        }
    }

    (stream, codec)
}

fn codec_write_all(codec: &mut BoxStream, mut data: &[u8]) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !data.is_empty() {
        assert!(Instant::now() < deadline, "write timed out");
        match codec.write(data).unwrap() {
            IoStep::Bytes(n) => data = &data[n..],
            IoStep::WouldBlock => thread::sleep(Duration::from_millis(1)),
            IoStep::Closed => panic!("peer closed mid-write"),
        }
    }
}

fn codec_read_exact(codec: &mut BoxStream, len: usize) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 4096];
    while out.len() < len {
        assert!(Instant::now() < deadline, "read timed out");
        match codec.read(&mut buf).unwrap() {
            IoStep::Bytes(n) => out.extend_from_slice(&buf[..n]),
            IoStep::WouldBlock => thread::sleep(Duration::from_millis(1)),
            IoStep::Closed => break,
        }
    }
    out
}

/// EOF or a reset both count as the relay hanging up on us.
fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == ErrorKind::ConnectionReset => break,
            Err(err) => panic!("unexpected read error: {err}"),
        }
    }
    out
}

#[test]
fn cleartext_echo_roundtrip() {
    let echo = spawn_echo_server();
    let relay = spawn_relay("127.0.0.1", ("127.0.0.1", echo), false, false);

    let mut client = connect_client(relay.port);
    client.write_all(b"hello\n").unwrap();

    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello\n");

    drop(client);
    relay.stop();
}

#[test]
fn encrypted_chain_preserves_large_payload() {
    // client --clear--> A --encrypted--> B --clear--> echo
    let echo = spawn_echo_server();
    let relay_b = spawn_relay("127.0.0.1", ("127.0.0.1", echo), true, false);
    let relay_a = spawn_relay("127.0.0.1", ("127.0.0.1", relay_b.port), false, true);

    let mut payload = vec![0u8; 1 << 20];
    rand::thread_rng().fill_bytes(&mut payload);

    let mut client = connect_client(relay_a.port);
    let mut writer = client.try_clone().unwrap();
    let to_send = payload.clone();
    let writer_thread = thread::spawn(move || {
        writer.write_all(&to_send).unwrap();
    });

    let mut got = vec![0u8; payload.len()];
    client.read_exact(&mut got).unwrap();
    writer_thread.join().unwrap();

    assert_eq!(got, payload, "payload corrupted in transit");

    drop(client);
    relay_a.stop();
    relay_b.stop();
}

#[test]
fn three_relay_chain_with_encrypted_middle() {
    // client --clear--> A --enc--> B --enc--> C --clear--> echo
    let echo = spawn_echo_server();
    let relay_c = spawn_relay("127.0.0.1", ("127.0.0.1", echo), true, false);
    let relay_b = spawn_relay("127.0.0.1", ("127.0.0.1", relay_c.port), true, true);
    let relay_a = spawn_relay("127.0.0.1", ("127.0.0.1", relay_b.port), false, true);

    let mut payload = vec![0u8; 256 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    let mut client = connect_client(relay_a.port);
    let mut writer = client.try_clone().unwrap();
    let to_send = payload.clone();
    let writer_thread = thread::spawn(move || {
        writer.write_all(&to_send).unwrap();
    });

    let mut got = vec![0u8; payload.len()];
    client.read_exact(&mut got).unwrap();
    writer_thread.join().unwrap();

    assert_eq!(got, payload);

    drop(client);
    relay_a.stop();
    relay_b.stop();
    relay_c.stop();
}

#[test]
fn zero_byte_client_sees_clean_upstream_close() {
    // Upstream records exactly what it received before EOF.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = listener.local_addr().unwrap().port();
    let upstream = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut got = Vec::new();
        stream.read_to_end(&mut got).unwrap();
        got
    });

    let relay = spawn_relay("127.0.0.1", ("127.0.0.1", upstream_port), false, false);

    let client = connect_client(relay.port);
    drop(client); // no payload at all

    assert!(upstream.join().unwrap().is_empty());
    relay.stop();
}

#[test]
fn single_encrypted_leg_with_codec_client() {
    let echo = spawn_echo_server();
    let relay = spawn_relay("127.0.0.1", ("127.0.0.1", echo), true, false);

    let (_stream, mut codec) = encrypted_client(relay.port);

    // One exactly-full record plus one single-byte record
    let mut payload = vec![0u8; MAX_PLAINTEXT + 1];
    rand::thread_rng().fill_bytes(&mut payload);

    codec_write_all(&mut codec, &payload);
    let got = codec_read_exact(&mut codec, payload.len());
    assert_eq!(got, payload);

    relay.stop();
}

#[test]
fn corrupt_handshake_tears_down_connection_only() {
    let echo = spawn_echo_server();
    let relay = spawn_relay("127.0.0.1", ("127.0.0.1", echo), true, false);

    // A client that completes the key exchange but then sends a record
    // header with an impossible length.
    let mut bogus = connect_client(relay.port);
    let mut junk = Vec::new();
    junk.extend_from_slice(&[0u8; 32]); // "public key"
    junk.extend_from_slice(&u16::MAX.to_be_bytes());
    junk.extend_from_slice(&[0u8; 24]);
    bogus.write_all(&junk).unwrap();

    // The relay tears the pair down; we see it as a hangup.
    let mut scratch = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match bogus.read(&mut buf) {
            Ok(0) => break,
            // The relay's own public key arrives first; skip past it
            Ok(n) => {
                scratch.extend_from_slice(&buf[..n]);
                assert!(scratch.len() <= 32, "unexpected data after key exchange");
            }
            Err(err)
                if err.kind() == ErrorKind::ConnectionReset
                    || err.kind() == ErrorKind::BrokenPipe =>
            {
                break
            }
            Err(err) => panic!("unexpected read error: {err}"),
        }
    }

    // The listener survived: a well-formed client still gets through.
    let (_stream, mut codec) = encrypted_client(relay.port);
    codec_write_all(&mut codec, b"still alive");
    assert_eq!(codec_read_exact(&mut codec, 11), b"still alive");

    relay.stop();
}

#[test]
fn half_close_flushes_residual_bytes() {
    // Upstream reads everything until EOF, then reports what it saw.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = listener.local_addr().unwrap().port();
    let upstream = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut got = Vec::new();
        stream.read_to_end(&mut got).unwrap();
        got
    });

    let relay = spawn_relay("127.0.0.1", ("127.0.0.1", upstream_port), false, false);

    let mut client = connect_client(relay.port);
    client.write_all(b"GET /\r\n\r\n").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    // All nine bytes arrive before the upstream sees EOF.
    let got = upstream.join().unwrap();
    assert_eq!(got, b"GET /\r\n\r\n");

    // And the relay closes our side once the pair is torn down.
    assert!(read_until_closed(&mut client).is_empty());

    relay.stop();
}

#[test]
fn unreachable_upstream_drops_client_but_keeps_listening() {
    // Grab a port that nothing listens on.
    let dead_port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let relay = spawn_relay("127.0.0.1", ("127.0.0.1", dead_port), false, false);

    for _ in 0..2 {
        let mut client = connect_client(relay.port);
        assert!(
            read_until_closed(&mut client).is_empty(),
            "no bytes should ever arrive"
        );
    }

    relay.stop();
}

/// Echo server reachable over both stacks, for name-resolved upstreams.
fn spawn_dual_stack_echo_server() -> u16 {
    let listener = TcpListener::bind("[::]:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}

#[test]
fn ipv6_listener_forwards_to_named_upstream() {
    let echo = spawn_dual_stack_echo_server();
    let relay = spawn_relay("::1", ("localhost", echo), false, false);

    let mut client = TcpStream::connect(("::1", relay.port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    client.write_all(b"over six").unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"over six");

    drop(client);
    relay.stop();
}

#[test]
fn slow_drip_preserves_byte_order() {
    let echo = spawn_echo_server();
    let relay = spawn_relay("127.0.0.1", ("127.0.0.1", echo), false, false);

    let mut client = connect_client(relay.port);
    for i in 0..20u8 {
        client.write_all(&[i]).unwrap();
        thread::sleep(Duration::from_millis(10));
    }

    let mut got = [0u8; 20];
    client.read_exact(&mut got).unwrap();
    let expected: Vec<u8> = (0..20).collect();
    assert_eq!(&got[..], &expected[..]);

    drop(client);
    relay.stop();
}

#[test]
fn run_flag_shutdown_closes_active_connections() {
    let echo = spawn_echo_server();
    let relay = spawn_relay("127.0.0.1", ("127.0.0.1", echo), false, false);

    let mut client = connect_client(relay.port);
    client.write_all(b"ping").unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();

    // Stopping the engine tears down the live pair; the client sees EOF.
    relay.stop();
    assert!(read_until_closed(&mut client).is_empty());
}
