//! Relay configuration.

/// Configuration for one relay process: where to listen, where to
/// forward, and which legs carry the encrypted framing.
///
/// Operator-facing validation (numeric bind address, port range) happens
/// at CLI parse time; the library itself is permissive so embedders and
/// tests can bind port 0 for an ephemeral port.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Numeric address to bind the listener to (v4 or v6)
    pub bind_addr: String,
    /// Port to bind the listener to
    pub bind_port: u16,
    /// Upstream server address (numeric or a resolvable name)
    pub server_addr: String,
    /// Upstream server port
    pub server_port: u16,
    /// Encrypt the client-facing leg
    pub encrypt_client: bool,
    /// Encrypt the server-facing leg
    pub encrypt_server: bool,
}
