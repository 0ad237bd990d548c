//! saltpipe binary
//!
//! Usage: saltpipe [-i] [-o] <bind-addr> <bind-port> <server-addr> <server-port>
//!
//! Options:
//!   -i    Encrypt the client-facing leg
//!   -o    Encrypt the server-facing leg
//!   -io   Encrypt both legs
//!   -h    Print help information

use std::env;
use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::error;

use saltpipe::{Error, Relay, RelayConfig};

/// Process-wide run flag. Cleared by the SIGINT/SIGTERM handler and
/// re-checked at every loop iteration; poll(2) wakes with EINTR when the
/// signal lands mid-wait.
static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn signal_handler(_sig: i32) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn main() -> ExitCode {
    // Initialize tracing; respects RUST_LOG env var (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    let config = match parse_args(&args) {
        Ok(Some(config)) => config,
        Ok(None) => return ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            print_usage(&args[0]);
            return ExitCode::FAILURE;
        }
    };

    unsafe {
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
    }

    let mut relay = match Relay::bind(config) {
        Ok(relay) => relay,
        Err(err) => {
            error!("startup failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    match relay.run(&RUNNING) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

fn print_usage(prog_name: &str) {
    println!("Usage: {prog_name} [-io] <bind address> <bind port> <server address> <server port>");
    println!("  -i : encrypt incoming client connections");
    println!("  -o : encrypt outgoing server connections");
    println!("  -io : encrypt both incoming and outgoing connections");
}

/// Parse command-line arguments into a relay configuration.
///
/// Returns `Ok(None)` when help was requested.
fn parse_args(args: &[String]) -> Result<Option<RelayConfig>, Error> {
    let mut encrypt_client = false;
    let mut encrypt_server = false;
    let mut positional: Vec<&str> = Vec::new();

    for arg in &args[1..] {
        match arg.strip_prefix('-') {
            Some(flags) if !flags.is_empty() => {
                for flag in flags.chars() {
                    match flag {
                        'i' => encrypt_client = true,
                        'o' => encrypt_server = true,
                        'h' => {
                            print_usage(&args[0]);
                            return Ok(None);
                        }
                        other => return Err(Error::config(format!("unknown option: -{other}"))),
                    }
                }
            }
            _ => positional.push(arg),
        }
    }

    if positional.len() != 4 {
        return Err(Error::config(format!(
            "expected four positional arguments, got {}",
            positional.len()
        )));
    }

    if positional[0].parse::<IpAddr>().is_err() {
        return Err(Error::config(format!(
            "bind address must be numeric: {}",
            positional[0]
        )));
    }

    Ok(Some(RelayConfig {
        bind_addr: positional[0].to_string(),
        bind_port: parse_port(positional[1])?,
        server_addr: positional[2].to_string(),
        server_port: parse_port(positional[3])?,
        encrypt_client,
        encrypt_server,
    }))
}

fn parse_port(text: &str) -> Result<u16, Error> {
    match text.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(Error::config(format!("port must be in 1-65535: {text}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        std::iter::once("saltpipe")
            .chain(parts.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_plain_relay() {
        let config = parse_args(&argv(&["127.0.0.1", "7000", "127.0.0.1", "9000"]))
            .unwrap()
            .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.bind_port, 7000);
        assert_eq!(config.server_addr, "127.0.0.1");
        assert_eq!(config.server_port, 9000);
        assert!(!config.encrypt_client);
        assert!(!config.encrypt_server);
    }

    #[test]
    fn test_parse_combined_flags() {
        let config = parse_args(&argv(&["-io", "::1", "7003", "localhost", "9000"]))
            .unwrap()
            .unwrap();
        assert!(config.encrypt_client);
        assert!(config.encrypt_server);
        assert_eq!(config.bind_addr, "::1");
        assert_eq!(config.server_addr, "localhost");
    }

    #[test]
    fn test_parse_separate_flags() {
        let config = parse_args(&argv(&["-i", "-o", "127.0.0.1", "7000", "127.0.0.1", "9000"]))
            .unwrap()
            .unwrap();
        assert!(config.encrypt_client);
        assert!(config.encrypt_server);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        // Wrong positional count
        assert!(matches!(
            parse_args(&argv(&["127.0.0.1", "7000", "127.0.0.1"])),
            Err(Error::Config(_))
        ));
        // Named bind address
        assert!(matches!(
            parse_args(&argv(&["localhost", "7000", "127.0.0.1", "9000"])),
            Err(Error::Config(_))
        ));
        // Port out of range
        assert!(matches!(
            parse_args(&argv(&["127.0.0.1", "0", "127.0.0.1", "9000"])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            parse_args(&argv(&["127.0.0.1", "65536", "127.0.0.1", "9000"])),
            Err(Error::Config(_))
        ));
        // Unknown flag
        assert!(matches!(
            parse_args(&argv(&["-x", "127.0.0.1", "7000", "127.0.0.1", "9000"])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_help_short_circuits() {
        assert!(parse_args(&argv(&["-h"])).unwrap().is_none());
    }
}
