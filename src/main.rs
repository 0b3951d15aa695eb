//! Entry point for `gbn-over-udp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  All protocol work is delegated to library modules; `main.rs` owns
//! only process setup (logging, configuration, argument parsing) and the
//! console plumbing.

use std::net::SocketAddr;
use std::process::exit;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use gbn_over_udp::config::Config;
use gbn_over_udp::socket::SocketError;
use gbn_over_udp::transport::{Transport, TransportError};

/// Reliable, ordered character streams over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Listen for peers and print every delivered character.
    Server,
    /// Connect to a server and send characters typed on stdin.
    Client {
        /// Server host name or IP address.
        server: String,
    },
}

#[tokio::main]
async fn main() {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {e}");
            exit(1);
        }
    };

    let result = match cli.mode {
        Mode::Server => run_server(config).await,
        Mode::Client { server } => run_client(config, &server).await,
    };
    if let Err(e) = result {
        log::error!("{e}");
        exit(1);
    }
}

/// Server: print delivered characters until the operator presses Enter.
async fn run_server(config: Config) -> Result<(), TransportError> {
    let mut transport = Transport::server(config).await?;
    println!("Listening on {}; press <Enter> to stop...", transport.local_addr());

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut line = String::new();
    loop {
        tokio::select! {
            maybe = transport.recv() => match maybe {
                Some(ch) => println!("screen: {ch}"),
                None => break,
            },
            _ = stdin.read_line(&mut line) => break,
        }
    }

    transport.shutdown().await;
    Ok(())
}

/// Client: forward non-whitespace stdin characters until EOF (Ctrl-D).
async fn run_client(config: Config, server: &str) -> Result<(), TransportError> {
    let server_addr = resolve(server, config.listen_port).await?;
    let mut transport = Transport::client(config).await?;
    transport.register_peer(server_addr);
    println!("Connected to {server_addr}; press CTRL-D to stop...");

    let input = transport.input();
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    let mut pending: Vec<u8> = Vec::new();

    'outer: loop {
        tokio::select! {
            maybe = transport.recv() => match maybe {
                Some(ch) => println!("screen: {ch}"),
                None => break,
            },
            read = stdin.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break, // EOF
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);
                for ch in drain_utf8(&mut pending).chars() {
                    // The wire format is whitespace-delimited, so only
                    // non-whitespace characters are sendable.
                    if ch.is_whitespace() {
                        continue;
                    }
                    if input.send(ch).await.is_err() {
                        break 'outer;
                    }
                }
            }
        }
    }

    transport.shutdown().await;
    Ok(())
}

/// Resolve `host` to a socket address on the configured port.
async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(SocketError::Io)?;
    addrs
        .next()
        .ok_or_else(|| {
            SocketError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address found for {host}"),
            ))
        })
        .map_err(TransportError::Socket)
}

/// Take every complete UTF-8 character out of `pending`, leaving a partial
/// trailing sequence (if any) for the next read.  Invalid bytes decode to
/// U+FFFD, matching what a buffered rune reader would produce.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(s) => {
                out.push_str(s);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        // Incomplete trailing sequence: wait for more bytes.
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}
