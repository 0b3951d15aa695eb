//! Composition root: socket pumps + multiplexer + application queues.
//!
//! [`Transport`] binds the UDP socket and wires the whole engine together:
//!
//! ```text
//!  application ──▶ input queue ──▶ Multiplexer ──▶ wire send queue
//!                                                      │
//!                                                 ┌────▼──────┐
//!                                                 │ send pump │──▶ UDP
//!                                                 └───────────┘
//!                                                 ┌───────────┐
//!  application ◀── output queue ◀── Multiplexer ◀─│ recv pump │◀── UDP
//!                              (wire recv queue)  └───────────┘
//! ```
//!
//! The two pump tasks are the only place the engine touches the socket.
//! Each blocking socket operation runs under the configured read/write
//! deadline so the pump re-checks cancellation at least that often:
//!
//! - deadline elapsed ⇒ retry (expected, not an error);
//! - decode failure  ⇒ log and drop the single frame (the peer retransmits);
//! - I/O error       ⇒ fatal: the root cancellation token is tripped and the
//!   whole engine unwinds, since the datagram path is shared by every peer.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::message::AddressedMessage;
use crate::mux::{Multiplexer, RegistrationPolicy};
use crate::socket::{Socket, SocketError};

/// Errors surfaced by the transport's public API.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// A running engine endpoint: one socket, many peers.
pub struct Transport {
    mux: Multiplexer,
    input_tx: mpsc::Sender<char>,
    output_rx: mpsc::Receiver<char>,
    cancel: CancellationToken,
    send_pump_cancel: CancellationToken,
    recv_pump_cancel: CancellationToken,
    send_pump: JoinHandle<()>,
    recv_pump: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl Transport {
    /// Bring up a server endpoint: bind the configured listen port and
    /// auto-register every peer on first contact.
    pub async fn server(config: Config) -> Result<Self, TransportError> {
        let port = config.listen_port;
        Self::bind(config, port, RegistrationPolicy::AutoRegister).await
    }

    /// Bring up a client endpoint: bind an ephemeral port and require
    /// explicit registration via [`register_peer`](Self::register_peer).
    pub async fn client(config: Config) -> Result<Self, TransportError> {
        Self::bind(config, 0, RegistrationPolicy::ExplicitOnly).await
    }

    async fn bind(
        config: Config,
        port: u16,
        policy: RegistrationPolicy,
    ) -> Result<Self, TransportError> {
        let socket = Arc::new(Socket::bind((Ipv4Addr::UNSPECIFIED, port).into()).await?);
        let local_addr = socket.local_addr();
        log::info!("[transport] bound {local_addr}");

        let cancel = CancellationToken::new();
        let (send_tx, send_rx) = mpsc::channel(config.send_queue_capacity);
        let (recv_tx, recv_rx) = mpsc::channel(config.recv_queue_capacity);
        let (input_tx, input_rx) = mpsc::channel(config.input_queue_capacity);
        let (output_tx, output_rx) = mpsc::channel(config.output_queue_capacity);

        let send_pump_cancel = cancel.child_token();
        let recv_pump_cancel = cancel.child_token();
        let send_pump = tokio::spawn(run_send_pump(
            Arc::clone(&socket),
            send_rx,
            config.socket_write_timeout,
            send_pump_cancel.clone(),
            cancel.clone(),
        ));
        let recv_pump = tokio::spawn(run_recv_pump(
            socket,
            recv_tx,
            config.socket_read_timeout,
            recv_pump_cancel.clone(),
            cancel.clone(),
        ));

        let mux = Multiplexer::start(config, policy, send_tx, recv_rx, input_rx, output_tx, &cancel);

        Ok(Self {
            mux,
            input_tx,
            output_rx,
            cancel,
            send_pump_cancel,
            recv_pump_cancel,
            send_pump,
            recv_pump,
            local_addr,
        })
    }

    /// Address this endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Admit a remote peer (client role).  Idempotent.
    pub fn register_peer(&self, addr: SocketAddr) {
        self.mux.register(addr);
    }

    /// Handle for submitting input characters; each is delivered, reliably
    /// and in order, to every registered peer.
    pub fn input(&self) -> mpsc::Sender<char> {
        self.input_tx.clone()
    }

    /// Next in-order character delivered by any peer, or `None` once the
    /// engine has gone down.
    pub async fn recv(&mut self) -> Option<char> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            maybe = self.output_rx.recv() => maybe,
        }
    }

    /// Tear the engine down, blocking until every task has confirmed exit:
    /// socket pumps first, then the multiplexer and its peer engines.
    pub async fn shutdown(self) {
        self.send_pump_cancel.cancel();
        self.recv_pump_cancel.cancel();
        let _ = self.send_pump.await;
        let _ = self.recv_pump.await;

        self.mux.shutdown().await;

        // Anything still parked on the root token (nothing, once the stages
        // above are down) is released last.
        self.cancel.cancel();
        log::info!("[transport] stopped");
    }
}

// ---------------------------------------------------------------------------
// Socket pumps
// ---------------------------------------------------------------------------

/// Drain the wire send queue into the socket.
async fn run_send_pump(
    socket: Arc<Socket>,
    mut send_rx: mpsc::Receiver<AddressedMessage>,
    write_timeout: Duration,
    cancel: CancellationToken,
    fatal: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = send_rx.recv() => match maybe {
                None => break,
                Some(m) => m,
            },
        };

        loop {
            match timeout(write_timeout, socket.send_to(&msg.message, msg.addr)).await {
                // Deadline elapsed: expected, retry (re-checking cancellation).
                Err(_elapsed) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                }
                Ok(Ok(())) => {
                    log::debug!("[udp] → {:?} to {}", msg.message, msg.addr);
                    break;
                }
                Ok(Err(e)) => {
                    log::error!("[udp] send failed: {e}");
                    fatal.cancel();
                    return;
                }
            }
        }
    }
    log::debug!("[udp] send pump stopped");
}

/// Feed decoded inbound frames into the wire recv queue.
async fn run_recv_pump(
    socket: Arc<Socket>,
    recv_tx: mpsc::Sender<AddressedMessage>,
    read_timeout: Duration,
    cancel: CancellationToken,
    fatal: CancellationToken,
) {
    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = timeout(read_timeout, socket.recv_from()) => attempt,
        };

        let msg = match attempt {
            // Deadline elapsed: expected, go around again.
            Err(_elapsed) => continue,
            Ok(Ok(msg)) => msg,
            Ok(Err(SocketError::Decode(e))) => {
                log::warn!("[udp] dropping malformed frame: {e}");
                continue;
            }
            Ok(Err(SocketError::Io(e))) => {
                log::error!("[udp] recv failed: {e}");
                fatal.cancel();
                return;
            }
        };

        log::debug!("[udp] ← {:?} from {}", msg.message, msg.addr);
        match cancel.run_until_cancelled(recv_tx.send(msg)).await {
            Some(Ok(())) => {}
            _ => break,
        }
    }
    log::debug!("[udp] recv pump stopped");
}
