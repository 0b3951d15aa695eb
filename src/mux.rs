//! Multiplexer: one shared datagram stream, many per-peer protocol engines.
//!
//! # Architecture
//!
//! ```text
//!                         wire recv queue
//!                               │
//!                        ┌──────▼──────┐        address table
//!                        │   routing   │──────▶ addr → PeerEntry
//!                        └──────┬──────┘
//!              ACK ─────────────┼───────────── DATA
//!                  │                        │
//!            ┌─────▼────┐             ┌─────▼─────┐
//!            │  Sender  │             │ Receiver  │   (per peer)
//!            └─────▲────┘             └─────┬─────┘
//!     window token │                        │ output queue
//!            ┌─────┴────┐                   ▼
//!            │   gate   │              application
//!            └─────▲────┘
//!                  │ gate queue
//!           ┌──────┴──────┐
//!           │   fan-out   │◀── input queue ◀── application
//!           └─────────────┘
//! ```
//!
//! Two independent duties run as their own tasks:
//!
//! - **Inbound routing** resolves each wire frame's peer address in the
//!   table (auto-registering it first when the [`RegistrationPolicy`]
//!   permits) and forwards it by kind: acknowledgments to that peer's
//!   [`Sender`], data to its [`Receiver`].  A single routing task plus
//!   per-peer FIFO queues preserves per-peer arrival order.
//! - **Outbound fan-out** offers every application input character to all
//!   registered peers.  The per-peer gating task acquires one window token
//!   before forwarding, so a peer with a full window stalls only its own
//!   lane, never the distributor or the other peers beyond its small gate
//!   buffer.
//!
//! The address table is the only state shared across tasks; it sits behind
//! a reader/writer lock that is never held across an await — routing and
//! fan-out clone the queue handles they need out of the table, then send.
//!
//! Shutdown is ordered and two-phase per task (cancel, then await the
//! `JoinHandle`): first routing and fan-out stop accepting work, then every
//! peer engine is stopped, then the per-peer queues are dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::message::{AddressedMessage, Message};
use crate::receiver::Receiver;
use crate::sender::Sender;

/// What to do with a frame from an address the table does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPolicy {
    /// Create a peer entry on first contact (server role).
    AutoRegister,
    /// Drop frames from unknown addresses; peers must be registered
    /// explicitly (client role).
    ExplicitOnly,
}

/// Queue handles and task handles for one registered peer.
struct PeerEntry {
    ack_tx: mpsc::Sender<Message>,
    data_tx: mpsc::Sender<Message>,
    gate_tx: mpsc::Sender<char>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// State shared between the multiplexer handle and its worker tasks.
struct Shared {
    table: RwLock<HashMap<SocketAddr, PeerEntry>>,
    config: Config,
    send_tx: mpsc::Sender<AddressedMessage>,
    output_tx: mpsc::Sender<char>,
    /// Parent of every per-peer cancellation token.
    peers_cancel: CancellationToken,
}

impl Shared {
    /// Create the peer's engine on first contact.  Idempotent: an address
    /// already in the table is left untouched.
    fn register(&self, addr: SocketAddr) {
        if self.table.read().unwrap().contains_key(&addr) {
            return;
        }
        let mut table = self.table.write().unwrap();
        if table.contains_key(&addr) {
            return;
        }
        log::info!("[mux] new peer {addr}");

        let cfg = &self.config;
        let (ack_tx, ack_rx) = mpsc::channel(cfg.peer_queue_capacity);
        let (data_tx, data_rx) = mpsc::channel(cfg.peer_queue_capacity);
        let (gate_tx, gate_rx) = mpsc::channel(cfg.gate_queue_capacity);
        let (input_tx, input_rx) = mpsc::channel(cfg.gate_queue_capacity);
        let window = Arc::new(Semaphore::new(cfg.window_size as usize));
        let cancel = self.peers_cancel.child_token();

        let sender = Sender::new(
            addr,
            cfg,
            self.send_tx.clone(),
            ack_rx,
            input_rx,
            Arc::clone(&window),
            cancel.clone(),
        );
        let receiver = Receiver::new(
            addr,
            cfg,
            self.send_tx.clone(),
            data_rx,
            self.output_tx.clone(),
            cancel.clone(),
        );
        let tasks = vec![
            tokio::spawn(sender.run()),
            tokio::spawn(receiver.run()),
            tokio::spawn(run_gate(gate_rx, input_tx, window, cancel.clone())),
        ];

        table.insert(
            addr,
            PeerEntry {
                ack_tx,
                data_tx,
                gate_tx,
                cancel,
                tasks,
            },
        );
    }
}

/// Demultiplexes the shared wire stream into per-peer engines and fans
/// application input out to them.
pub struct Multiplexer {
    shared: Arc<Shared>,
    routing_cancel: CancellationToken,
    fanout_cancel: CancellationToken,
    routing_task: JoinHandle<()>,
    fanout_task: JoinHandle<()>,
}

impl Multiplexer {
    /// Wire up the multiplexer and spawn its routing and fan-out tasks.
    ///
    /// `parent` is the engine-wide cancellation token; every task spawned
    /// here observes a child of it, so an engine-wide cancellation (fatal
    /// transport error) tears the multiplexer down too.
    pub fn start(
        config: Config,
        policy: RegistrationPolicy,
        send_tx: mpsc::Sender<AddressedMessage>,
        recv_rx: mpsc::Receiver<AddressedMessage>,
        input_rx: mpsc::Receiver<char>,
        output_tx: mpsc::Sender<char>,
        parent: &CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            table: RwLock::new(HashMap::new()),
            config,
            send_tx,
            output_tx,
            peers_cancel: parent.child_token(),
        });
        let routing_cancel = parent.child_token();
        let fanout_cancel = parent.child_token();
        let routing_task = tokio::spawn(run_routing(
            Arc::clone(&shared),
            recv_rx,
            policy,
            routing_cancel.clone(),
        ));
        let fanout_task = tokio::spawn(run_fanout(
            Arc::clone(&shared),
            input_rx,
            fanout_cancel.clone(),
        ));
        Self {
            shared,
            routing_cancel,
            fanout_cancel,
            routing_task,
            fanout_task,
        }
    }

    /// Explicitly admit a remote peer (client role).  Idempotent.
    pub fn register(&self, addr: SocketAddr) {
        self.shared.register(addr);
    }

    /// Stop everything, in order, waiting for each task to confirm exit.
    pub async fn shutdown(self) {
        // Phase 1: refuse new work.
        self.routing_cancel.cancel();
        self.fanout_cancel.cancel();
        let _ = self.routing_task.await;
        let _ = self.fanout_task.await;

        // Phase 2: stop every peer engine.
        let entries: Vec<PeerEntry> = {
            let mut table = self.shared.table.write().unwrap();
            table.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.cancel.cancel();
            for task in entry.tasks {
                let _ = task.await;
            }
            // Queues close when the entry drops here.
        }
        log::debug!("[mux] stopped");
    }
}

// ---------------------------------------------------------------------------
// Worker tasks
// ---------------------------------------------------------------------------

/// Inbound routing: wire frame → the right peer engine, by address and kind.
async fn run_routing(
    shared: Arc<Shared>,
    mut recv_rx: mpsc::Receiver<AddressedMessage>,
    policy: RegistrationPolicy,
    cancel: CancellationToken,
) {
    loop {
        let AddressedMessage { message, addr } = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = recv_rx.recv() => match maybe {
                None => break,
                Some(m) => m,
            },
        };

        if policy == RegistrationPolicy::AutoRegister {
            shared.register(addr);
        }

        // Clone the inbox handle out; the lock must not span the send below.
        let inbox = {
            let table = shared.table.read().unwrap();
            table.get(&addr).map(|entry| {
                if message.is_ack() {
                    entry.ack_tx.clone()
                } else {
                    entry.data_tx.clone()
                }
            })
        };
        let Some(inbox) = inbox else {
            log::debug!("[mux] dropping frame from unregistered peer {addr}");
            continue;
        };

        match cancel.run_until_cancelled(inbox.send(message)).await {
            None => break,
            Some(Err(_)) => log::debug!("[mux] peer {addr} inbox closed"),
            Some(Ok(())) => {}
        }
    }
    log::debug!("[mux] routing stopped");
}

/// Outbound fan-out: offer every input character to all registered peers.
async fn run_fanout(
    shared: Arc<Shared>,
    mut input_rx: mpsc::Receiver<char>,
    cancel: CancellationToken,
) {
    loop {
        let ch = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = input_rx.recv() => match maybe {
                None => break,
                Some(c) => c,
            },
        };

        // Snapshot under the read lock, send outside it.
        let gates: Vec<(SocketAddr, mpsc::Sender<char>)> = {
            let table = shared.table.read().unwrap();
            table
                .iter()
                .map(|(addr, entry)| (*addr, entry.gate_tx.clone()))
                .collect()
        };

        for (addr, gate) in gates {
            match cancel.run_until_cancelled(gate.send(ch)).await {
                None => return,
                Some(Err(_)) => log::debug!("[mux] peer {addr} gate closed"),
                Some(Ok(())) => {}
            }
        }
    }
    log::debug!("[mux] fan-out stopped");
}

/// Per-peer gating: admit a character into the sender only once a window
/// token is available.  This is the engine's sole flow-control point.
async fn run_gate(
    mut gate_rx: mpsc::Receiver<char>,
    input_tx: mpsc::Sender<char>,
    window: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        let ch = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = gate_rx.recv() => match maybe {
                None => break,
                Some(c) => c,
            },
        };

        // One window token per admitted character.  The sender gives tokens
        // back as acknowledgments advance its window.
        tokio::select! {
            _ = cancel.cancelled() => break,
            permit = window.acquire() => match permit {
                Err(_) => break,
                Ok(p) => p.forget(),
            },
        }

        match cancel.run_until_cancelled(input_tx.send(ch)).await {
            Some(Ok(())) => {}
            _ => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config(window_size: u32) -> Config {
        Config {
            listen_port: 0,
            window_size,
            initial_seq_no: 0,
            retransmission_timeout: Duration::from_secs(60),
            socket_read_timeout: Duration::from_millis(50),
            socket_write_timeout: Duration::from_millis(50),
            send_queue_capacity: 64,
            recv_queue_capacity: 32,
            peer_queue_capacity: 8,
            gate_queue_capacity: 4,
            input_queue_capacity: 4,
            output_queue_capacity: 64,
        }
    }

    struct Harness {
        mux: Multiplexer,
        send_rx: mpsc::Receiver<AddressedMessage>,
        recv_tx: mpsc::Sender<AddressedMessage>,
        input_tx: mpsc::Sender<char>,
        output_rx: mpsc::Receiver<char>,
    }

    fn start_mux(window_size: u32, policy: RegistrationPolicy) -> Harness {
        let config = test_config(window_size);
        let (send_tx, send_rx) = mpsc::channel(config.send_queue_capacity);
        let (recv_tx, recv_rx) = mpsc::channel(config.recv_queue_capacity);
        let (input_tx, input_rx) = mpsc::channel(config.input_queue_capacity);
        let (output_tx, output_rx) = mpsc::channel(config.output_queue_capacity);
        let cancel = CancellationToken::new();
        let mux = Multiplexer::start(config, policy, send_tx, recv_rx, input_rx, output_tx, &cancel);
        Harness {
            mux,
            send_rx,
            recv_tx,
            input_tx,
            output_rx,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    async fn next_frame(h: &mut Harness) -> AddressedMessage {
        timeout(Duration::from_secs(5), h.send_rx.recv())
            .await
            .expect("no frame emitted")
            .expect("send queue closed")
    }

    #[tokio::test]
    async fn auto_registers_on_first_inbound_frame() {
        let mut h = start_mux(2, RegistrationPolicy::AutoRegister);

        h.recv_tx
            .send(AddressedMessage::data(addr(1000), 0, 'A'))
            .await
            .unwrap();

        // The freshly created receiver delivers and acks.
        let ch = timeout(Duration::from_secs(5), h.output_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ch, 'A');
        assert_eq!(next_frame(&mut h).await, AddressedMessage::ack(addr(1000), 0));

        h.mux.shutdown().await;
    }

    #[tokio::test]
    async fn explicit_policy_drops_unknown_senders() {
        let mut h = start_mux(2, RegistrationPolicy::ExplicitOnly);

        h.recv_tx
            .send(AddressedMessage::data(addr(1000), 0, 'A'))
            .await
            .unwrap();
        assert!(
            timeout(Duration::from_millis(100), h.send_rx.recv())
                .await
                .is_err(),
            "unregistered peer was answered"
        );

        // After explicit registration the same frame is served.
        h.mux.register(addr(1000));
        h.recv_tx
            .send(AddressedMessage::data(addr(1000), 0, 'A'))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut h).await, AddressedMessage::ack(addr(1000), 0));

        h.mux.shutdown().await;
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let mut h = start_mux(2, RegistrationPolicy::ExplicitOnly);
        h.mux.register(addr(1000));

        // Accept a frame, then re-register: receiver state must survive.
        h.recv_tx
            .send(AddressedMessage::data(addr(1000), 0, 'A'))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut h).await, AddressedMessage::ack(addr(1000), 0));

        h.mux.register(addr(1000));
        h.recv_tx
            .send(AddressedMessage::data(addr(1000), 1, 'B'))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut h).await, AddressedMessage::ack(addr(1000), 1));

        // Exactly one sender exists: one input char, one DATA frame.
        h.input_tx.send('x').await.unwrap();
        assert_eq!(
            next_frame(&mut h).await,
            AddressedMessage::data(addr(1000), 0, 'x')
        );
        assert!(
            timeout(Duration::from_millis(100), h.send_rx.recv())
                .await
                .is_err(),
            "duplicate registration duplicated the engine"
        );

        h.mux.shutdown().await;
    }

    #[tokio::test]
    async fn fans_input_out_to_every_peer() {
        let mut h = start_mux(2, RegistrationPolicy::ExplicitOnly);
        h.mux.register(addr(1000));
        h.mux.register(addr(2000));

        h.input_tx.send('x').await.unwrap();

        let first = next_frame(&mut h).await;
        let second = next_frame(&mut h).await;
        let mut addrs = [first.addr, second.addr];
        addrs.sort();
        assert_eq!(addrs, [addr(1000), addr(2000)]);
        assert_eq!(first.message, Message::Data { seq_no: 0, ch: 'x' });
        assert_eq!(second.message, Message::Data { seq_no: 0, ch: 'x' });

        h.mux.shutdown().await;
    }

    #[tokio::test]
    async fn routes_acks_to_the_senders_window() {
        let mut h = start_mux(1, RegistrationPolicy::ExplicitOnly);
        h.mux.register(addr(1000));

        // Window of 1: the second character must wait for the first ack.
        h.input_tx.send('a').await.unwrap();
        h.input_tx.send('b').await.unwrap();
        assert_eq!(
            next_frame(&mut h).await,
            AddressedMessage::data(addr(1000), 0, 'a')
        );
        assert!(
            timeout(Duration::from_millis(100), h.send_rx.recv())
                .await
                .is_err(),
            "second character sent past a full window"
        );

        h.recv_tx
            .send(AddressedMessage::ack(addr(1000), 0))
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut h).await,
            AddressedMessage::data(addr(1000), 1, 'b')
        );

        h.mux.shutdown().await;
    }

    #[tokio::test]
    async fn peers_keep_independent_state() {
        let mut h = start_mux(2, RegistrationPolicy::AutoRegister);

        // Interleaved streams from two addresses.
        h.recv_tx
            .send(AddressedMessage::data(addr(1000), 0, 'a'))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut h).await, AddressedMessage::ack(addr(1000), 0));
        h.recv_tx
            .send(AddressedMessage::data(addr(2000), 0, '1'))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut h).await, AddressedMessage::ack(addr(2000), 0));

        // A duplicate from one peer does not disturb the other.
        h.recv_tx
            .send(AddressedMessage::data(addr(1000), 0, 'a'))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut h).await, AddressedMessage::ack(addr(1000), 0));
        h.recv_tx
            .send(AddressedMessage::data(addr(2000), 1, '2'))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut h).await, AddressedMessage::ack(addr(2000), 1));

        let mut delivered = Vec::new();
        for _ in 0..3 {
            delivered.push(
                timeout(Duration::from_secs(5), h.output_rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(delivered, vec!['a', '1', '2']);

        h.mux.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_joins_every_task() {
        let h = start_mux(2, RegistrationPolicy::AutoRegister);
        h.mux.register(addr(1000));
        h.mux.register(addr(2000));

        timeout(Duration::from_secs(5), h.mux.shutdown())
            .await
            .expect("shutdown hung");
    }
}
