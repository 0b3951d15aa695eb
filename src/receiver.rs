//! Go-Back-N receive-side state machine.
//!
//! One [`Receiver`] task runs per registered peer.  Its entire state is the
//! next expected sequence number:
//!
//! - Only the **in-order** character is accepted (`seq == expected`); it is
//!   delivered to the application output stream and `expected` advances.
//! - Out-of-order and duplicate characters are **silently discarded** — GBN
//!   never buffers ahead.
//! - After *every* inbound data frame, accepted or not, the receiver emits a
//!   cumulative acknowledgment for `(expected − 1) mod MaxSeqNo`, the last
//!   in-order sequence number received.  Re-acking duplicates is what lets
//!   the peer's single timeout recover the whole window.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::message::{AddressedMessage, Message};

/// Go-Back-N receive side for one peer.
pub struct Receiver {
    /// Address of the remote peer.
    peer: SocketAddr,
    /// Wire send queue (acknowledgments go out here).
    send_tx: mpsc::Sender<AddressedMessage>,
    /// Data frames routed to this peer by the multiplexer.
    data_rx: mpsc::Receiver<Message>,
    /// In-order delivered characters, shared by all peers.
    output_tx: mpsc::Sender<char>,
    /// Next sequence number accepted into the output stream.
    expected_seq: u32,
    max_seq_no: u32,
    cancel: CancellationToken,
}

impl Receiver {
    pub fn new(
        peer: SocketAddr,
        config: &Config,
        send_tx: mpsc::Sender<AddressedMessage>,
        data_rx: mpsc::Receiver<Message>,
        output_tx: mpsc::Sender<char>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            peer,
            send_tx,
            data_rx,
            output_tx,
            expected_seq: config.initial_seq_no,
            max_seq_no: config.max_seq_no(),
            cancel,
        }
    }

    /// Run the receive-side event loop until cancelled.
    pub async fn run(mut self) {
        log::debug!("[receiver {}] started", self.peer);
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = self.data_rx.recv() => match maybe {
                    None => break,
                    Some(m) => m,
                },
            };

            let Message::Data { seq_no, ch } = msg else {
                // Acknowledgments are routed to the sender, never here.
                continue;
            };

            if seq_no == self.expected_seq {
                log::debug!("[receiver {}] ← DATA {} {:?} accepted", self.peer, seq_no, ch);
                if !self.deliver(ch).await {
                    break;
                }
                self.expected_seq = (self.expected_seq + 1) % self.max_seq_no;
            } else {
                log::debug!(
                    "[receiver {}] ← DATA {} {:?} discarded (expected {})",
                    self.peer,
                    seq_no,
                    ch,
                    self.expected_seq
                );
            }

            // Unconditional cumulative ack: last in-order seq received.
            let ack_no = (self.expected_seq + self.max_seq_no - 1) % self.max_seq_no;
            if !self.transmit(AddressedMessage::ack(self.peer, ack_no)).await {
                break;
            }
        }
        log::debug!("[receiver {}] stopped", self.peer);
    }

    /// Hand one in-order character to the application output stream.
    async fn deliver(&self, ch: char) -> bool {
        matches!(
            self.cancel.run_until_cancelled(self.output_tx.send(ch)).await,
            Some(Ok(()))
        )
    }

    /// Push an acknowledgment into the wire send queue.
    async fn transmit(&self, msg: AddressedMessage) -> bool {
        matches!(
            self.cancel.run_until_cancelled(self.send_tx.send(msg)).await,
            Some(Ok(()))
        )
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
