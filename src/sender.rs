//! Go-Back-N send-side state machine.
//!
//! One [`Sender`] task runs per registered peer.  It owns the peer's entire
//! send-side protocol state and is the only task that ever touches it:
//!
//! ```text
//!   base_seq            next_seq
//!      │                   │
//!  ────┼───────────────────┼────────────────▶ seq space (mod MaxSeqNo)
//!      │ ◀── outstanding ─▶│ ◀── sendable ──▶
//! ```
//!
//! # Protocol contract
//!
//! - At most `window_size` characters may be outstanding at once; admission
//!   is enforced upstream by the gating task, which acquires one window
//!   token per character (see [`crate::mux`]).
//! - ACKs are **cumulative**: `ACK k` confirms every sequence number up to
//!   and including `k`.  Processing an ACK releases one window token per
//!   newly confirmed character.
//! - On timeout the sender retransmits **all** outstanding characters from
//!   `base_seq` (go back to N), then re-arms the timer.
//! - The retransmission timer always tracks the *oldest* unacknowledged
//!   character: stopped when the window empties, restarted when it moves.
//!
//! The event loop multiplexes acknowledgments, gated input, the timer, and
//! cancellation with `tokio::select!`; every blocking send toward the wire
//! also waits on the cancellation token so shutdown is never starved.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::message::{AddressedMessage, Message};
use crate::timer::RetransmitTimer;

/// Go-Back-N send side for one peer.
pub struct Sender {
    /// Address of the remote peer.
    peer: SocketAddr,
    /// Wire send queue, shared with every other peer engine.
    send_tx: mpsc::Sender<AddressedMessage>,
    /// Acknowledgments routed to this peer by the multiplexer.
    ack_rx: mpsc::Receiver<Message>,
    /// Characters admitted by this peer's gating task.
    input_rx: mpsc::Receiver<char>,
    /// Window token pool shared with the gating task.  One token is
    /// acquired per admitted character; [`on_ack`](Self::on_ack) releases
    /// one per newly confirmed character.
    window: Arc<Semaphore>,
    window_size: u32,
    max_seq_no: u32,
    /// Oldest unacknowledged sequence number (left window edge).
    base_seq: u32,
    /// Next sequence number available for a new character.
    next_seq: u32,
    /// Outstanding characters, indexed by `seq % window_size`.
    buf: Vec<char>,
    timer: RetransmitTimer,
    cancel: CancellationToken,
}

impl Sender {
    pub fn new(
        peer: SocketAddr,
        config: &Config,
        send_tx: mpsc::Sender<AddressedMessage>,
        ack_rx: mpsc::Receiver<Message>,
        input_rx: mpsc::Receiver<char>,
        window: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            peer,
            send_tx,
            ack_rx,
            input_rx,
            window,
            window_size: config.window_size,
            max_seq_no: config.max_seq_no(),
            base_seq: config.initial_seq_no,
            next_seq: config.initial_seq_no,
            buf: vec!['\0'; config.window_size as usize],
            timer: RetransmitTimer::new(config.retransmission_timeout),
            cancel,
        }
    }

    /// Run the send-side event loop until cancelled.
    pub async fn run(mut self) {
        log::debug!("[sender {}] started", self.peer);
        loop {
            let timer_armed = self.timer.is_armed();
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                maybe_ack = self.ack_rx.recv() => match maybe_ack {
                    None => break,
                    Some(Message::Ack { seq_no }) => self.on_ack(seq_no),
                    // Data frames are routed to the receiver, never here.
                    Some(Message::Data { .. }) => {}
                },

                maybe_ch = self.input_rx.recv() => match maybe_ch {
                    None => break,
                    Some(ch) => {
                        if !self.on_char(ch).await {
                            break;
                        }
                    }
                },

                () = self.timer.expired(), if timer_armed => {
                    if !self.on_timeout().await {
                        break;
                    }
                }
            }
        }
        log::debug!("[sender {}] stopped", self.peer);
    }

    /// Process a cumulative acknowledgment for sequence number `ack_no`.
    ///
    /// The window advance is computed against the current `base_seq`, which
    /// makes acknowledgments idempotent: a duplicate (or older) ACK yields a
    /// shift of zero and changes nothing.  A shift larger than the number of
    /// outstanding characters cannot come from a well-behaved peer and is
    /// ignored rather than allowed to over-release window tokens.
    fn on_ack(&mut self, ack_no: u32) {
        if ack_no >= self.max_seq_no {
            log::debug!(
                "[sender {}] ignoring ACK {} outside seq space",
                self.peer,
                ack_no
            );
            return;
        }

        let new_base = (ack_no + 1) % self.max_seq_no;
        let shift = (new_base + self.max_seq_no - self.base_seq) % self.max_seq_no;
        let outstanding = (self.next_seq + self.max_seq_no - self.base_seq) % self.max_seq_no;

        if shift == 0 {
            log::debug!("[sender {}] duplicate ACK {}", self.peer, ack_no);
            return;
        }
        if shift > outstanding {
            log::debug!(
                "[sender {}] out-of-window ACK {} (outstanding {})",
                self.peer,
                ack_no,
                outstanding
            );
            return;
        }

        self.base_seq = new_base;
        self.window.add_permits(shift as usize);
        log::debug!(
            "[sender {}] ← ACK {} (slid {}, base={})",
            self.peer,
            ack_no,
            shift,
            self.base_seq
        );

        if self.base_seq == self.next_seq {
            // Window drained; nothing left to retransmit.
            self.timer.stop();
        } else {
            // Timer now tracks the new oldest unacknowledged character.
            self.timer.start();
        }
    }

    /// Admit one character into the window and transmit it.
    ///
    /// The gating task has already acquired a window token, so a free slot
    /// is guaranteed.  Returns `false` when the engine is shutting down.
    async fn on_char(&mut self, ch: char) -> bool {
        self.buf[(self.next_seq % self.window_size) as usize] = ch;
        let msg = AddressedMessage::data(self.peer, self.next_seq, ch);
        if !self.transmit(msg).await {
            return false;
        }
        log::debug!("[sender {}] → DATA {} {:?}", self.peer, self.next_seq, ch);
        if self.base_seq == self.next_seq {
            // First outstanding character: it becomes the oldest unacked.
            self.timer.start();
        }
        self.next_seq = (self.next_seq + 1) % self.max_seq_no;
        true
    }

    /// Timeout: re-arm the timer, then retransmit the whole outstanding
    /// window `[base_seq, next_seq)` in sequence order.
    async fn on_timeout(&mut self) -> bool {
        self.timer.start();
        let outstanding = (self.next_seq + self.max_seq_no - self.base_seq) % self.max_seq_no;
        log::debug!(
            "[sender {}] timeout — retransmitting {} frame(s)",
            self.peer,
            outstanding
        );
        let mut seq = self.base_seq;
        while seq != self.next_seq {
            let ch = self.buf[(seq % self.window_size) as usize];
            if !self.transmit(AddressedMessage::data(self.peer, seq, ch)).await {
                return false;
            }
            seq = (seq + 1) % self.max_seq_no;
        }
        true
    }

    /// Push a frame into the wire send queue, giving up on cancellation.
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
