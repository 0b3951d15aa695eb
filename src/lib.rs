//! `gbn-over-udp` — reliable, ordered character streams over lossy UDP.
//!
//! One local socket serves many remote peers at once.  Each peer gets its
//! own pair of Go-Back-N state machines; a multiplexer splits the shared
//! datagram stream between them and fans local input out to all of them.
//!
//! # Architecture
//!
//! ```text
//!  application input ──▶ ┌─────────────┐ ──▶ per-peer Sender ──┐
//!                        │ Multiplexer │                       │ wire
//!  application output ◀─ └─────────────┘ ◀── per-peer Receiver │ queues
//!                               ▲                              ▼
//!                               │ frames            ┌────────────────┐
//!                               └────────────────── │ Transport/UDP  │
//!                                                   └────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`message`]   — wire format (serialise / deserialise)
//! - [`timer`]     — single-fire retransmission timer
//! - [`sender`]    — GBN outbound window state machine (per peer)
//! - [`receiver`]  — GBN inbound cumulative-ACK state machine (per peer)
//! - [`mux`]       — address table, inbound routing, outbound fan-out
//! - [`socket`]    — async UDP socket abstraction
//! - [`transport`] — composition root and application-facing surface
//! - [`config`]    — environment-variable configuration

pub mod config;
pub mod message;
pub mod mux;
pub mod receiver;
pub mod sender;
pub mod socket;
pub mod timer;
pub mod transport;
