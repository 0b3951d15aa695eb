//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`AddressedMessage`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O plus the encode/decode step at
//! the boundary.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::message::{AddressedMessage, Message, MessageError};

/// Receive buffer size.  The longest well-formed frame is
/// `DATA <10-digit seqNo> <4-byte char>\n`, well under this; anything
/// longer is malformed and will fail to decode after truncation.
const MAX_DATAGRAM: usize = 64;

/// Errors that can arise from socket operations.
///
/// The two variants matter to callers in different ways: a [`Decode`] error
/// concerns one bad datagram and is recoverable (drop the frame, keep
/// reading), while an [`Io`] error poisons the shared datagram path.
///
/// [`Decode`]: SocketError::Decode
/// [`Io`]: SocketError::Io
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame decode error: {0}")]
    Decode(#[from] MessageError),
}

/// An async, frame-oriented UDP socket.
///
/// All methods take `&self` so the socket can be shared across tasks.
#[derive(Debug)]
pub struct Socket {
    local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Address this socket is bound to (with the OS-assigned port resolved).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Encode `message` and send it as a single datagram to `dest`.
    pub async fn send_to(&self, message: &Message, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = message.encode();
        self.inner.send_to(&bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram and decode it into an [`AddressedMessage`].
    ///
    /// Datagrams that fail to decode are returned as
    /// [`SocketError::Decode`] — the caller decides whether to retry.
    pub async fn recv_from(&self) -> Result<AddressedMessage, SocketError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let message = Message::decode(&buf[..n])?;
        Ok(AddressedMessage { message, addr })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn ephemeral() -> Socket {
        let addr = "127.0.0.1:0".parse().unwrap();
        Socket::bind(addr).await.expect("bind failed")
    }

    #[tokio::test]
    async fn frames_cross_the_loopback() {
        let a = ephemeral().await;
        let b = ephemeral().await;

        let msg = Message::Data { seq_no: 3, ch: 'A' };
        a.send_to(&msg, b.local_addr()).await.unwrap();

        let got = b.recv_from().await.unwrap();
        assert_eq!(got.message, msg);
        assert_eq!(got.addr, a.local_addr());
    }

    #[tokio::test]
    async fn malformed_datagram_is_a_decode_error() {
        let a = ephemeral().await;
        let b = ephemeral().await;

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(b"GARBAGE\n", b.local_addr()).await.unwrap();
        assert!(matches!(
            b.recv_from().await,
            Err(SocketError::Decode(MessageError::UnknownTag(_)))
        ));

        // The stream survives the bad frame.
        a.send_to(&Message::Ack { seq_no: 1 }, b.local_addr())
            .await
            .unwrap();
        let got = b.recv_from().await.unwrap();
        assert_eq!(got.message, Message::Ack { seq_no: 1 });
    }
}
