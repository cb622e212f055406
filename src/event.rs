use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

/// A unit of work for the dispatcher, describing a connect, disconnect, or
/// message occurrence on one connection.
///
/// A connection's identity is its remote `SocketAddr`, captured once at
/// accept time and carried by value thereafter. The generic writer parameter
/// is `OwnedWriteHalf` in production; tests substitute in-memory streams.
///
/// `cancel` is the dispatcher's only means of severing a connection it holds
/// no writer for: cancelling it makes the connection's reader task close the
/// stream and report the disconnect itself.
#[derive(Debug)]
pub enum Event<W> {
    /// A new connection was accepted; the dispatcher takes ownership of its
    /// write half.
    Connected {
        addr: SocketAddr,
        writer: W,
        cancel: CancellationToken,
    },
    /// The connection's reader task terminated. Emitted exactly once per
    /// connection, after the read half has been closed.
    Disconnected { addr: SocketAddr },
    /// A chunk of bytes arrived from `addr`. No framing: the payload is
    /// whatever one read returned.
    Message {
        addr: SocketAddr,
        payload: Vec<u8>,
        cancel: CancellationToken,
    },
}
