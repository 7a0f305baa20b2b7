//! Transport abstraction.
//!
//! The core consumes an already-authenticated, framed message channel:
//! send one message, receive one message, shut down. Establishment, SASL
//! and the wire codec live behind [`TransportFactory`] implementations.
//!
//! The send and receive halves are split so the dispatcher task can own
//! the reading side while senders contend on the writing side.

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tramline_wire::Message;

use crate::Error;

/// How a transport operation failed.
///
/// `Eof` is a distinct sentinel, not an error code: the peer went away
/// cleanly. `Data` marks (un)marshalling faults, `Protocol` wire-format
/// violations.
#[derive(Debug)]
pub enum TransportFault {
    /// The peer closed the stream.
    Eof,
    /// The bytes on the wire violate the framing or header format.
    Protocol(String),
    /// A message failed to (un)marshal against its signature.
    Data(String),
    /// The underlying I/O failed.
    Io(io::Error),
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFault::Eof => write!(f, "end of stream"),
            TransportFault::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            TransportFault::Data(msg) => write!(f, "marshalling fault: {msg}"),
            TransportFault::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for TransportFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportFault::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportFault {
    fn from(e: io::Error) -> Self {
        TransportFault::Io(e)
    }
}

/// Translate a fault into the fatal error that crashes the connection:
/// end-of-stream becomes [`Error::ConnectionLost`], wire-format violations
/// pass through, everything else is a transport error.
pub(crate) fn fatal_error(fault: TransportFault) -> Error {
    match fault {
        TransportFault::Eof => Error::ConnectionLost,
        TransportFault::Protocol(msg) => Error::Protocol(msg),
        TransportFault::Data(msg) => Error::Transport(std::sync::Arc::new(io::Error::new(
            io::ErrorKind::InvalidData,
            msg,
        ))),
        TransportFault::Io(e) => Error::Transport(std::sync::Arc::new(e)),
    }
}

/// The writing half of a transport.
#[async_trait]
pub trait TransportTx: Send {
    /// Write one message. A partial write is unrecoverable; the caller
    /// crashes the connection on anything but a `Data` fault.
    async fn send(&mut self, msg: &Message) -> Result<(), TransportFault>;

    /// Tear the channel down. Infallible by contract; implementations
    /// swallow their own errors.
    async fn shutdown(&mut self);
}

/// The reading half of a transport.
#[async_trait]
pub trait TransportRx: Send + Sync {
    /// Read the next message, or report why there will be no more.
    async fn recv(&mut self) -> Result<Message, TransportFault>;
}

/// Descriptive metadata about a transport, kept for state introspection
/// after the owned halves have been claimed by the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    /// Transport kind, e.g. `"unix"`, `"tcp"`, `"loopback"`.
    pub kind: String,
    /// The address the transport was opened from, when known.
    pub address: Option<Address>,
}

impl Default for TransportInfo {
    fn default() -> Self {
        TransportInfo {
            kind: "unknown".to_string(),
            address: None,
        }
    }
}

/// An authenticated, framed, bidirectional message channel.
pub struct Transport {
    pub tx: Box<dyn TransportTx>,
    pub rx: Box<dyn TransportRx>,
    pub info: TransportInfo,
}

impl Transport {
    pub fn new(tx: impl TransportTx + 'static, rx: impl TransportRx + 'static) -> Self {
        Transport {
            tx: Box::new(tx),
            rx: Box::new(rx),
            info: TransportInfo::default(),
        }
    }

    /// Attach descriptive metadata; factories set this so
    /// [`Connection::transport`](crate::Connection::transport) has
    /// something to report.
    pub fn with_info(mut self, info: TransportInfo) -> Self {
        self.info = info;
        self
    }
}

// ============================================================================
// Server identity and addresses
// ============================================================================

/// A server identity embedded in an authenticated transport, used to dedupe
/// shared connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Guid(String);

impl Guid {
    pub fn new(s: impl Into<String>) -> Self {
        Guid(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One parsed server address: transport kind, its parameters, and the
/// server GUID when the address carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub kind: String,
    pub params: Vec<(String, String)>,
    pub guid: Option<Guid>,
}

/// Opens and authenticates a transport for an address list.
///
/// Authentication yields the server's GUID, which
/// [`Connection::from_addresses`](crate::Connection::from_addresses) uses
/// for connection sharing.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, addresses: &[Address]) -> Result<(Guid, Transport), Error>;
}

// ============================================================================
// Loopback
// ============================================================================

/// The scripted peer end of a [`loopback`] transport.
///
/// Whatever the connection sends arrives at [`LoopbackPeer::recv`];
/// messages pushed through [`LoopbackPeer::send`] arrive at the
/// connection's dispatcher. Dropping the peer (or calling
/// [`LoopbackPeer::close`]) reads as end-of-stream on the connection side.
pub struct LoopbackPeer {
    to_conn: Option<mpsc::UnboundedSender<Message>>,
    from_conn: mpsc::UnboundedReceiver<Message>,
}

impl LoopbackPeer {
    /// Deliver a message to the connection. Returns false once the
    /// connection has shut its receive side down.
    pub fn send(&self, msg: Message) -> bool {
        match &self.to_conn {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// The next message the connection wrote, or `None` after it shut the
    /// transport down.
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_conn.recv().await
    }

    /// Stop feeding the connection; its dispatcher observes end-of-stream.
    pub fn close(&mut self) {
        self.to_conn = None;
    }
}

struct LoopbackTx {
    tx: Option<mpsc::UnboundedSender<Message>>,
}

#[async_trait]
impl TransportTx for LoopbackTx {
    async fn send(&mut self, msg: &Message) -> Result<(), TransportFault> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportFault::Io(broken_pipe()))?;
        tx.send(msg.clone())
            .map_err(|_| TransportFault::Io(broken_pipe()))
    }

    async fn shutdown(&mut self) {
        self.tx = None;
    }
}

struct LoopbackRx {
    rx: mpsc::UnboundedReceiver<Message>,
}

#[async_trait]
impl TransportRx for LoopbackRx {
    async fn recv(&mut self) -> Result<Message, TransportFault> {
        self.rx.recv().await.ok_or(TransportFault::Eof)
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer gone")
}

/// An in-process transport whose far end is a [`LoopbackPeer`].
pub fn loopback() -> (Transport, LoopbackPeer) {
    let (conn_tx, peer_rx) = mpsc::unbounded_channel();
    let (peer_tx, conn_rx) = mpsc::unbounded_channel();
    let transport = Transport::new(LoopbackTx { tx: Some(conn_tx) }, LoopbackRx { rx: conn_rx })
        .with_info(TransportInfo {
            kind: "loopback".to_string(),
            address: None,
        });
    let peer = LoopbackPeer {
        to_conn: Some(peer_tx),
        from_conn: peer_rx,
    };
    (transport, peer)
}
