#![deny(unsafe_code)]

//! Client-side D-Bus connection core.
//!
//! One authenticated byte-stream transport, multiplexed into a
//! bidirectional asynchronous message exchange: outgoing messages are
//! serialised under a monotonically increasing serial, incoming messages
//! fan out to reply waiters, signal receivers and exported object
//! handlers through a filter chain, and a single crash routine propagates
//! any fatal fault to every dependent waiter.
//!
//! The entry point is [`Connection`]:
//!
//! ```ignore
//! let (conn, mut peer) = Connection::loopback();
//! conn.set_on_disconnect(|err| tracing::warn!(%err, "gone"));
//!
//! let reply: () = conn
//!     .method_call(None, ObjectPath::root(), "org.freedesktop.DBus.Peer", "Ping", vec![])
//!     .await?;
//! ```
//!
//! Transport establishment, SASL, the wire codec, and the bus method
//! wrappers (Hello, RequestName, ...) are collaborators behind
//! [`TransportFactory`] and the message model in `tramline-wire`.

mod connection;
pub use connection::{Connection, PendingReply};

mod driver;
pub use driver::machine_uuid;

mod errors;
pub use errors::Error;

mod names;
pub use names::NameCell;

mod registry;

mod state;

mod transport;
pub use transport::{
    loopback, Address, Guid, LoopbackPeer, Transport, TransportFactory, TransportFault,
    TransportInfo, TransportRx, TransportTx,
};

mod types;
pub use types::{
    ConnectionConfig, Filter, FilterGuard, ObjectGuard, ObjectHandler, ReceiverGuard,
    SignalFilter, SignalStream,
};

#[cfg(test)]
mod tests;
