#![deny(unsafe_code)]

//! Message model and shared grammar for the tramline D-Bus client.
//!
//! This crate holds everything both sides of the connection core agree on
//! without doing any I/O: the [`Message`] header/body model, the dynamic
//! [`Value`] type and its signatures, name and path validation, match-rule
//! serialisation, well-known error names, and the introspection document
//! type. Binary (un)marshalling lives behind the transport, not here.

mod message;
pub use message::*;

mod value;
pub use value::*;

mod validate;
pub use validate::*;

mod match_rule;
pub use match_rule::*;

mod error_name;
pub use error_name::*;

mod introspect;
pub use introspect::*;

/// Well-known name of the message bus itself.
pub const BUS_NAME: &str = "org.freedesktop.DBus";

/// Object path of the message bus object.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";

/// Interface carrying the bus methods and bookkeeping signals.
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Interface every peer must answer inline.
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// Interface for the introspection document.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
