//! The connection error ladder.
//!
//! Fatal kinds crash the connection and are then returned by every
//! subsequent operation, so [`Error`] is `Clone` and I/O causes are kept
//! behind an `Arc`. Non-fatal kinds only ever surface to the one caller
//! that hit them.

use std::fmt;
use std::io;
use std::sync::Arc;

use tramline_wire::{names, BodyError, BusError, Signature};

/// Everything a connection operation can fail with.
#[derive(Debug, Clone)]
pub enum Error {
    /// `close()` was called. Clean shutdown; suppressed from the
    /// disconnect handler.
    ConnectionClosed,
    /// The transport reported end-of-stream.
    ConnectionLost,
    /// The peer violated the wire format.
    Protocol(String),
    /// The transport failed mid-operation; the stream may be partially
    /// written and cannot be recovered.
    Transport(Arc<io::Error>),
    /// A message body failed to encode. The connection stays up.
    Data(String),
    /// A reply body was signature-compatible but would not convert.
    Cast(String),
    /// A reply body's signature differed from the expected one.
    SignatureMismatch { expected: Signature, got: Signature },
    /// An outgoing filter dropped the message before it hit the wire.
    FilterDropped,
    /// The peer answered a method call with an Error message.
    Method(BusError),
}

impl Error {
    /// Whether this kind crashes the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed
                | Error::ConnectionLost
                | Error::Protocol(_)
                | Error::Transport(_)
        )
    }

    /// Build the native error for an incoming Error reply.
    pub fn from_reply(name: &str, text: &str) -> Error {
        Error::Method(BusError::new(name, text))
    }

    /// The protocol name/text pair for this error, if it maps to one
    /// directly.
    pub fn as_bus_error(&self) -> Option<&BusError> {
        match self {
            Error::Method(e) => Some(e),
            _ => None,
        }
    }

    /// Map any native error to an error-reply payload. Kinds without a
    /// reserved name serialise as `Failed` with their display text.
    pub fn to_bus_error(&self) -> BusError {
        match self {
            Error::Method(e) => e.clone(),
            Error::ConnectionClosed | Error::ConnectionLost => {
                BusError::new(names::DISCONNECTED, self.to_string())
            }
            other => BusError::new(names::FAILED, other.to_string()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::ConnectionLost => write!(f, "connection lost"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Data(msg) => write!(f, "data error: {msg}"),
            Error::Cast(msg) => write!(f, "cast failure: {msg}"),
            Error::SignatureMismatch { expected, got } => {
                write!(f, "signature mismatch: expected {expected:?}, got {got:?}")
            }
            Error::FilterDropped => write!(f, "message dropped by outgoing filter"),
            Error::Method(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e.as_ref()),
            Error::Method(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BodyError> for Error {
    fn from(e: BodyError) -> Self {
        match e {
            BodyError::SignatureMismatch { expected, got } => {
                Error::SignatureMismatch { expected, got }
            }
            BodyError::Cast(c) => Error::Cast(c.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_split() {
        assert!(Error::ConnectionClosed.is_fatal());
        assert!(Error::ConnectionLost.is_fatal());
        assert!(Error::Protocol("x".into()).is_fatal());
        assert!(!Error::Data("x".into()).is_fatal());
        assert!(!Error::FilterDropped.is_fatal());
        assert!(!Error::Method(BusError::new(names::FAILED, "")).is_fatal());
    }

    #[test]
    fn reply_mapping_round_trips_known_names() {
        let e = Error::from_reply(names::UNKNOWN_METHOD, "nope");
        let bus = e.as_bus_error().unwrap();
        assert_eq!(bus.name(), names::UNKNOWN_METHOD);
        assert_eq!(bus.message(), "nope");
    }

    #[test]
    fn unmapped_kinds_serialise_as_failed() {
        let bus = Error::Data("encode".into()).to_bus_error();
        assert_eq!(bus.name(), names::FAILED);
    }
}
