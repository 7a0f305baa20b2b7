//! Protocol error names and the error-reply payload.

use std::fmt;

use crate::is_valid_error_name;

/// Standard error names reserved by the protocol.
pub mod names {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
}

/// The name/text pair carried by an Error message.
///
/// This is what an Error reply decodes to before the connection maps it to
/// a native error, and what native errors serialise to on the way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusError {
    name: String,
    message: String,
}

impl BusError {
    /// Validates the error name; falls back to `Failed` on a bad one so a
    /// malformed peer error never turns into a local failure.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let name = if is_valid_error_name(&name) {
            name
        } else {
            names::FAILED.to_string()
        };
        BusError {
            name,
            message: message.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for BusError {}
