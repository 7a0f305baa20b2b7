//! The message header/body model.
//!
//! A [`Message`] is the unit the transport sends and receives. Only the
//! routing-relevant header fields are modelled; endianness, padding and
//! header encoding are the transport codec's business.

use std::fmt;

use crate::{ObjectPath, Signature, Value};

/// Per-connection outgoing message identifier, used to correlate replies.
pub type Serial = u32;

/// The four wire message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    /// The value of the `type` key in a match rule.
    pub fn rule_token(self) -> &'static str {
        match self {
            MessageType::MethodCall => "method_call",
            MessageType::MethodReturn => "method_return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rule_token())
    }
}

/// Header flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// The sender does not want a reply; the receiver may skip sending one.
    pub no_reply_expected: bool,
    /// Do not launch an owner for the destination name.
    pub no_auto_start: bool,
}

/// A single protocol message.
///
/// `serial` is assigned by the connection at send time; constructing a
/// message leaves it 0, which never appears on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub serial: Serial,
    pub message_type: MessageType,
    pub flags: Flags,
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<Serial>,
    pub body: Vec<Value>,
}

impl Message {
    fn empty(message_type: MessageType) -> Self {
        Message {
            serial: 0,
            message_type,
            flags: Flags::default(),
            sender: None,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            body: Vec::new(),
        }
    }

    /// A method call on `member` of `interface` at `path`.
    pub fn method_call(
        path: ObjectPath,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        let mut msg = Message::empty(MessageType::MethodCall);
        msg.path = Some(path);
        msg.interface = Some(interface.into());
        msg.member = Some(member.into());
        msg
    }

    /// A successful reply to `call`.
    ///
    /// Copies the reply serial and routes back to the caller.
    pub fn method_return(call: &Message) -> Self {
        let mut msg = Message::empty(MessageType::MethodReturn);
        msg.reply_serial = Some(call.serial);
        msg.destination = call.sender.clone();
        msg
    }

    /// An error reply to `call`. The text becomes the first body element.
    pub fn error(call: &Message, name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut msg = Message::empty(MessageType::Error);
        msg.reply_serial = Some(call.serial);
        msg.destination = call.sender.clone();
        msg.error_name = Some(name.into());
        msg.body = vec![Value::Str(text.into())];
        msg
    }

    /// A signal emitted from `path`.
    pub fn signal(
        path: ObjectPath,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        let mut msg = Message::empty(MessageType::Signal);
        msg.path = Some(path);
        msg.interface = Some(interface.into());
        msg.member = Some(member.into());
        msg
    }

    /// Set the destination name.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Set the sender name.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Set the body values.
    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    /// Set header flags.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether the sender is waiting for a reply to this message.
    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall && !self.flags.no_reply_expected
    }

    /// The concatenated signature of the body values.
    pub fn body_signature(&self) -> Signature {
        crate::signature_of(&self.body)
    }

    /// The first body element, if it is a string. Error replies carry their
    /// human-readable text this way.
    pub fn first_string(&self) -> Option<&str> {
        match self.body.first() {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_return_routes_back_to_caller() {
        let mut call = Message::method_call(ObjectPath::root(), "org.example.X", "Frob")
            .with_sender(":1.7");
        call.serial = 42;

        let reply = Message::method_return(&call);
        assert_eq!(reply.message_type, MessageType::MethodReturn);
        assert_eq!(reply.reply_serial, Some(42));
        assert_eq!(reply.destination.as_deref(), Some(":1.7"));
    }

    #[test]
    fn error_reply_carries_text_in_body() {
        let mut call = Message::method_call(ObjectPath::root(), "org.example.X", "Frob");
        call.serial = 3;

        let err = Message::error(&call, "org.freedesktop.DBus.Error.Failed", "nope");
        assert_eq!(err.reply_serial, Some(3));
        assert_eq!(err.error_name.as_deref(), Some("org.freedesktop.DBus.Error.Failed"));
        assert_eq!(err.first_string(), Some("nope"));
    }

    #[test]
    fn no_reply_flag_suppresses_expects_reply() {
        let mut call = Message::method_call(ObjectPath::root(), "org.example.X", "Frob");
        assert!(call.expects_reply());
        call.flags.no_reply_expected = true;
        assert!(!call.expects_reply());
    }
}
