//! Match-rule serialisation.
//!
//! A match rule tells the bus which signals to route to a connection. Only
//! the serialised grammar lives here; deciding which incoming messages a
//! local receiver sees is the connection core's job.
//!
//! ```text
//! type='signal',interface='org.example.X',path='/a/b'
//! ```

use std::fmt;

use crate::{
    is_valid_bus_name, is_valid_interface, is_valid_member, MessageType, ObjectPath,
};

/// Highest argument index addressable by an `argN` key.
pub const MAX_ARG_INDEX: u8 = 63;

/// A bus-side signal subscription filter.
///
/// Every `Some` field becomes one `key='value'` pair; fields left `None`
/// match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub message_type: Option<MessageType>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<ObjectPath>,
    pub destination: Option<String>,
    /// `(index, expected string value)` pairs, serialised in the order given.
    pub args: Vec<(u8, String)>,
}

/// A rule field failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleError {
    pub key: String,
    pub value: String,
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid match rule value for {}: {:?}", self.key, self.value)
    }
}

impl std::error::Error for RuleError {}

impl MatchRule {
    pub fn new() -> Self {
        MatchRule::default()
    }

    pub fn with_type(mut self, t: MessageType) -> Self {
        self.message_type = Some(t);
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn with_path(mut self, path: ObjectPath) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_arg(mut self, index: u8, value: impl Into<String>) -> Self {
        self.args.push((index, value.into()));
        self
    }

    /// Serialise to the bus grammar, validating every value.
    pub fn serialize(&self) -> Result<String, RuleError> {
        let mut pairs: Vec<(String, String)> = Vec::new();

        if let Some(t) = self.message_type {
            pairs.push(("type".into(), t.rule_token().into()));
        }
        if let Some(sender) = &self.sender {
            check(is_valid_bus_name(sender), "sender", sender)?;
            pairs.push(("sender".into(), sender.clone()));
        }
        if let Some(interface) = &self.interface {
            check(is_valid_interface(interface), "interface", interface)?;
            pairs.push(("interface".into(), interface.clone()));
        }
        if let Some(member) = &self.member {
            check(is_valid_member(member), "member", member)?;
            pairs.push(("member".into(), member.clone()));
        }
        if let Some(path) = &self.path {
            pairs.push(("path".into(), path.as_str().into()));
        }
        if let Some(destination) = &self.destination {
            check(is_valid_bus_name(destination), "destination", destination)?;
            pairs.push(("destination".into(), destination.clone()));
        }
        for (index, value) in &self.args {
            let key = format!("arg{index}");
            check(*index <= MAX_ARG_INDEX, &key, value)?;
            // The grammar has no escape for the quote character.
            check(!value.contains('\''), &key, value)?;
            pairs.push((key, value.clone()));
        }

        let mut out = String::new();
        for (i, (key, value)) in pairs.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(key);
            out.push_str("='");
            out.push_str(value);
            out.push('\'');
        }
        Ok(out)
    }
}

fn check(ok: bool, key: &str, value: &str) -> Result<(), RuleError> {
    if ok {
        Ok(())
    } else {
        Err(RuleError {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_in_key_order() {
        let rule = MatchRule::new()
            .with_type(MessageType::Signal)
            .with_interface("org.example.X")
            .with_path(ObjectPath::from_components(["a", "b"]).unwrap());
        assert_eq!(
            rule.serialize().unwrap(),
            "type='signal',interface='org.example.X',path='/a/b'"
        );
    }

    #[test]
    fn root_path_serializes_as_slash() {
        let rule = MatchRule::new().with_path(ObjectPath::root());
        assert_eq!(rule.serialize().unwrap(), "path='/'");
    }

    #[test]
    fn empty_rule_is_empty_string() {
        assert_eq!(MatchRule::new().serialize().unwrap(), "");
    }

    #[test]
    fn args_keep_given_order() {
        let rule = MatchRule::new().with_arg(2, "two").with_arg(0, "zero");
        assert_eq!(rule.serialize().unwrap(), "arg2='two',arg0='zero'");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = MatchRule::new().with_sender("no-dots").serialize().unwrap_err();
        assert_eq!(err.key, "sender");

        let err = MatchRule::new().with_member("has.dot").serialize().unwrap_err();
        assert_eq!(err.key, "member");

        let err = MatchRule::new().with_arg(9, "don't").serialize().unwrap_err();
        assert_eq!(err.key, "arg9");

        assert!(MatchRule::new().with_arg(64, "x").serialize().is_err());
    }

    #[test]
    fn full_rule_round() {
        let rule = MatchRule::new()
            .with_type(MessageType::MethodCall)
            .with_sender(":1.9")
            .with_interface("org.example.Iface")
            .with_member("Frob")
            .with_path(ObjectPath::new("/x").unwrap())
            .with_destination("org.example.Dest")
            .with_arg(0, "hello");
        assert_eq!(
            rule.serialize().unwrap(),
            "type='method_call',sender=':1.9',interface='org.example.Iface',\
             member='Frob',path='/x',destination='org.example.Dest',arg0='hello'"
        );
    }
}
