//! Registration types: signal receivers, filters, exported objects, and
//! the RAII guards that deregister them.

use std::sync::{Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tramline_wire::{Message, ObjectPath};

use crate::state::RunningState;
use crate::{Connection, Error};

/// Poison-tolerant lock. State behind these mutexes is only ever touched
/// between suspension points, so a poisoned value is still coherent.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for a new connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the cache remembering unique names that lost their
    /// owner. Default: 100.
    pub exited_peer_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            exited_peer_capacity: 100,
        }
    }
}

// ============================================================================
// Serial allocation
// ============================================================================

/// The 32-bit wrapping serial counter. Lives under the send mutex; the
/// current value is assigned to a message and only advanced once the
/// transport write succeeded. Zero is skipped on wrap.
#[derive(Debug)]
pub(crate) struct SerialCounter {
    next: u32,
}

impl SerialCounter {
    pub(crate) fn new() -> Self {
        SerialCounter { next: 1 }
    }

    pub(crate) fn peek(&self) -> u32 {
        self.next
    }

    pub(crate) fn advance(&mut self) {
        self.next = self.next.wrapping_add(1);
        if self.next == 0 {
            self.next = 1;
        }
    }
}

// ============================================================================
// Signal receivers
// ============================================================================

/// Which incoming signals a receiver wants.
///
/// Every `Some` field must equal the corresponding message field; `sender`
/// is compared against the resolved unique owner of the given name when an
/// owner-tracking cell for it exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalFilter {
    pub sender: Option<String>,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    /// `(index, expected string)` pairs matched against body elements.
    pub args: Vec<(u8, String)>,
}

impl SignalFilter {
    pub fn new() -> Self {
        SignalFilter::default()
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_path(mut self, path: ObjectPath) -> Self {
        self.path = Some(path);
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

    pub fn with_arg(mut self, index: u8, value: impl Into<String>) -> Self {
        self.args.push((index, value.into()));
        self
    }

    /// Match on everything except the sender field.
    pub(crate) fn matches_headers(&self, msg: &Message) -> bool {
        if let Some(path) = &self.path {
            if msg.path.as_ref() != Some(path) {
                return false;
            }
        }
        if let Some(interface) = &self.interface {
            if msg.interface.as_deref() != Some(interface.as_str()) {
                return false;
            }
        }
        if let Some(member) = &self.member {
            if msg.member.as_deref() != Some(member.as_str()) {
                return false;
            }
        }
        for (index, expected) in &self.args {
            match msg.body.get(*index as usize) {
                Some(tramline_wire::Value::Str(s)) if s == expected => {}
                _ => return false,
            }
        }
        true
    }
}

/// The receiving end of a signal subscription.
pub struct SignalStream {
    pub(crate) rx: mpsc::UnboundedReceiver<Message>,
}

impl SignalStream {
    /// The next matching signal, in transport-arrival order. `None` once
    /// the subscription is gone (guard dropped or connection crashed).
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking variant for scripted tests.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

pub(crate) struct SignalRegistration {
    pub(crate) id: u64,
    pub(crate) filter: SignalFilter,
    pub(crate) sink: mpsc::UnboundedSender<Message>,
}

// ============================================================================
// Filters
// ============================================================================

/// A message transform in one of the two filter chains.
///
/// `Ok(Some)` passes the (possibly rewritten) message on, `Ok(None)` drops
/// it, `Err` aborts the chain: the message is dropped and the failure is
/// logged, but the connection stays up.
pub type Filter = Box<dyn FnMut(Message) -> Result<Option<Message>, Error> + Send>;

pub(crate) struct FilterEntry {
    pub(crate) id: u64,
    pub(crate) filter: Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainKind {
    Incoming,
    Outgoing,
}

pub(crate) enum ChainOutcome {
    Pass(Message),
    Dropped,
    Aborted(Error),
}

/// Thread a message through a chain in insertion order. A `None` return
/// drops it and skips the rest of the chain; a failing filter aborts the
/// chain without touching the connection.
pub(crate) fn apply_chain(filters: &mut [FilterEntry], msg: Message) -> ChainOutcome {
    let mut current = msg;
    for entry in filters.iter_mut() {
        match (entry.filter)(current) {
            Ok(Some(next)) => current = next,
            Ok(None) => return ChainOutcome::Dropped,
            Err(err) => return ChainOutcome::Aborted(err),
        }
    }
    ChainOutcome::Pass(current)
}

// ============================================================================
// Exported objects
// ============================================================================

/// Handler capability for an exported object path.
///
/// The handler is contractually responsible for sending its own reply or
/// error for each call it receives; failures it returns are logged and do
/// not affect the connection.
#[async_trait]
pub trait ObjectHandler: Send + Sync {
    async fn handle_call(&self, connection: &Connection, call: Message) -> Result<(), Error>;

    /// Invoked once when the connection crashes. Failures are swallowed
    /// and logged.
    async fn connection_closed(&self, error: &Error) -> Result<(), Error> {
        let _ = error;
        Ok(())
    }
}

pub(crate) struct ObjectEntry {
    pub(crate) id: u64,
    pub(crate) handler: std::sync::Arc<dyn ObjectHandler>,
}

// ============================================================================
// Registration guards
// ============================================================================

fn remove_filter(state: &Weak<RunningState>, chain: ChainKind, id: u64) {
    if let Some(rs) = state.upgrade() {
        let list = match chain {
            ChainKind::Incoming => &rs.incoming_filters,
            ChainKind::Outgoing => &rs.outgoing_filters,
        };
        lock(list).retain(|entry| entry.id != id);
    }
}

/// Removes its filter from the chain when dropped.
#[must_use = "dropping the guard removes the filter"]
pub struct FilterGuard {
    pub(crate) state: Weak<RunningState>,
    pub(crate) chain: ChainKind,
    pub(crate) id: u64,
    pub(crate) active: bool,
}

impl FilterGuard {
    /// Keep the filter registered for the life of the connection.
    pub fn detach(mut self) {
        self.active = false;
    }
}

impl Drop for FilterGuard {
    fn drop(&mut self) {
        if self.active {
            remove_filter(&self.state, self.chain, self.id);
        }
    }
}

/// Removes its signal receiver when dropped.
#[must_use = "dropping the guard removes the signal receiver"]
pub struct ReceiverGuard {
    pub(crate) state: Weak<RunningState>,
    pub(crate) id: u64,
    pub(crate) active: bool,
}

impl ReceiverGuard {
    /// Keep the receiver registered for the life of the connection.
    pub fn detach(mut self) {
        self.active = false;
    }
}

impl Drop for ReceiverGuard {
    fn drop(&mut self) {
        if self.active {
            if let Some(rs) = self.state.upgrade() {
                lock(&rs.signal_receivers).retain(|r| r.id != self.id);
            }
        }
    }
}

/// Removes its exported object when dropped, unless the path has been
/// re-exported since.
#[must_use = "dropping the guard unexports the object"]
pub struct ObjectGuard {
    pub(crate) state: Weak<RunningState>,
    pub(crate) path: ObjectPath,
    pub(crate) id: u64,
    pub(crate) active: bool,
}

impl ObjectGuard {
    /// Keep the object exported for the life of the connection.
    pub fn detach(mut self) {
        self.active = false;
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }
}

impl Drop for ObjectGuard {
    fn drop(&mut self) {
        if self.active {
            if let Some(rs) = self.state.upgrade() {
                let mut objects = lock(&rs.objects);
                if objects.get(&self.path).is_some_and(|e| e.id == self.id) {
                    objects.remove(&self.path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_counter_wraps_past_zero() {
        let mut c = SerialCounter::new();
        assert_eq!(c.peek(), 1);
        c.advance();
        assert_eq!(c.peek(), 2);

        let mut c = SerialCounter { next: u32::MAX };
        assert_eq!(c.peek(), u32::MAX);
        c.advance();
        assert_eq!(c.peek(), 1);
    }

    #[test]
    fn filter_headers_match_exactly() {
        let msg = Message::signal(
            ObjectPath::new("/a/b").unwrap(),
            "org.example.X",
            "Changed",
        )
        .with_body(vec![tramline_wire::Value::Str("first".into())]);

        assert!(SignalFilter::new().matches_headers(&msg));
        assert!(SignalFilter::new()
            .with_interface("org.example.X")
            .with_member("Changed")
            .matches_headers(&msg));
        assert!(!SignalFilter::new()
            .with_interface("org.example.Y")
            .matches_headers(&msg));
        assert!(!SignalFilter::new()
            .with_path(ObjectPath::new("/a").unwrap())
            .matches_headers(&msg));
    }

    #[test]
    fn arg_filters_compare_string_body_elements() {
        let msg = Message::signal(ObjectPath::root(), "org.example.X", "S").with_body(vec![
            tramline_wire::Value::Str("zero".into()),
            tramline_wire::Value::Uint32(1),
        ]);

        assert!(SignalFilter::new().with_arg(0, "zero").matches_headers(&msg));
        assert!(!SignalFilter::new().with_arg(0, "one").matches_headers(&msg));
        // A non-string element never matches.
        assert!(!SignalFilter::new().with_arg(1, "1").matches_headers(&msg));
        // Out of range never matches.
        assert!(!SignalFilter::new().with_arg(5, "x").matches_headers(&msg));
    }
}
