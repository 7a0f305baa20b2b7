//! The dispatcher task.
//!
//! A single task owns the receive half of the transport. One iteration:
//! wait out the down gate, read one message (racing the crash watch),
//! thread it through the incoming filter chain, then route it to exactly
//! one destination: a reply waiter, the signal receivers, or an exported
//! object handler. Bus bookkeeping (NameOwnerChanged, NameAcquired,
//! NameLost) and the Peer interface are handled inline.
//!
//! On exit the dispatcher crashes the connection (idempotently: the crash
//! may have been initiated elsewhere) and then runs the user's disconnect
//! handler, except after a clean close.

use std::sync::{Arc, OnceLock};

use tokio::sync::watch;
use tramline_wire::{
    is_unique_name, names, DecodeBody, Message, MessageType, Node, ObjectPath, Value,
    BUS_INTERFACE, BUS_NAME, BUS_PATH, INTROSPECTABLE_INTERFACE, PEER_INTERFACE,
};

use crate::state::RunningState;
use crate::transport::{fatal_error, TransportRx};
use crate::types::{apply_chain, lock, ChainOutcome};
use crate::{Connection, Error};

pub(crate) struct Driver {
    conn: Connection,
    rs: Arc<RunningState>,
    rx: Box<dyn TransportRx>,
}

impl Driver {
    pub(crate) fn new(conn: Connection, rs: Arc<RunningState>, rx: Box<dyn TransportRx>) -> Self {
        Driver { conn, rs, rx }
    }

    /// Hand the driver to its own task. Must run inside a runtime.
    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        let exit = self.read_loop().await;
        let err = self.conn.inner.set_crash(exit).await;

        if matches!(err, Error::ConnectionClosed) {
            return;
        }
        let handler = lock(&self.rs.on_disconnect).take();
        match handler {
            Some(handler) => handler(err),
            None => {
                tracing::error!(error = %err, "connection failed and no disconnect handler is installed");
                std::process::exit(1);
            }
        }
    }

    async fn read_loop(&mut self) -> Error {
        let mut crash_rx = self.rs.crash.subscribe();
        let mut up_rx = self.rs.up.subscribe();

        loop {
            if let Err(err) = gate(&mut crash_rx, &mut up_rx).await {
                return err;
            }

            let msg = tokio::select! {
                biased;

                err = crashed(&mut crash_rx) => return err,

                result = self.rx.recv() => match result {
                    Ok(msg) => msg,
                    Err(fault) => return fatal_error(fault),
                },
            };

            // A read that was in flight when the gate went down still
            // completes; hold the message until delivery is resumed.
            if let Err(err) = gate(&mut crash_rx, &mut up_rx).await {
                return err;
            }

            tracing::trace!(serial = msg.serial, r#type = %msg.message_type, "message received");

            let msg = {
                let mut filters = lock(&self.rs.incoming_filters);
                match apply_chain(&mut filters, msg) {
                    ChainOutcome::Pass(m) => m,
                    ChainOutcome::Dropped => {
                        tracing::debug!("incoming message dropped by filter");
                        continue;
                    }
                    ChainOutcome::Aborted(err) => {
                        tracing::warn!(error = %err, "incoming filter failed, message dropped");
                        continue;
                    }
                }
            };

            match msg.message_type {
                MessageType::MethodReturn | MessageType::Error => self.deliver_reply(msg),
                MessageType::Signal => self.handle_signal(msg),
                MessageType::MethodCall => self.handle_call(msg).await,
            }
        }
    }

    // ========================================================================
    // Replies
    // ========================================================================

    fn deliver_reply(&self, msg: Message) {
        let Some(serial) = msg.reply_serial else {
            tracing::debug!("reply without reply serial dropped");
            return;
        };
        let waiter = lock(&self.rs.reply_waiters).remove(&serial);
        let Some(waiter) = waiter else {
            tracing::debug!(serial, "unmatched reply dropped");
            return;
        };

        let outcome = match msg.message_type {
            MessageType::Error => {
                let name = msg.error_name.clone().unwrap_or_default();
                let text = msg.first_string().unwrap_or("").to_string();
                Err(Error::from_reply(&name, &text))
            }
            _ => Ok(msg),
        };
        if waiter.send(outcome).is_err() {
            // The caller cancelled its await; the reply is dropped
            // silently.
            tracing::trace!(serial, "reply arrived after caller went away");
        }
    }

    // ========================================================================
    // Signals
    // ========================================================================

    fn handle_signal(&self, msg: Message) {
        // Bookkeeping runs before any receiver sees the signal.
        if msg.sender.as_deref() == Some(BUS_NAME)
            && msg.path.as_ref().is_some_and(|p| p.as_str() == BUS_PATH)
            && msg.interface.as_deref() == Some(BUS_INTERFACE)
        {
            self.bus_bookkeeping(&msg);
        }

        // On a bus-attached connection, only broadcasts and signals
        // addressed to us reach user receivers.
        if let Some(own_name) = lock(&self.rs.name).clone() {
            if let Some(destination) = &msg.destination {
                if *destination != own_name {
                    tracing::debug!(%destination, "signal for another connection dropped");
                    return;
                }
            }
        }

        let sinks: Vec<_> = {
            let receivers = lock(&self.rs.signal_receivers);
            receivers
                .iter()
                .filter(|r| self.signal_matches(&r.filter, &msg))
                .map(|r| r.sink.clone())
                .collect()
        };
        for sink in sinks {
            if sink.send(msg.clone()).is_err() {
                tracing::debug!("signal sink gone, delivery skipped");
            }
        }
    }

    fn signal_matches(&self, filter: &crate::SignalFilter, msg: &Message) -> bool {
        if let Some(want) = &filter.sender {
            if !self.sender_matches(want, msg.sender.as_deref()) {
                return false;
            }
        }
        filter.matches_headers(msg)
    }

    /// A sender filter names either a unique name, compared directly, or a
    /// well-known name, compared against its resolved owner when an
    /// owner-tracking cell exists.
    fn sender_matches(&self, want: &str, sender: Option<&str>) -> bool {
        if is_unique_name(want) {
            return sender == Some(want);
        }
        let cell = lock(&self.rs.resolvers).get(want).cloned();
        match cell {
            Some(cell) => match cell.owner() {
                Some(owner) => sender == Some(owner.as_str()),
                None => false,
            },
            None => sender == Some(want),
        }
    }

    fn bus_bookkeeping(&self, msg: &Message) {
        match msg.member.as_deref() {
            Some("NameOwnerChanged") => {
                let Ok((name, _old, new)) = <(String, String, String)>::decode(&msg.body) else {
                    tracing::warn!("malformed NameOwnerChanged dropped");
                    return;
                };
                let new_owner = (!new.is_empty()).then_some(new);

                let cell = lock(&self.rs.resolvers).get(&name).cloned();
                if let Some(cell) = cell {
                    // Overtakes a still-outstanding GetNameOwner reply.
                    cell.set_owner(new_owner.clone());
                }

                if is_unique_name(&name) && new_owner.is_none() {
                    lock(&self.rs.exited_peers).put(name, ());
                }
            }
            Some("NameAcquired") if self.destined_to_us(msg) => {
                let Ok((name,)) = <(String,)>::decode(&msg.body) else {
                    tracing::warn!("malformed NameAcquired dropped");
                    return;
                };
                let mut acquired = lock(&self.rs.acquired_names);
                if !acquired.contains(&name) {
                    acquired.push(name);
                }
            }
            Some("NameLost") if self.destined_to_us(msg) => {
                let Ok((name,)) = <(String,)>::decode(&msg.body) else {
                    tracing::warn!("malformed NameLost dropped");
                    return;
                };
                lock(&self.rs.acquired_names).retain(|n| *n != name);
            }
            _ => {}
        }
    }

    fn destined_to_us(&self, msg: &Message) -> bool {
        match (&msg.destination, lock(&self.rs.name).as_deref()) {
            (None, _) => true,
            // Directed bookkeeping can arrive before Hello finishes.
            (Some(_), None) => true,
            (Some(dest), Some(own)) => dest == own,
        }
    }

    // ========================================================================
    // Method calls
    // ========================================================================

    async fn handle_call(&self, msg: Message) {
        if msg.interface.as_deref() == Some(PEER_INTERFACE) {
            self.handle_peer_call(&msg).await;
            return;
        }

        let handler = msg
            .path
            .as_ref()
            .and_then(|path| lock(&self.rs.objects).get(path).map(|e| e.handler.clone()));
        if let Some(handler) = handler {
            // Handlers run on their own task so a slow one cannot stall
            // dispatch. They send their own reply or error.
            let conn = self.conn.clone();
            tokio::spawn(async move {
                let path = msg.path.clone();
                if let Err(err) = handler.handle_call(&conn, msg).await {
                    tracing::warn!(path = ?path, error = %err, "object handler failed");
                }
            });
            return;
        }

        // No exact export. Parent paths of exported objects exist
        // virtually so a walk from `/` reaches every leaf.
        if msg.member.as_deref() == Some("Introspect")
            && msg
                .interface
                .as_deref()
                .is_none_or(|i| i == INTROSPECTABLE_INTERFACE)
        {
            if let Some(path) = &msg.path {
                let children = self.direct_children(path);
                if !children.is_empty() {
                    let node = Node::with_children(children);
                    let reply =
                        Message::method_return(&msg).with_body(vec![Value::Str(node.to_xml())]);
                    self.reply_if_expected(&msg, reply).await;
                    return;
                }
            }
        }

        let path = msg
            .path
            .as_ref()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default();
        self.error_if_expected(&msg, names::FAILED, &format!("No such object: {path:?}"))
            .await;
    }

    async fn handle_peer_call(&self, msg: &Message) {
        match msg.member.as_deref() {
            Some("Ping") => {
                self.reply_if_expected(msg, Message::method_return(msg)).await;
            }
            Some("GetMachineId") => match machine_uuid() {
                Some(id) => {
                    let reply = Message::method_return(msg).with_body(vec![Value::Str(id)]);
                    self.reply_if_expected(msg, reply).await;
                }
                None => {
                    self.error_if_expected(msg, names::FAILED, "machine id unavailable")
                        .await;
                }
            },
            member => {
                let member = member.unwrap_or_default();
                self.error_if_expected(
                    msg,
                    names::UNKNOWN_METHOD,
                    &format!("no method {member:?} on interface {PEER_INTERFACE:?}"),
                )
                .await;
            }
        }
    }

    /// Direct children of `path` in the exported set: every distinct first
    /// component that continues some exported path below `path`.
    fn direct_children(&self, path: &ObjectPath) -> Vec<String> {
        let prefix: Vec<&str> = path.components().collect();
        let mut children: Vec<String> = Vec::new();
        {
            let objects = lock(&self.rs.objects);
            for exported in objects.keys() {
                let components: Vec<&str> = exported.components().collect();
                if components.len() > prefix.len() && components[..prefix.len()] == prefix[..] {
                    let child = components[prefix.len()].to_string();
                    if !children.contains(&child) {
                        children.push(child);
                    }
                }
            }
        }
        children.sort();
        children
    }

    async fn reply_if_expected(&self, call: &Message, reply: Message) {
        if !call.expects_reply() {
            return;
        }
        if let Err(err) = self.conn.send_message(reply).await {
            tracing::debug!(error = %err, "inline reply not sent");
        }
    }

    async fn error_if_expected(&self, call: &Message, name: &str, text: &str) {
        if !call.expects_reply() {
            return;
        }
        if let Err(err) = self.conn.send_error(call, name, text).await {
            tracing::debug!(error = %err, "inline error reply not sent");
        }
    }
}

/// The down gate: park while delivery is paused, bailing out with the
/// crash error if the connection dies meanwhile.
async fn gate(
    crash_rx: &mut watch::Receiver<Option<Error>>,
    up_rx: &mut watch::Receiver<bool>,
) -> Result<(), Error> {
    loop {
        if let Some(err) = crash_rx.borrow_and_update().clone() {
            return Err(err);
        }
        if *up_rx.borrow_and_update() {
            return Ok(());
        }
        tokio::select! {
            _ = up_rx.changed() => {}
            _ = crash_rx.changed() => {}
        }
    }
}

/// Resolve once the crash watch fires.
async fn crashed(rx: &mut watch::Receiver<Option<Error>>) -> Error {
    match rx.wait_for(|v| v.is_some()).await {
        Ok(value) => value.clone().unwrap_or(Error::ConnectionClosed),
        Err(_) => Error::ConnectionClosed,
    }
}

/// The host machine UUID, as `GetMachineId` reports it. Read once from
/// the usual locations and cached.
pub fn machine_uuid() -> Option<String> {
    static MACHINE_ID: OnceLock<Option<String>> = OnceLock::new();
    MACHINE_ID
        .get_or_init(|| {
            for path in ["/var/lib/dbus/machine-id", "/etc/machine-id"] {
                if let Ok(contents) = std::fs::read_to_string(path) {
                    let id = contents.trim();
                    if !id.is_empty() {
                        return Some(id.to_string());
                    }
                }
            }
            None
        })
        .clone()
}
