//! The connection handle and its public operations.
//!
//! A [`Connection`] is a cheap clone over shared state. Every operation
//! first consults the state cell: once the connection has crashed, all of
//! them fail synchronously with the stored error.
//!
//! Sends run under one mutex that covers serial assignment, the outgoing
//! filter chain, reply registration and the transport write. That single
//! critical section is what makes serials strictly increasing on the wire
//! and guarantees a reply waiter exists before the peer can see the
//! request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tramline_wire::{DecodeBody, Message, ObjectPath, Serial, Value};

use crate::driver::Driver;
use crate::names::NameCell;
use crate::registry;
use crate::state::{Inner, RunningState, StateCell};
use crate::transport::{
    self, Address, Guid, LoopbackPeer, Transport, TransportFactory, TransportFault, TransportInfo,
};
use crate::types::{
    apply_chain, lock, ChainKind, ChainOutcome, ConnectionConfig, Filter, FilterEntry,
    FilterGuard, ObjectEntry, ObjectGuard, ObjectHandler, ReceiverGuard, SignalFilter,
    SignalRegistration, SignalStream,
};
use crate::Error;

/// A handle to one client-side connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

/// A reply that has been registered but not yet received.
///
/// Dropping this future cancels only the caller's await; the reply slot
/// stays until the reply arrives (and is then dropped silently) or the
/// connection crashes (and the slot is woken with the crash error).
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Message, Error>>,
}

impl Future for PendingReply {
    type Output = Result<Message, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(outcome) => outcome,
            // The waiter map never drops a sender without completing it;
            // this arm only fires if the state was torn down around us.
            Err(_) => Err(Error::ConnectionClosed),
        })
    }
}

impl Connection {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Wrap an authenticated transport and start the dispatcher.
    ///
    /// With a `guid`, the connection participates in process-wide sharing:
    /// an already-registered connection for the same identity is returned
    /// instead, and the given transport is torn down.
    pub fn from_transport(transport: Transport, guid: Option<Guid>) -> Connection {
        Self::from_transport_with_config(transport, guid, ConnectionConfig::default())
    }

    /// [`Connection::from_transport`] with explicit tunables.
    pub fn from_transport_with_config(
        transport: Transport,
        guid: Option<Guid>,
        config: ConnectionConfig,
    ) -> Connection {
        if let Some(guid) = &guid {
            if let Some(existing) = registry::lookup(guid) {
                tracing::debug!(%guid, "reusing shared connection");
                discard_transport(transport);
                return existing;
            }
        }

        let (conn, driver) = Self::build(transport, guid.clone(), &config);

        if let Some(guid) = &guid {
            let winner = registry::register(guid, conn.clone());
            if !winner.ptr_eq(&conn.inner) {
                // Someone registered the same identity while we were
                // constructing; our fresh connection is surplus.
                tracing::debug!(%guid, "lost registration race, reusing winner");
                let loser = conn;
                tokio::spawn(async move { loser.close().await });
                return winner;
            }
        }

        driver.spawn();
        conn
    }

    /// Open a (by default shared) connection for an address list.
    ///
    /// Any address whose GUID is already registered short-circuits to the
    /// existing connection. Otherwise the factory opens and authenticates
    /// a transport; the authenticated GUID is checked against the registry
    /// once more, because authentication runs concurrently and another
    /// task may have registered the same server in the meantime.
    pub async fn from_addresses(
        factory: &dyn TransportFactory,
        addresses: &[Address],
        shared: bool,
    ) -> Result<Connection, Error> {
        if shared {
            for address in addresses {
                if let Some(guid) = &address.guid {
                    if let Some(existing) = registry::lookup(guid) {
                        return Ok(existing);
                    }
                }
            }
        }

        let (guid, transport) = factory.open(addresses).await?;
        Ok(Self::from_transport(transport, shared.then_some(guid)))
    }

    /// An unshared in-process connection plus its scripted peer end.
    pub fn loopback() -> (Connection, LoopbackPeer) {
        let (transport, peer) = transport::loopback();
        (Self::from_transport(transport, None), peer)
    }

    fn build(
        transport: Transport,
        guid: Option<Guid>,
        config: &ConnectionConfig,
    ) -> (Connection, Driver) {
        let Transport { tx, rx, info } = transport;
        let running = Arc::new(RunningState::new(tx, info, guid, config));
        let inner = Arc::new(Inner {
            cell: StateCell::new(running.clone()),
        });
        let conn = Connection { inner };
        let driver = Driver::new(conn.clone(), running, rx);
        (conn, driver)
    }

    pub(crate) fn ptr_eq(&self, inner: &Arc<Inner>) -> bool {
        Arc::ptr_eq(&self.inner, inner)
    }

    pub(crate) fn is_inner(&self, inner: &Inner) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner), inner)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Whether the connection is still running.
    pub fn is_running(&self) -> bool {
        self.inner.cell.crash_error().is_none()
    }

    /// The stored fatal error, once crashed.
    pub fn crash_error(&self) -> Option<Error> {
        self.inner.cell.crash_error()
    }

    /// Resolves with the fatal error once the connection crashes.
    pub async fn watch(&self) -> Error {
        let rs = match self.inner.cell.running() {
            Ok(rs) => rs,
            Err(err) => return err,
        };
        let mut rx = rs.crash.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(err) = current {
                return err;
            }
            if rx.changed().await.is_err() {
                return self
                    .inner
                    .cell
                    .crash_error()
                    .unwrap_or(Error::ConnectionClosed);
            }
        }
    }

    /// Crash the connection cleanly. Idempotent; every outstanding and
    /// subsequent operation fails with [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        let _ = self.inner.set_crash(Error::ConnectionClosed).await;
    }

    /// Install the fatal handler, replacing any previous one.
    ///
    /// It runs at most once, after the dispatcher has exited, and never
    /// for a clean [`close`](Connection::close). Without a handler the
    /// default logs the error and terminates the process.
    pub fn set_on_disconnect(&self, handler: impl FnOnce(Error) + Send + 'static) {
        if let Ok(rs) = self.inner.cell.running() {
            *lock(&rs.on_disconnect) = Some(Box::new(handler));
        }
    }

    // ========================================================================
    // Flow control
    // ========================================================================

    /// Whether the dispatcher is delivering. False once crashed.
    pub fn is_up(&self) -> bool {
        match self.inner.cell.running() {
            Ok(rs) => *rs.up.borrow(),
            Err(_) => false,
        }
    }

    /// Pause delivery: the dispatcher parks before its next read.
    pub fn set_down(&self) -> Result<(), Error> {
        let rs = self.inner.cell.running()?;
        let _ = rs.up.send(false);
        Ok(())
    }

    /// Resume delivery.
    pub fn set_up(&self) -> Result<(), Error> {
        let rs = self.inner.cell.running()?;
        let _ = rs.up.send(true);
        Ok(())
    }

    // ========================================================================
    // State introspection
    // ========================================================================

    /// The shared server identity, when there is one.
    pub fn guid(&self) -> Option<Guid> {
        self.inner.cell.running().ok().and_then(|rs| rs.guid.clone())
    }

    /// Descriptive metadata about the underlying transport. The owned
    /// halves stay exclusive to the connection; `None` once crashed.
    pub fn transport(&self) -> Option<TransportInfo> {
        self.inner
            .cell
            .running()
            .ok()
            .map(|rs| rs.transport.clone())
    }

    /// The unique bus name, once the bus layer has completed Hello.
    pub fn unique_name(&self) -> Option<String> {
        self.inner
            .cell
            .running()
            .ok()
            .and_then(|rs| lock(&rs.name).clone())
    }

    /// Record the unique name handed out by the bus. One-shot: the bus
    /// layer calls this exactly once after Hello.
    pub fn set_unique_name(&self, name: impl Into<String>) -> Result<(), Error> {
        let rs = self.inner.cell.running()?;
        let mut slot = lock(&rs.name);
        if slot.is_some() {
            return Err(Error::Data("unique name already set".into()));
        }
        *slot = Some(name.into());
        Ok(())
    }

    /// The well-known names this connection currently owns.
    pub fn acquired_names(&self) -> Vec<String> {
        self.inner
            .cell
            .running()
            .map(|rs| lock(&rs.acquired_names).clone())
            .unwrap_or_default()
    }

    /// Whether `name` was recently seen to lose its owner.
    pub fn peer_exited(&self, name: &str) -> bool {
        match self.inner.cell.running() {
            Ok(rs) => lock(&rs.exited_peers).contains(name),
            Err(_) => false,
        }
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Send one message, fire-and-forget. Returns the serial it went out
    /// under.
    pub async fn send_message(&self, msg: Message) -> Result<Serial, Error> {
        let (serial, _) = self.send_internal(msg, false).await?;
        Ok(serial)
    }

    /// Send a message and register for its reply.
    ///
    /// The returned future resolves to the Method-Return message, or fails
    /// with the mapped error for an Error reply or the crash error.
    pub async fn send_message_with_reply(&self, msg: Message) -> Result<PendingReply, Error> {
        let (_, pending) = self.send_internal(msg, true).await?;
        Ok(pending.expect("reply requested"))
    }

    /// Call a method and decode the reply body.
    pub async fn method_call<R: DecodeBody>(
        &self,
        destination: Option<&str>,
        path: ObjectPath,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Result<R, Error> {
        let mut msg = Message::method_call(path, interface, member).with_body(body);
        msg.destination = destination.map(String::from);
        let reply = self.send_message_with_reply(msg).await?.await?;
        Ok(R::decode(&reply.body)?)
    }

    /// Call a method with `no_reply_expected`; nothing comes back.
    pub async fn method_call_no_reply(
        &self,
        destination: Option<&str>,
        path: ObjectPath,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Result<(), Error> {
        let mut msg = Message::method_call(path, interface, member).with_body(body);
        msg.destination = destination.map(String::from);
        msg.flags.no_reply_expected = true;
        self.send_message(msg).await?;
        Ok(())
    }

    /// Emit a signal from `path`.
    pub async fn emit_signal(
        &self,
        path: ObjectPath,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Result<(), Error> {
        self.send_message(Message::signal(path, interface, member).with_body(body))
            .await?;
        Ok(())
    }

    /// Send the successful reply to `call`.
    pub async fn send_reply(&self, call: &Message, body: Vec<Value>) -> Result<(), Error> {
        self.send_message(Message::method_return(call).with_body(body))
            .await?;
        Ok(())
    }

    /// Send an error reply to `call`.
    pub async fn send_error(
        &self,
        call: &Message,
        name: &str,
        text: &str,
    ) -> Result<(), Error> {
        self.send_message(Message::error(call, name, text)).await?;
        Ok(())
    }

    /// Send a native error as the error reply to `call`, mapped through
    /// the error-name registry.
    pub async fn send_exception(&self, call: &Message, error: &Error) -> Result<(), Error> {
        let bus = error.to_bus_error();
        self.send_error(call, bus.name(), bus.message()).await
    }

    /// Ping a peer over the Peer interface.
    pub async fn ping(&self, destination: Option<&str>) -> Result<(), Error> {
        self.method_call::<()>(
            destination,
            ObjectPath::root(),
            tramline_wire::PEER_INTERFACE,
            "Ping",
            Vec::new(),
        )
        .await
    }

    /// The send path: serial assignment, outgoing filters, reply
    /// registration and the transport write, all under the send mutex.
    async fn send_internal(
        &self,
        mut msg: Message,
        want_reply: bool,
    ) -> Result<(Serial, Option<PendingReply>), Error> {
        let rs = self.inner.cell.running()?;
        let mut writer = rs.writer.lock().await;
        // The crash routine may have won the mutex while we waited.
        if let Some(err) = self.inner.cell.crash_error() {
            return Err(err);
        }

        let serial = writer.serial.peek();
        msg.serial = serial;

        let mut msg = {
            let mut filters = lock(&rs.outgoing_filters);
            match apply_chain(&mut filters, msg) {
                ChainOutcome::Pass(m) => m,
                ChainOutcome::Dropped => return Err(Error::FilterDropped),
                ChainOutcome::Aborted(err) => {
                    tracing::warn!(error = %err, "outgoing filter failed");
                    return Err(Error::FilterDropped);
                }
            }
        };
        // Filters may rewrite anything but the serial.
        msg.serial = serial;

        let pending = if want_reply {
            let (tx, rx) = oneshot::channel();
            lock(&rs.reply_waiters).insert(serial, tx);
            Some(PendingReply { rx })
        } else {
            None
        };

        match writer.tx.send(&msg).await {
            Ok(()) => {
                writer.serial.advance();
                tracing::trace!(serial, r#type = %msg.message_type, "message sent");
                Ok((serial, pending))
            }
            Err(TransportFault::Data(text)) => {
                // Encode failure: nothing hit the wire, the connection
                // stays up, the serial is not consumed, and the reply slot
                // the peer could never answer is dropped.
                if pending.is_some() {
                    lock(&rs.reply_waiters).remove(&serial);
                }
                Err(Error::Data(text))
            }
            Err(fault) => {
                // The stream may be partially written; nothing after this
                // point can be trusted.
                let err = transport::fatal_error(fault);
                drop(writer);
                Err(self.inner.set_crash(err).await)
            }
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Append a filter to the incoming chain.
    pub fn add_incoming_filter(&self, filter: Filter) -> Result<FilterGuard, Error> {
        self.add_filter(ChainKind::Incoming, filter)
    }

    /// Append a filter to the outgoing chain.
    pub fn add_outgoing_filter(&self, filter: Filter) -> Result<FilterGuard, Error> {
        self.add_filter(ChainKind::Outgoing, filter)
    }

    fn add_filter(&self, chain: ChainKind, filter: Filter) -> Result<FilterGuard, Error> {
        let rs = self.inner.cell.running()?;
        let id = rs.next_id();
        let list = match chain {
            ChainKind::Incoming => &rs.incoming_filters,
            ChainKind::Outgoing => &rs.outgoing_filters,
        };
        lock(list).push(FilterEntry { id, filter });
        Ok(FilterGuard {
            state: Arc::downgrade(&rs),
            chain,
            id,
            active: true,
        })
    }

    /// Subscribe to signals matching `filter`.
    ///
    /// Matching signals arrive on the stream in transport-arrival order,
    /// at most once each. Bus-side subscription (`AddMatch`) is the caller's
    /// business.
    pub fn add_signal_receiver(
        &self,
        filter: SignalFilter,
    ) -> Result<(SignalStream, ReceiverGuard), Error> {
        let rs = self.inner.cell.running()?;
        let id = rs.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&rs.signal_receivers).push(SignalRegistration {
            id,
            filter,
            sink: tx,
        });
        Ok((
            SignalStream { rx },
            ReceiverGuard {
                state: Arc::downgrade(&rs),
                id,
                active: true,
            },
        ))
    }

    /// Export `handler` at `path`, replacing any previous export there.
    pub fn export_object(
        &self,
        path: ObjectPath,
        handler: Arc<dyn ObjectHandler>,
    ) -> Result<ObjectGuard, Error> {
        let rs = self.inner.cell.running()?;
        let id = rs.next_id();
        lock(&rs.objects).insert(path.clone(), ObjectEntry { id, handler });
        Ok(ObjectGuard {
            state: Arc::downgrade(&rs),
            path,
            id,
            active: true,
        })
    }

    /// Remove the export at `path`, if any.
    pub fn unexport(&self, path: &ObjectPath) -> Result<bool, Error> {
        let rs = self.inner.cell.running()?;
        let removed = lock(&rs.objects).remove(path).is_some();
        Ok(removed)
    }

    /// The owner-tracking cell for `name`, created on first use.
    ///
    /// The cell is updated by the NameOwnerChanged bookkeeping; the
    /// resolver layer completes its initialisation with the
    /// `GetNameOwner` result.
    pub fn register_resolver(&self, name: &str) -> Result<Arc<NameCell>, Error> {
        let rs = self.inner.cell.running()?;
        let mut resolvers = lock(&rs.resolvers);
        Ok(resolvers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(NameCell::new(name.to_string())))
            .clone())
    }

    /// Drop the owner-tracking cell for `name`.
    pub fn remove_resolver(&self, name: &str) -> Result<bool, Error> {
        let rs = self.inner.cell.running()?;
        let removed = lock(&rs.resolvers).remove(name).is_some();
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) fn has_reply_waiter(&self, serial: Serial) -> bool {
        self.inner
            .cell
            .running()
            .map(|rs| lock(&rs.reply_waiters).contains_key(&serial))
            .unwrap_or(false)
    }
}

fn discard_transport(transport: Transport) {
    tokio::spawn(async move {
        let mut transport = transport;
        transport.tx.shutdown().await;
    });
}
