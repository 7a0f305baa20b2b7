//! The packed connection state cell and the crash machinery.
//!
//! All public operations enter through [`StateCell::running`]: they either
//! get the live [`RunningState`] or fail synchronously with the stored
//! crash error. The transition into `Crashed` happens exactly once, in
//! [`Inner::set_crash`], which is the single point of truth for failure:
//! it wakes the dispatcher, fails every reply waiter, notifies exported
//! objects, and shuts the transport down.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::{oneshot, watch};
use tramline_wire::{Message, ObjectPath, Serial};

use crate::names::NameCell;
use crate::registry;
use crate::transport::{Guid, TransportInfo, TransportTx};
use crate::types::{
    lock, ConnectionConfig, FilterEntry, ObjectEntry, SerialCounter, SignalRegistration,
};
use crate::Error;

/// The write half of the transport plus everything that must change
/// atomically with a write. Guarded by the send mutex.
pub(crate) struct SendHalf {
    pub(crate) tx: Box<dyn TransportTx>,
    pub(crate) serial: SerialCounter,
}

/// Everything a live connection owns.
pub(crate) struct RunningState {
    /// Server identity, when the transport carried one and the connection
    /// participates in sharing.
    pub(crate) guid: Option<Guid>,

    /// Descriptive transport metadata, kept for introspection; the owned
    /// halves live with the writer and the dispatcher.
    pub(crate) transport: TransportInfo,

    /// The send mutex. Held across serial assignment, outgoing filters,
    /// reply registration and the transport write, so serials hit the
    /// wire strictly increasing and a reply waiter is always installed
    /// before its request is observable by the peer.
    pub(crate) writer: tokio::sync::Mutex<SendHalf>,

    /// Unique bus name, `None` until the bus layer completes Hello.
    pub(crate) name: Mutex<Option<String>>,

    /// Well-known names currently owned; updated only by the
    /// NameAcquired/NameLost bookkeeping.
    pub(crate) acquired_names: Mutex<Vec<String>>,

    /// Outstanding request serial -> one-shot completion.
    pub(crate) reply_waiters: Mutex<HashMap<Serial, oneshot::Sender<Result<Message, Error>>>>,

    /// Ordered receiver list; the dispatcher snapshots matching sinks
    /// under the lock and delivers outside it.
    pub(crate) signal_receivers: Mutex<Vec<SignalRegistration>>,

    /// Exported object paths. Lookup is exact; virtual parents are
    /// synthesised at dispatch time, never stored.
    pub(crate) objects: Mutex<HashMap<ObjectPath, ObjectEntry>>,

    pub(crate) incoming_filters: Mutex<Vec<FilterEntry>>,
    pub(crate) outgoing_filters: Mutex<Vec<FilterEntry>>,

    /// Dispatch gate: while `false` the dispatcher parks before reading.
    pub(crate) up: watch::Sender<bool>,

    /// Fatal-error broadcast. Set exactly once, by `set_crash`; the
    /// dispatcher races its reads against it and `Connection::watch`
    /// subscribes to it.
    pub(crate) crash: watch::Sender<Option<Error>>,

    /// User-supplied fatal handler, invoked at most once after the
    /// dispatcher exits.
    pub(crate) on_disconnect: Mutex<Option<Box<dyn FnOnce(Error) + Send>>>,

    /// Unique names recently seen to have lost their owner.
    pub(crate) exited_peers: Mutex<LruCache<String, ()>>,

    /// Owner-tracking cells, keyed by the name they track.
    pub(crate) resolvers: Mutex<HashMap<String, Arc<NameCell>>>,

    /// Registration id source for filters, receivers and objects.
    pub(crate) next_id: AtomicU64,
}

impl RunningState {
    pub(crate) fn new(
        tx: Box<dyn TransportTx>,
        info: TransportInfo,
        guid: Option<Guid>,
        config: &ConnectionConfig,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(config.exited_peer_capacity).unwrap_or(NonZeroUsize::MIN);
        RunningState {
            guid,
            transport: info,
            writer: tokio::sync::Mutex::new(SendHalf {
                tx,
                serial: SerialCounter::new(),
            }),
            name: Mutex::new(None),
            acquired_names: Mutex::new(Vec::new()),
            reply_waiters: Mutex::new(HashMap::new()),
            signal_receivers: Mutex::new(Vec::new()),
            objects: Mutex::new(HashMap::new()),
            incoming_filters: Mutex::new(Vec::new()),
            outgoing_filters: Mutex::new(Vec::new()),
            up: watch::channel(true).0,
            crash: watch::channel(None).0,
            on_disconnect: Mutex::new(None),
            exited_peers: Mutex::new(LruCache::new(capacity)),
            resolvers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub(crate) enum State {
    Running(Arc<RunningState>),
    Crashed(Error),
}

/// Atomic holder of `Running | Crashed`.
pub(crate) struct StateCell {
    state: Mutex<State>,
}

impl StateCell {
    pub(crate) fn new(running: Arc<RunningState>) -> Self {
        StateCell {
            state: Mutex::new(State::Running(running)),
        }
    }

    /// The live state, or the stored crash error.
    pub(crate) fn running(&self) -> Result<Arc<RunningState>, Error> {
        match &*lock(&self.state) {
            State::Running(rs) => Ok(rs.clone()),
            State::Crashed(err) => Err(err.clone()),
        }
    }

    /// The stored crash error, if any.
    pub(crate) fn crash_error(&self) -> Option<Error> {
        match &*lock(&self.state) {
            State::Running(_) => None,
            State::Crashed(err) => Some(err.clone()),
        }
    }
}

/// The shared connection body: the cell, wrapped by every handle.
pub(crate) struct Inner {
    pub(crate) cell: StateCell,
}

impl Inner {
    /// Transition to `Crashed(err)` and tear everything down.
    ///
    /// Idempotent: the second and later calls return the already-stored
    /// error without side effects. Returns the error now stored in the
    /// cell, which every subsequent operation will fail with.
    pub(crate) async fn set_crash(&self, err: Error) -> Error {
        let rs = {
            let mut state = lock(&self.cell.state);
            match &*state {
                State::Crashed(stored) => return stored.clone(),
                State::Running(rs) => {
                    let rs = rs.clone();
                    *state = State::Crashed(err.clone());
                    rs
                }
            }
        };

        tracing::debug!(error = %err, "connection crashing");

        // Stop sharing this connection before anyone can look it up again.
        if let Some(guid) = &rs.guid {
            registry::remove_if(guid, self);
        }

        // Unblock the dispatcher, whether it is mid-read or parked on the
        // down gate; both race against this watch.
        let _ = rs.crash.send(Some(err.clone()));

        // Fail every outstanding reply.
        let waiters: Vec<_> = lock(&rs.reply_waiters).drain().collect();
        for (serial, tx) in waiters {
            tracing::trace!(serial, "failing reply waiter");
            let _ = tx.send(Err(err.clone()));
        }

        // Wake anyone still waiting for a name owner.
        let resolvers: Vec<_> = lock(&rs.resolvers).drain().map(|(_, cell)| cell).collect();
        for cell in resolvers {
            cell.abandon();
        }

        // Tell every exported object the connection is gone.
        let objects: Vec<_> = lock(&rs.objects).drain().collect();
        for (path, entry) in objects {
            if let Err(hook_err) = entry.handler.connection_closed(&err).await {
                tracing::warn!(path = %path, error = %hook_err, "connection-closed hook failed");
            }
        }

        // Shut the transport down. Only a clean close drains an
        // in-flight send by taking the send mutex first; any other cause
        // must not wait on it, since a sender stuck in a wedged write
        // never lets go of the lock.
        if matches!(err, Error::ConnectionClosed) {
            let mut writer = rs.writer.lock().await;
            writer.tx.shutdown().await;
        } else {
            match rs.writer.try_lock() {
                Ok(mut writer) => writer.tx.shutdown().await,
                Err(_) => {
                    // A sender holds the mutex; shut down once it frees up.
                    let rs = rs.clone();
                    tokio::spawn(async move {
                        let mut writer = rs.writer.lock().await;
                        writer.tx.shutdown().await;
                    });
                }
            }
        }

        err
    }
}
