//! Process-wide sharing of connections by server GUID.
//!
//! One physical connection per server identity: constructors consult this
//! map before opening anything, and the crash routine removes its entry as
//! the first teardown step, so a crashed connection is never handed out
//! again.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::state::Inner;
use crate::transport::Guid;
use crate::types::lock;
use crate::Connection;

static SHARED: OnceLock<Mutex<HashMap<Guid, Connection>>> = OnceLock::new();

fn shared() -> &'static Mutex<HashMap<Guid, Connection>> {
    SHARED.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The registered connection for `guid`, if any.
pub(crate) fn lookup(guid: &Guid) -> Option<Connection> {
    lock(shared()).get(guid).cloned()
}

/// Register `conn` under `guid` unless another connection won the race;
/// returns the connection that ended up registered.
pub(crate) fn register(guid: &Guid, conn: Connection) -> Connection {
    let mut map = lock(shared());
    match map.get(guid) {
        Some(existing) => existing.clone(),
        None => {
            map.insert(guid.clone(), conn.clone());
            conn
        }
    }
}

/// Drop the entry for `guid` if it still points at `inner`. Called by the
/// crash routine; a replacement registered in the meantime stays.
pub(crate) fn remove_if(guid: &Guid, inner: &Inner) {
    let mut map = lock(shared());
    if let Some(existing) = map.get(guid) {
        if existing.is_inner(inner) {
            map.remove(guid);
        }
    }
}
