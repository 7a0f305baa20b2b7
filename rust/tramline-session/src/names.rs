//! Owner-tracking cells for bus names.
//!
//! A [`NameCell`] holds the current unique-name owner of one bus name.
//! The resolver layer above the core creates a cell, issues `GetNameOwner`
//! and completes it with [`NameCell::initialize`]; the core's
//! NameOwnerChanged bookkeeping updates it through [`NameCell::set_owner`],
//! which pre-empts a still-outstanding initial reply.

use std::sync::Mutex;

use tokio::sync::watch;

use crate::types::lock;

/// Tracks which unique name currently owns one bus name.
pub struct NameCell {
    name: String,
    owner: Mutex<Option<String>>,
    init: watch::Sender<bool>,
}

impl NameCell {
    pub(crate) fn new(name: String) -> Self {
        NameCell {
            name,
            owner: Mutex::new(None),
            init: watch::channel(false).0,
        }
    }

    /// The name this cell tracks.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current owner, `None` while uninitialised or ownerless.
    pub fn owner(&self) -> Option<String> {
        lock(&self.owner).clone()
    }

    /// Whether the initial owner is known (from either the initial reply
    /// or an overtaking NameOwnerChanged).
    pub fn is_initialized(&self) -> bool {
        *self.init.borrow()
    }

    /// Resolves once the initial owner is known. Also resolves when the
    /// connection crashes, so nobody waits on a dead cell.
    pub async fn initialized(&self) {
        let mut rx = self.init.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Authoritative update from NameOwnerChanged. Marks the cell
    /// initialised; a later initial reply is then ignored.
    pub fn set_owner(&self, owner: Option<String>) {
        *lock(&self.owner) = owner;
        self.init.send_replace(true);
    }

    /// Complete initialisation with the `GetNameOwner` result. Returns
    /// false (and changes nothing) when a NameOwnerChanged already won.
    pub fn initialize(&self, owner: Option<String>) -> bool {
        let mut slot = lock(&self.owner);
        if *self.init.borrow() {
            return false;
        }
        *slot = owner;
        self.init.send_replace(true);
        true
    }

    /// Crash path: wake waiters without learning an owner.
    pub(crate) fn abandon(&self) {
        self.init.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_sets_owner_once() {
        let cell = NameCell::new(":1.42".into());
        assert!(!cell.is_initialized());
        assert!(cell.initialize(Some(":1.42".into())));
        assert!(cell.is_initialized());
        assert_eq!(cell.owner().as_deref(), Some(":1.42"));

        // A late second initialisation is ignored.
        assert!(!cell.initialize(Some(":9.9".into())));
        assert_eq!(cell.owner().as_deref(), Some(":1.42"));
    }

    #[tokio::test]
    async fn owner_change_preempts_initialization() {
        let cell = NameCell::new(":1.42".into());
        cell.set_owner(Some(":1.42".into()));
        assert!(cell.is_initialized());

        // The initial reply arrives late and loses.
        assert!(!cell.initialize(None));
        assert_eq!(cell.owner().as_deref(), Some(":1.42"));

        cell.initialized().await;
    }

    #[tokio::test]
    async fn initialized_wakes_on_set_owner() {
        use std::sync::Arc;

        let cell = Arc::new(NameCell::new("org.example.Foo".into()));
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.initialized().await })
        };
        tokio::task::yield_now().await;
        cell.set_owner(Some(":2.1".into()));
        waiter.await.unwrap();
    }
}
