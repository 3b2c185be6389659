//! Connection registry: the reconciler's view of the world.
//!
//! Three maps keyed by machine identity, owned by exactly one reconciler
//! (single writer). After every pass `statuses` tracks `machines` exactly
//! and `connections` is a subset of `machines`; mid-pass the maps may
//! transiently disagree.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::inventory::MachineRecord;
use crate::status::LifecycleStatus;

/// Host-side handle for a registered connection. Disposal must be
/// idempotent; the registry calls it exactly once on removal.
pub trait Disposable: Send {
    fn dispose(&mut self);
}

#[derive(Default)]
struct Inner {
    machines: BTreeMap<String, MachineRecord>,
    statuses: BTreeMap<String, LifecycleStatus>,
    connections: BTreeMap<String, Box<dyn Disposable>>,
}

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, identity: &str) -> Option<LifecycleStatus> {
        self.inner.lock().unwrap().statuses.get(identity).copied()
    }

    pub fn record_of(&self, identity: &str) -> Option<MachineRecord> {
        self.inner.lock().unwrap().machines.get(identity).cloned()
    }

    /// Replace (not merge) the record and status for an identity.
    pub fn commit(&self, record: MachineRecord, status: LifecycleStatus) {
        let mut inner = self.inner.lock().unwrap();
        inner.statuses.insert(record.identity.clone(), status);
        inner.machines.insert(record.identity.clone(), record);
    }

    /// Overwrite the status of an already-tracked identity.
    pub fn set_status(&self, identity: &str, status: LifecycleStatus) {
        self.inner
            .lock()
            .unwrap()
            .statuses
            .insert(identity.to_string(), status);
    }

    pub fn has_connection(&self, identity: &str) -> bool {
        self.inner.lock().unwrap().connections.contains_key(identity)
    }

    pub fn insert_connection(&self, identity: &str, handle: Box<dyn Disposable>) {
        self.inner
            .lock()
            .unwrap()
            .connections
            .insert(identity.to_string(), handle);
    }

    /// Identities currently tracked by the status map.
    pub fn tracked_identities(&self) -> Vec<String> {
        self.inner.lock().unwrap().statuses.keys().cloned().collect()
    }

    /// Dispose the connection (if any) and drop the identity from all
    /// three maps. Safe to call for an unknown identity.
    pub fn remove(&self, identity: &str) {
        let connection = {
            let mut inner = self.inner.lock().unwrap();
            inner.machines.remove(identity);
            inner.statuses.remove(identity);
            inner.connections.remove(identity)
        };
        // Dispose outside the lock; host teardown may take a while.
        if let Some(mut handle) = connection {
            handle.dispose();
        }
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.machines.is_empty() && inner.statuses.is_empty() && inner.connections.is_empty()
    }

    /// Post-pass invariants: `statuses.keys() == machines.keys()` and
    /// `connections.keys() ⊆ machines.keys()`.
    pub fn invariants_hold(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        let machine_keys: Vec<&String> = inner.machines.keys().collect();
        let status_keys: Vec<&String> = inner.statuses.keys().collect();
        machine_keys == status_keys
            && inner
                .connections
                .keys()
                .all(|k| inner.machines.contains_key(k))
    }

    /// Cheap cloneable read view for connection descriptors.
    pub fn view(&self) -> StatusView {
        StatusView {
            inner: self.inner.clone(),
        }
    }
}

/// Read-only window onto the status map.
#[derive(Clone)]
pub struct StatusView {
    inner: Arc<Mutex<Inner>>,
}

impl StatusView {
    pub fn status_of(&self, identity: &str) -> LifecycleStatus {
        self.inner
            .lock()
            .unwrap()
            .statuses
            .get(identity)
            .copied()
            .unwrap_or(LifecycleStatus::Unknown)
    }
}
