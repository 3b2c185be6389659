//! Status-change fan-out.
//!
//! Delivery is synchronous and ordered (subscription order); the
//! reconciler's notify-before-commit sequencing depends on that. One
//! panicking handler is isolated so the rest still receive the change.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use crate::status::LifecycleStatus;

type Handler = Arc<dyn Fn(&str, LifecycleStatus) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ListenerSet {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    handlers: BTreeMap<u64, Handler>,
    next_id: u64,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Dropping the returned [`Subscription`] (or calling
    /// `unsubscribe`) removes it. Handlers may subscribe or unsubscribe
    /// reentrantly; a change made during a fan-out takes effect from the
    /// next notification.
    pub fn subscribe(
        &self,
        handler: impl Fn(&str, LifecycleStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.handlers.insert(id, Arc::new(handler));
        Subscription {
            id,
            inner: self.inner.clone(),
        }
    }

    /// Deliver a status change to every handler, in subscription order.
    pub fn notify(&self, identity: &str, status: LifecycleStatus) {
        // Snapshot the handler list so nothing is locked while handlers
        // run; a handler is free to touch the set itself.
        let handlers: Vec<(u64, Handler)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .handlers
                .iter()
                .map(|(id, handler)| (*id, handler.clone()))
                .collect()
        };
        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(identity, status))).is_err() {
                tracing::warn!(listener = id, identity, "status listener panicked");
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().handlers.len()
    }
}

/// Removes its handler from the set when dropped.
pub struct Subscription {
    id: u64,
    inner: Arc<Mutex<Inner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.lock().unwrap().handlers.remove(&self.id);
    }
}
