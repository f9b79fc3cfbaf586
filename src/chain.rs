//! Ordered callback chains with opaque subscriber ids.
//!
//! Every notification surface in the crate (decoded messages, pin state
//! changes, encoder rotation, string updates) is a `CallChain`. Dispatch
//! iterates over a snapshot taken outside the lock, so a handler may remove
//! itself or any other handler mid-dispatch without invalidating iteration.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque handle returned by [`CallChain::subscribe`].
///
/// Ids are allocated from one process-wide monotonic counter, so ids from
/// distinct chains never collide and id order equals insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

type Call<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// A chain of callbacks invoked in subscription order.
pub struct CallChain<A> {
    calls: Mutex<BTreeMap<CallId, Call<A>>>,
}

impl<A> Default for CallChain<A> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<A> CallChain<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback; returns an id usable with [`CallChain::unsubscribe`].
    pub fn subscribe(&self, call: impl Fn(&A) + Send + Sync + 'static) -> CallId {
        let id = CallId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        self.calls.lock().insert(id, Arc::new(call));
        id
    }

    /// Remove a callback. Returns false if the id is unknown to this chain.
    pub fn unsubscribe(&self, id: CallId) -> bool {
        self.calls.lock().remove(&id).is_some()
    }

    /// Remove all callbacks.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    /// Invoke every currently subscribed callback, in insertion order.
    pub fn emit(&self, arg: &A) {
        let snapshot: Vec<Call<A>> = self.calls.lock().values().cloned().collect();
        for call in snapshot {
            call(arg);
        }
    }
}

impl<A> std::fmt::Debug for CallChain<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallChain").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_dispatch_in_insertion_order() {
        let chain = CallChain::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            chain.subscribe(move |_: &()| seen.lock().push(tag));
        }

        chain.emit(&());
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unsubscribe() {
        let chain: CallChain<()> = CallChain::new();
        let id = chain.subscribe(|_| {});
        assert_eq!(chain.len(), 1);
        assert!(chain.unsubscribe(id));
        assert!(!chain.unsubscribe(id));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_ids_unique_across_chains() {
        let a: CallChain<()> = CallChain::new();
        let b: CallChain<()> = CallChain::new();
        let id_a = a.subscribe(|_| {});
        let id_b = b.subscribe(|_| {});
        assert_ne!(id_a, id_b);
        // removing through the wrong chain is a no-op
        assert!(!b.unsubscribe(id_a));
    }

    #[test]
    fn test_self_unsubscribe_during_dispatch() {
        let chain: Arc<CallChain<()>> = Arc::new(CallChain::new());
        let fired = Arc::new(Mutex::new(0usize));

        let slot: Arc<Mutex<Option<CallId>>> = Arc::new(Mutex::new(None));
        let id = {
            let chain = chain.clone();
            let slot = slot.clone();
            let fired = fired.clone();
            chain.clone().subscribe(move |_| {
                *fired.lock() += 1;
                if let Some(id) = slot.lock().take() {
                    chain.unsubscribe(id);
                }
            })
        };
        *slot.lock() = Some(id);

        chain.emit(&());
        chain.emit(&());
        assert_eq!(*fired.lock(), 1);
        assert!(chain.is_empty());
    }
}
