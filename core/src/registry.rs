// Callback registries, one per event category
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

use crate::event::{AgentEvent, ManagerEvent, ServiceEvent, TechnologyEvent};

/// Shared callback handle. Keep a clone to unsubscribe by identity.
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscriber<E> {
    id: SubscriptionId,
    callback: Callback<E>,
}

impl<E> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

/// Ordered list of callbacks for one event type.
///
/// The same callback may be registered more than once and is then invoked
/// once per registration. Dispatch works on a snapshot taken under the
/// lock, so callbacks may subscribe or unsubscribe while running.
pub struct CallbackRegistry<E> {
    subscribers: Mutex<Vec<Subscriber<E>>>,
    next_id: AtomicU64,
}

impl<E> CallbackRegistry<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Appends `callback`.
    pub fn subscribe(&self, callback: Callback<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.push(Subscriber { id, callback });
        debug!(target: "connman::registry", id = id.0, total = subs.len(), "callback added");
        id
    }

    /// Removes the first registration of `callback` (pointer identity).
    /// Returns `false` if it was never registered.
    pub fn unsubscribe(&self, callback: &Callback<E>) -> bool {
        let target = Arc::as_ptr(callback) as *const ();
        self.remove_first(|s| Arc::as_ptr(&s.callback) as *const () == target)
    }

    pub fn unsubscribe_id(&self, id: SubscriptionId) -> bool {
        self.remove_first(|s| s.id == id)
    }

    /// Invokes every callback with `event`, in registration order. Returns
    /// the number of callbacks run.
    pub fn dispatch(&self, event: &E) -> usize {
        let snapshot: Vec<Subscriber<E>> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for sub in &snapshot {
            (sub.callback)(event);
        }
        trace!(target: "connman::registry", delivered = snapshot.len(), "event dispatched");
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_first(&self, matches: impl Fn(&Subscriber<E>) -> bool) -> bool {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        match subs.iter().position(|s| matches(s)) {
            Some(pos) => {
                subs.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl<E> Default for CallbackRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// The four registries the event loop dispatches into.
#[derive(Default)]
pub struct Subscribers {
    pub manager: CallbackRegistry<ManagerEvent>,
    pub technology: CallbackRegistry<TechnologyEvent>,
    pub service: CallbackRegistry<ServiceEvent>,
    pub agent: CallbackRegistry<AgentEvent>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Callback<u32>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let cb: Callback<u32> = Arc::new(move |_: &u32| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        (hits, cb)
    }

    #[test]
    fn duplicate_registrations_fire_twice() {
        let registry = CallbackRegistry::<u32>::new();
        let (hits, cb) = counter();
        registry.subscribe(Arc::clone(&cb));
        registry.subscribe(Arc::clone(&cb));

        assert_eq!(registry.dispatch(&1), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // removes one registration only
        assert!(registry.unsubscribe(&cb));
        registry.dispatch(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let registry = CallbackRegistry::<u32>::new();
        let (_, registered) = counter();
        let (_, stranger) = counter();
        registry.subscribe(registered);
        assert!(!registry.unsubscribe(&stranger));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn dispatch_preserves_order() {
        let registry = CallbackRegistry::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            registry.subscribe(Arc::new(move |v: &u32| {
                seen.lock().unwrap().push(format!("{}{}", tag, v));
            }));
        }
        registry.dispatch(&9);
        assert_eq!(*seen.lock().unwrap(), vec!["a9", "b9", "c9"]);
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let registry = Arc::new(CallbackRegistry::<u32>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let id_slot = Arc::new(Mutex::new(None));

        let r = Arc::clone(&registry);
        let h = Arc::clone(&hits);
        let slot = Arc::clone(&id_slot);
        let id = registry.subscribe(Arc::new(move |_: &u32| {
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *slot.lock().unwrap() {
                r.unsubscribe_id(id);
            }
        }));
        *id_slot.lock().unwrap() = Some(id);

        registry.dispatch(&1);
        registry.dispatch(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn empty_registry_dispatches_nothing() {
        let registry = CallbackRegistry::<u32>::default();
        assert_eq!(registry.dispatch(&0), 0);
    }
}
