//! Explicit event subscription.
//!
//! Every collaborator in this crate (transport status, sync progress,
//! awareness updates) publishes through an [`EventEmitter`]. Registering a
//! handler returns a [`Subscription`]; dropping or unsubscribing it detaches
//! the handler.
//!
//! ## Dispatch contract
//!
//! ```text
//! emit(event)
//!   │  snapshot handler list (lock released)
//!   ▼
//! for each live handler, in registration order:
//!   handler(&event)          ← synchronous, same thread as emit()
//! ```
//!
//! - Handlers run synchronously, in registration order.
//! - A handler may subscribe or unsubscribe during dispatch.
//! - A handler detached during dispatch never runs afterwards, not even for
//!   the event currently being dispatched.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Slot<E> {
    id: u64,
    alive: Arc<AtomicBool>,
    handler: Handler<E>,
}

struct Registry<E> {
    next_id: u64,
    slots: Vec<Slot<E>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A synchronous, in-order event source.
pub struct EventEmitter<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }

    /// Register a handler. It stays attached until the returned
    /// [`Subscription`] is dropped or [`EventEmitter::clear`] is called.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.slots.push(Slot {
                id,
                alive: alive.clone(),
                handler: Arc::new(handler),
            });
            id
        };

        let registry: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            alive,
            detach: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    lock(&registry).slots.retain(|slot| slot.id != id);
                }
            })),
        }
    }

    /// Deliver `event` to every live handler. Returns how many ran.
    pub fn emit(&self, event: &E) -> usize {
        let handlers: Vec<(Arc<AtomicBool>, Handler<E>)> = lock(&self.registry)
            .slots
            .iter()
            .map(|slot| (slot.alive.clone(), slot.handler.clone()))
            .collect();

        let mut fired = 0;
        for (alive, handler) in handlers {
            if alive.load(Ordering::Acquire) {
                handler(event);
                fired += 1;
            }
        }
        fired
    }

    /// Detach every handler at once. Outstanding subscriptions become inert.
    pub fn clear(&self) {
        let mut registry = lock(&self.registry);
        for slot in registry.slots.drain(..) {
            slot.alive.store(false, Ordering::Release);
        }
    }

    /// Number of attached handlers.
    pub fn handler_count(&self) -> usize {
        lock(&self.registry).slots.len()
    }
}

impl<E: 'static> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("handlers", &lock(&self.registry).slots.len())
            .finish()
    }
}

/// Handle to a registered handler. Detaches on drop.
#[must_use = "dropping a Subscription detaches its handler immediately"]
pub struct Subscription {
    alive: Arc<AtomicBool>,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Detach the handler now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Whether the handler can still fire.
    pub fn is_active(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn release(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_handlers_in_order() {
        let emitter = EventEmitter::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = seen.clone();
        let _s1 = emitter.subscribe(move |v| a.lock().unwrap().push(("a", *v)));
        let b = seen.clone();
        let _s2 = emitter.subscribe(move |v| b.lock().unwrap().push(("b", *v)));

        assert_eq!(emitter.emit(&7), 2);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_drop_detaches() {
        let emitter = EventEmitter::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let sub = emitter.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(&());
        drop(sub);
        emitter.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.handler_count(), 0);
    }

    #[test]
    fn test_clear_makes_subscriptions_inert() {
        let emitter = EventEmitter::<()>::new();
        let sub = emitter.subscribe(|_| panic!("cleared handler fired"));
        emitter.clear();

        assert!(!sub.is_active());
        assert_eq!(emitter.emit(&()), 0);
        // Dropping after clear is harmless.
        sub.unsubscribe();
    }

    #[test]
    fn test_handler_detached_during_dispatch_does_not_fire() {
        let emitter = Arc::new(EventEmitter::<()>::new());
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = victim.clone();
        let _killer = emitter.subscribe(move |_| {
            slot.lock().unwrap().take();
        });
        let sub = emitter.subscribe(|_| panic!("detached handler fired"));
        *victim.lock().unwrap() = Some(sub);

        assert_eq!(emitter.emit(&()), 1);
    }

    #[test]
    fn test_subscribe_during_dispatch() {
        let emitter = Arc::new(EventEmitter::<()>::new());
        let late: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        let e = emitter.clone();
        let l = late.clone();
        let _s = emitter.subscribe(move |_| {
            l.lock().unwrap().push(e.subscribe(|_| {}));
        });

        // The handler added mid-dispatch only sees later events.
        assert_eq!(emitter.emit(&()), 1);
        assert_eq!(emitter.emit(&()), 2);
    }

    #[test]
    fn test_subscription_outlives_emitter() {
        let emitter = EventEmitter::<()>::new();
        let sub = emitter.subscribe(|_| {});
        drop(emitter);
        // No registry left to detach from.
        sub.unsubscribe();
    }
}
