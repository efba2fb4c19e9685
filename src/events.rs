//! Typed publish/subscribe bus.
//!
//! Every emitter defines a closed event enum implementing [`BusEvent`];
//! handlers subscribe to one event kind. Dispatch runs over a snapshot of the
//! handler list, so handlers may subscribe or unsubscribe while being called,
//! and a panicking handler is logged without affecting its siblings.

use std::any::Any;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::warn;

/// An event carried by an [`EventBus`].
pub trait BusEvent: Send + Sync + 'static {
    /// Discriminant used to route events to subscribers.
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;
type SubscriberHook<E> = Arc<dyn Fn(&EventBus<E>, <E as BusEvent>::Kind) + Send + Sync>;

struct Entry<E: BusEvent> {
    id: u64,
    kind: E::Kind,
    once: bool,
    handler: Handler<E>,
}

struct Inner<E: BusEvent> {
    next_id: u64,
    entries: Vec<Entry<E>>,
    hook: Option<SubscriberHook<E>>,
    deferred: Vec<E::Kind>,
}

/// Clonable handle to a shared set of subscriptions.
pub struct EventBus<E: BusEvent> {
    inner: Arc<Mutex<Inner<E>>>,
}

impl<E: BusEvent> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.lock().entries.len())
            .finish()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                entries: Vec::new(),
                hook: None,
                deferred: Vec::new(),
            })),
        }
    }

    /// Register a hook invoked when an event kind gains its first subscriber.
    ///
    /// The hook never runs inside `on`/`once`; it is queued and executed by
    /// [`EventBus::run_deferred`].
    pub fn with_subscriber_hook(
        self,
        hook: impl Fn(&EventBus<E>, E::Kind) + Send + Sync + 'static,
    ) -> Self {
        self.lock().hook = Some(Arc::new(hook));
        self
    }

    pub fn on(&self, kind: E::Kind, handler: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        self.subscribe(kind, false, Arc::new(handler))
    }

    /// Subscribe for a single dispatch; the handler is removed before it runs.
    pub fn once(
        &self,
        kind: E::Kind,
        handler: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(kind, true, Arc::new(handler))
    }

    pub fn subscriber_count(&self, kind: E::Kind) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    /// Call every handler subscribed to the event's kind.
    pub fn dispatch(&self, event: &E) {
        let kind = event.kind();
        let handlers: Vec<Handler<E>> = {
            let mut inner = self.lock();
            let handlers = inner
                .entries
                .iter()
                .filter(|entry| entry.kind == kind)
                .map(|entry| Arc::clone(&entry.handler))
                .collect();
            inner.entries.retain(|entry| !(entry.once && entry.kind == kind));
            handlers
        };
        for handler in handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                warn!(?kind, "Event handler failed: {}", panic_message(payload.as_ref()));
            }
        }
    }

    /// Run queued first-subscriber hooks.
    pub fn run_deferred(&self) {
        let (hook, kinds) = {
            let mut inner = self.lock();
            if inner.deferred.is_empty() {
                return;
            }
            (inner.hook.clone(), std::mem::take(&mut inner.deferred))
        };
        let Some(hook) = hook else {
            return;
        };
        for kind in kinds {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(self, kind))) {
                warn!(?kind, "Subscriber hook failed: {}", panic_message(payload.as_ref()));
            }
        }
    }

    fn subscribe(&self, kind: E::Kind, once: bool, handler: Handler<E>) -> Subscription {
        let mut inner = self.lock();
        let first = !inner.entries.iter().any(|entry| entry.kind == kind);
        if first && inner.hook.is_some() && !inner.deferred.contains(&kind) {
            inner.deferred.push(kind);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push(Entry {
            id,
            kind,
            once,
            handler,
        });
        drop(inner);
        let weak: Weak<Mutex<Inner<E>>> = Arc::downgrade(&self.inner);
        let bus: Weak<dyn Detach> = weak;
        Subscription { id, bus }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<E: BusEvent> Detach for Mutex<Inner<E>> {
    fn detach(&self, id: u64) {
        let mut inner = self.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.entries.retain(|entry| entry.id != id);
    }
}

/// Handle returned by [`EventBus::on`] and [`EventBus::once`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    bus: Weak<dyn Detach>,
}

impl Subscription {
    /// Remove the handler. Repeated calls are no-ops.
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.detach(self.id);
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
