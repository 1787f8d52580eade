use std::{
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::warn;

use crate::{Envelope, Error, Message, Result, error::panic_message};

type HandlerFn = dyn Fn(&Envelope) -> Result + Send + Sync;

/// A callback invoked for every envelope of the event type it is registered
/// under.
///
/// Handlers are cheap to clone; clones share identity, which is what makes
/// registration idempotent and lets [`off`](crate::Broker::off) remove exactly
/// the handler it is given. A handler reports failure by returning an error
/// (or panicking); either way the failure is logged and contained, and the
/// remaining handlers still run.
#[derive(Clone)]
pub struct Handler(Arc<HandlerFn>);

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Envelope) -> Result + Send + Sync + 'static,
    {
        Handler(Arc::new(f))
    }

    /// A handler receiving the decoded payload of message type `M`.
    ///
    /// A payload that doesn't decode counts as a handler failure.
    pub fn typed<M, F>(f: F) -> Self
    where
        M: Message,
        F: Fn(M, &Envelope) -> Result + Send + Sync + 'static,
    {
        Handler::new(move |envelope| f(envelope.decode::<M>()?, envelope))
    }

    /// Whether both handles refer to the same handler.
    pub fn same(&self, other: &Handler) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Run the handler, converting a panic into [`Error::HandlerFailure`].
    pub(crate) fn call(&self, envelope: &Envelope) -> Result {
        catch_unwind(AssertUnwindSafe(|| (self.0)(envelope)))
            .unwrap_or_else(|panic| Err(Error::HandlerFailure(panic_message(panic))))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({:#x})", self.key())
    }
}

/// Handlers in registration order.
///
/// Removal empties the handler's slot and is compacted away once empty slots
/// outnumber live handlers, keeping removal O(1) amortized.
#[derive(Default)]
struct HandlerSet {
    slots: Vec<Option<Handler>>,
    index: HashMap<usize, usize>,
}

impl HandlerSet {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn insert(&mut self, handler: Handler) -> bool {
        let key = handler.key();
        if self.index.contains_key(&key) {
            return false;
        }
        self.index.insert(key, self.slots.len());
        self.slots.push(Some(handler));
        true
    }

    fn remove(&mut self, handler: &Handler) -> bool {
        let Some(slot) = self.index.remove(&handler.key()) else {
            return false;
        };
        self.slots[slot] = None;
        if self.slots.len() > 2 * self.index.len() {
            self.compact();
        }
        true
    }

    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        for (slot, handler) in self.slots.iter().flatten().enumerate() {
            self.index.insert(handler.key(), slot);
        }
    }

    fn handlers(&self) -> Vec<Handler> {
        self.slots.iter().flatten().cloned().collect()
    }
}

/// Mapping from event type to the handlers registered for it.
///
/// Registration is idempotent: adding a handler that is already present
/// keeps its original position. Handlers are returned in registration order.
#[derive(Default)]
pub struct TopicRegistry {
    topics: HashMap<String, HandlerSet>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handler` under `event_type`. Returns `false` if it was already
    /// registered there.
    pub fn insert(&mut self, event_type: &str, handler: Handler) -> bool {
        self.topics
            .entry(event_type.to_owned())
            .or_default()
            .insert(handler)
    }

    /// Remove exactly `handler` from `event_type`. Returns `false` if it
    /// wasn't registered.
    pub fn remove(&mut self, event_type: &str, handler: &Handler) -> bool {
        let Some(set) = self.topics.get_mut(event_type) else {
            return false;
        };
        if !set.remove(handler) {
            return false;
        }
        if set.len() == 0 {
            self.topics.remove(event_type);
        }
        true
    }

    /// Remove all handlers of `event_type`, returning how many there were.
    pub fn clear(&mut self, event_type: &str) -> usize {
        self.topics
            .remove(event_type)
            .map_or(0, |set| set.len())
    }

    pub fn clear_all(&mut self) {
        self.topics.clear();
    }

    /// Snapshot of the handlers for `event_type`, in registration order.
    pub fn handlers(&self, event_type: &str) -> Vec<Handler> {
        self.topics
            .get(event_type)
            .map(HandlerSet::handlers)
            .unwrap_or_default()
    }

    pub fn len(&self, event_type: &str) -> usize {
        self.topics.get(event_type).map_or(0, |set| set.len())
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }
}

/// Handle returned by `on`/`once`; [`unsubscribe`](Subscription::unsubscribe)
/// removes the handler it registered.
///
/// Dropping a subscription does not unsubscribe.
pub struct Subscription {
    registry: Weak<Mutex<TopicRegistry>>,
    event_type: Arc<str>,
    handler: Handler,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the handler. Idempotent: only the first call has an effect.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.event_type, &self.handler);
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The registered handler (for `once`, the self-removing wrapper).
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("handler", &self.handler)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Shared handler table with the `on`/`once`/`off`/dispatch contract used by
/// both the broker and clients.
///
/// The lock is only held while the table is read or modified, never while a
/// handler runs, so handlers may subscribe, unsubscribe and emit freely.
#[derive(Clone, Default)]
pub(crate) struct Topics(Arc<Mutex<TopicRegistry>>);

impl Topics {
    pub fn on(&self, event_type: &str, handler: Handler) -> Subscription {
        self.0.lock().insert(event_type, handler.clone());
        Subscription {
            registry: Arc::downgrade(&self.0),
            event_type: Arc::from(event_type),
            handler,
            active: AtomicBool::new(true),
        }
    }

    /// Register a handler that removes itself before its first run.
    ///
    /// An event already in flight may still reach the wrapper after removal;
    /// the `fired` flag makes sure `handler` runs at most once regardless.
    pub fn once(&self, event_type: &str, handler: Handler) -> Subscription {
        let registry = Arc::downgrade(&self.0);
        let topic: Arc<str> = Arc::from(event_type);
        let this: Arc<OnceLock<Weak<HandlerFn>>> = Arc::new(OnceLock::new());
        let fired = AtomicBool::new(false);

        let wrapper = Handler::new({
            let this = this.clone();
            let topic = topic.clone();
            move |envelope| {
                if fired.swap(true, Ordering::AcqRel) {
                    return Ok(());
                }
                let me = this.get().and_then(|weak| weak.upgrade()).map(Handler);
                if let (Some(registry), Some(me)) = (registry.upgrade(), me) {
                    registry.lock().remove(&topic, &me);
                }
                handler.call(envelope)
            }
        });
        let _ = this.set(Arc::downgrade(&wrapper.0));

        self.on(&topic, wrapper)
    }

    /// Remove exactly `handler`, or every handler of `event_type` if `None`.
    pub fn off(&self, event_type: &str, handler: Option<&Handler>) {
        let mut registry = self.0.lock();
        match handler {
            Some(handler) => {
                registry.remove(event_type, handler);
            }
            None => {
                registry.clear(event_type);
            }
        }
    }

    /// Invoke every handler registered for the envelope's type, in
    /// registration order, isolating failures. Returns the number of handlers
    /// invoked.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let handlers = self.0.lock().handlers(&envelope.event_type);
        for handler in &handlers {
            if let Err(e) = handler.call(envelope) {
                warn!(
                    id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "handler failed"
                );
            }
        }
        handlers.len()
    }

    pub fn len(&self, event_type: &str) -> usize {
        self.0.lock().len(event_type)
    }

    pub fn clear_all(&self) {
        self.0.lock().clear_all();
    }
}
