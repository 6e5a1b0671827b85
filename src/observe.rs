//! Typed observer lists.
//!
//! Components emit enum-tagged events to registered observers,
//! synchronously on the event loop. Registration returns a guard that
//! detaches the observer when dropped, so an observer can never
//! outlive the state it captures.
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

type Slot<E> = (u64, Box<dyn FnMut(&E) + Send>);

struct Slots<E> {
    next: u64,
    slots: Vec<Slot<E>>,
    /// Ids removed while an emission had the slots taken out.
    dead: HashSet<u64>,
}

/// A list of observers for events of type `E`.
pub struct ObserverList<E> {
    inner: Arc<Mutex<Slots<E>>>,
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slots {
                next: 0,
                slots: Vec::new(),
                dead: HashSet::new(),
            })),
        }
    }
}

impl<E: 'static> ObserverList<E> {
    /// Returns an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer. Dropping the returned guard detaches it.
    pub fn subscribe(&self, observer: impl FnMut(&E) + Send + 'static) -> Subscription {
        let id = {
            let mut slots = self.inner.lock();
            let id = slots.next;
            slots.next += 1;
            slots.slots.push((id, Box::new(observer)));
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || detach(&weak, id))
    }

    /// Delivers `event` to every observer, in registration order.
    ///
    /// Observers may subscribe or detach during delivery; a detached
    /// observer receives no further events.
    pub fn emit(&self, event: &E) {
        let mut taken = std::mem::take(&mut self.inner.lock().slots);
        for (_, observer) in taken.iter_mut() {
            observer(event);
        }
        let mut slots = self.inner.lock();
        taken.retain(|(id, _)| !slots.dead.remove(id));
        taken.append(&mut slots.slots);
        slots.slots = taken;
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Returns whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn detach<E>(weak: &Weak<Mutex<Slots<E>>>, id: u64) {
    if let Some(inner) = weak.upgrade() {
        let mut slots = inner.lock();
        let before = slots.slots.len();
        slots.slots.retain(|(slot, _)| *slot != id);
        if slots.slots.len() == before {
            // The slot is out for an emission; mark it dead instead.
            slots.dead.insert(id);
        }
    }
}

/// Guard for a registered observer. Dropping it detaches the observer.
pub struct Subscription(Option<Box<dyn FnOnce() + Send>>);

impl Subscription {
    fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(detach)))
    }

    /// Keeps the observer attached for the emitter's lifetime.
    pub fn forever(mut self) {
        self.0 = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.0.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.0.is_some())
            .finish()
    }
}
