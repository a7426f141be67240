use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use tracing::warn;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Handle returned by every `watch`/`subscribe` call.
///
/// Dropping it releases the listener. Once release has returned, no new
/// invocation of the callback starts. Use [`Subscription::detach`] to keep a
/// listener for as long as its source lives.
#[must_use = "dropping a Subscription immediately unsubscribes it"]
pub struct Subscription {
    id: SubscriptionId,
    release: Option<Release>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    pub fn detach(mut self) -> SubscriptionId {
        self.release = None;
        self.id
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.release.is_some())
            .finish()
    }
}

/// Recovers the guard of a poisoned mutex; listener panics must not wedge the
/// component that owns the state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Slot<T> {
    id: SubscriptionId,
    active: AtomicBool,
    callback: Callback<T>,
}

type Slots<T> = Mutex<Vec<Arc<Slot<T>>>>;

/// Ordered set of callbacks sharing one event type. Clones share the set.
pub(crate) struct ListenerSet<T> {
    slots: Arc<Slots<T>>,
}

impl<T> Clone for ListenerSet<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: 'static> ListenerSet<T> {
    pub(crate) fn insert(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.insert_detached(callback);
        let slots: Weak<Slots<T>> = Arc::downgrade(&self.slots);
        Subscription::new(id, move || {
            if let Some(slots) = slots.upgrade() {
                remove_slot(&slots, id);
            }
        })
    }

    /// Registers a listener that is released only through [`ListenerSet::remove`].
    pub(crate) fn insert_detached(
        &self,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId::next();
        lock(&self.slots).push(Arc::new(Slot {
            id,
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        }));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        remove_slot(&self.slots, id)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Invokes every listener in registration order. The slot list is copied
    /// first so callbacks may subscribe or unsubscribe re-entrantly. A
    /// panicking listener is logged and skipped; the others still run.
    pub(crate) fn emit(&self, event: &T) {
        let slots = lock(&self.slots).clone();
        for slot in slots {
            if !slot.active.load(Ordering::SeqCst) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| (slot.callback)(event))).is_err() {
                warn!(subscription = %slot.id, "listener panicked; event skipped for it");
            }
        }
    }
}

fn remove_slot<T>(slots: &Slots<T>, id: SubscriptionId) -> bool {
    let mut slots = lock(slots);
    let Some(index) = slots.iter().position(|slot| slot.id == id) else {
        return false;
    };
    let slot = slots.remove(index);
    slot.active.store(false, Ordering::SeqCst);
    true
}
