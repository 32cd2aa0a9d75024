//! Cancellable per-key timers
//!
//! Each key owns at most one pending callback. Scheduling always cancels the
//! previous callback for the key before arming the new one, so the most recent
//! schedule wins.
//!
//! A firing timer releases its own slot before running its callback, so the
//! callback may call [`TimerSlots::cancel`] for its key without aborting itself.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

struct Slot {
    id: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

/// Map of key -> pending timer
pub struct TimerSlots<K> {
    name: &'static str,
    slots: DashMap<K, Slot>,
    next_id: AtomicU64,
}

impl<K> TimerSlots<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
{
    /// Create an empty timer map; `name` only appears in logs
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `task` at `deadline`, replacing any timer already pending for `key`
    pub fn schedule<F, Fut>(self: &Arc<Self>, key: K, deadline: Instant, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slots = Arc::clone(self);
        let fired_key = key.clone();

        // The entry guard is held while spawning, so a timer that fires
        // immediately cannot release its slot before it is inserted.
        match self.slots.entry(key) {
            Entry::Occupied(mut occupied) => {
                occupied.get().handle.abort();
                let handle = tokio::spawn(async move {
                    sleep_until(deadline).await;
                    slots.release(&fired_key, id);
                    task().await;
                });
                occupied.insert(Slot {
                    id,
                    deadline,
                    handle,
                });
            }
            Entry::Vacant(vacant) => {
                let handle = tokio::spawn(async move {
                    sleep_until(deadline).await;
                    slots.release(&fired_key, id);
                    task().await;
                });
                vacant.insert(Slot {
                    id,
                    deadline,
                    handle,
                });
            }
        }

        debug!(timer = self.name, id, "Timer scheduled");
    }

    /// Cancel the pending timer for `key`; returns whether one was pending
    pub fn cancel(&self, key: &K) -> bool {
        match self.slots.remove(key) {
            Some((_, slot)) => {
                slot.handle.abort();
                debug!(timer = self.name, id = slot.id, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Deadline of the pending timer for `key`
    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.slots.get(key).map(|slot| slot.deadline)
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn release(&self, key: &K, id: u64) {
        self.slots.remove_if(key, |_, slot| slot.id == id);
    }
}
