//! Live instances keyed by id, with admission bounded by the emulator limit.
//!
//! A launch holds a slot from the moment it is admitted until its instance has been killed, so
//! instances that are still booting count toward the limit and the registry can never hold more
//! entries than there are slots. Draining closes the registry: later admissions fail and a
//! launch that finishes afterwards gets its instance handed back for teardown.

use std::{collections::HashMap, fmt, sync::Arc};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::instance::EmulatorInstance;

/// Capacity reserved for one instance; dropping it frees the slot.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

struct Entry {
    instance: Arc<EmulatorInstance>,
    slot: Slot,
}

/// An instance removed from the registry, still holding its slot until the caller is done with
/// teardown.
pub struct Evicted {
    pub instance: Arc<EmulatorInstance>,
    pub slot: Slot,
}

impl fmt::Debug for Evicted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evicted")
            .field("instance", &self.instance.id())
            .finish_non_exhaustive()
    }
}

pub struct Registry {
    limit: usize,
    slots: Arc<Semaphore>,
    entries: Mutex<Entries>,
}

#[derive(Default)]
struct Entries {
    live: HashMap<Uuid, Entry>,
    closed: bool,
}

impl Registry {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            slots: Arc::new(Semaphore::new(limit)),
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Reserves capacity for a new instance, or `None` when the limit is reached.
    pub fn try_admit(&self) -> Option<Slot> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot { _permit: permit })
    }

    /// Registers a launched instance. Fails with the instance itself once the registry has been
    /// drained.
    pub async fn insert(&self, instance: Arc<EmulatorInstance>, slot: Slot) -> Result<(), Evicted> {
        let mut entries = self.entries.lock().await;
        if entries.closed {
            return Err(Evicted { instance, slot });
        }
        entries.live.insert(instance.id(), Entry { instance, slot });
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<EmulatorInstance>> {
        self.entries
            .lock()
            .await
            .live
            .get(id)
            .map(|entry| Arc::clone(&entry.instance))
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Evicted> {
        self.entries.lock().await.live.remove(id).map(Entry::evict)
    }

    /// Removes every instance matching `predicate`.
    pub async fn remove_where(
        &self,
        mut predicate: impl FnMut(&EmulatorInstance) -> bool,
    ) -> Vec<Evicted> {
        let mut entries = self.entries.lock().await;
        let ids: Vec<Uuid> = entries
            .live
            .iter()
            .filter(|(_, entry)| predicate(entry.instance.as_ref()))
            .map(|(id, _)| *id)
            .collect();
        ids.iter()
            .filter_map(|id| entries.live.remove(id))
            .map(Entry::evict)
            .collect()
    }

    /// Removes every instance and closes the registry to new ones.
    pub async fn drain(&self) -> Vec<Evicted> {
        self.slots.close();
        let mut entries = self.entries.lock().await;
        entries.closed = true;
        entries.live.drain().map(|(_, entry)| entry.evict()).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Slots held by registered instances plus launches still in flight.
    pub fn slots_in_use(&self) -> usize {
        self.limit.saturating_sub(self.slots.available_permits())
    }
}

impl Entry {
    fn evict(self) -> Evicted {
        Evicted {
            instance: self.instance,
            slot: self.slot,
        }
    }
}
