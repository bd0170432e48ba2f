//! Stream registry
//!
//! Maps active stream ids to their exchanges. Client stream ids are odd and
//! increase monotonically, so `((id - 1) >> 1) & (SLOTS - 1)` spreads live
//! streams across a fixed slot array without hashing. A slot still held by
//! an older long-lived stream pushes the newcomer into a spillover map.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Number of direct-indexed slots
pub const SLOTS: usize = 4096;
const SLOT_MASK: usize = SLOTS - 1;

/// Anything the registry can hold
pub trait RegistryEntry: Send + Sync {
    fn stream_id(&self) -> u32;
}

fn slot_of(stream_id: u32) -> usize {
    ((stream_id.wrapping_sub(1) >> 1) as usize) & SLOT_MASK
}

/// Registry of active streams
pub struct StreamRegistry<E: RegistryEntry> {
    slots: Box<[Mutex<Option<Arc<E>>>]>,
    spillover: Mutex<HashMap<u32, Arc<E>>>,
}

impl<E: RegistryEntry> StreamRegistry<E> {
    pub fn new() -> Self {
        let slots = (0..SLOTS).map(|_| Mutex::new(None)).collect::<Vec<_>>();
        StreamRegistry {
            slots: slots.into_boxed_slice(),
            spillover: Mutex::new(HashMap::new()),
        }
    }

    /// Register an exchange under its stream id
    pub fn put(&self, entry: Arc<E>) {
        let id = entry.stream_id();
        let mut slot = self.slots[slot_of(id)].lock();
        if slot.is_none() {
            *slot = Some(entry);
        } else {
            drop(slot);
            self.spillover.lock().insert(id, entry);
        }
    }

    pub fn get(&self, stream_id: u32) -> Option<Arc<E>> {
        {
            let slot = self.slots[slot_of(stream_id)].lock();
            if let Some(entry) = slot.as_ref() {
                if entry.stream_id() == stream_id {
                    return Some(entry.clone());
                }
            }
        }
        self.spillover.lock().get(&stream_id).cloned()
    }

    /// Remove a stream; a slot already reused by a newer stream is untouched
    pub fn remove(&self, stream_id: u32) -> Option<Arc<E>> {
        {
            let mut slot = self.slots[slot_of(stream_id)].lock();
            if slot.as_ref().map(|e| e.stream_id()) == Some(stream_id) {
                return slot.take();
            }
        }
        self.spillover.lock().remove(&stream_id)
    }

    /// Visit every registered exchange
    ///
    /// Entries are collected first so `f` runs without registry locks held
    /// and may itself remove streams.
    pub fn for_each<F: FnMut(&Arc<E>)>(&self, f: F) {
        self.for_each_matching(|_| true, f);
    }

    /// Visit every exchange whose stream id satisfies `predicate`
    pub fn for_each_matching<P, F>(&self, mut predicate: P, mut f: F)
    where
        P: FnMut(u32) -> bool,
        F: FnMut(&Arc<E>),
    {
        for entry in self.snapshot() {
            if predicate(entry.stream_id()) {
                f(&entry);
            }
        }
    }

    /// Empty the registry, handing each removed exchange to `close`
    pub fn clear_and_close<F: FnMut(Arc<E>)>(&self, mut close: F) {
        let mut removed = Vec::new();
        for slot in self.slots.iter() {
            if let Some(entry) = slot.lock().take() {
                removed.push(entry);
            }
        }
        removed.extend(self.spillover.lock().drain().map(|(_, entry)| entry));
        for entry in removed {
            close(entry);
        }
    }

    /// Number of registered streams
    pub fn len(&self) -> usize {
        let direct = self.slots.iter().filter(|slot| slot.lock().is_some()).count();
        direct + self.spillover.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<E>> {
        let mut entries: Vec<Arc<E>> = self
            .slots
            .iter()
            .filter_map(|slot| slot.lock().clone())
            .collect();
        entries.extend(self.spillover.lock().values().cloned());
        entries
    }
}

impl<E: RegistryEntry> Default for StreamRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Entry(u32);

    impl RegistryEntry for Entry {
        fn stream_id(&self) -> u32 {
            self.0
        }
    }

    #[test]
    fn test_put_get_remove() {
        let registry = StreamRegistry::new();
        registry.put(Arc::new(Entry(1)));
        registry.put(Arc::new(Entry(3)));

        assert_eq!(registry.get(1).map(|e| e.0), Some(1));
        assert_eq!(registry.get(3).map(|e| e.0), Some(3));
        assert!(registry.get(5).is_none());
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.remove(1).map(|e| e.0), Some(1));
        assert!(registry.remove(1).is_none());
        assert!(registry.get(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_slot_collision_spills_over() {
        let registry = StreamRegistry::new();
        let old = 1;
        let new = 1 + 2 * SLOTS as u32;
        assert_eq!(slot_of(old), slot_of(new));

        registry.put(Arc::new(Entry(old)));
        registry.put(Arc::new(Entry(new)));
        assert_eq!(registry.get(old).map(|e| e.0), Some(old));
        assert_eq!(registry.get(new).map(|e| e.0), Some(new));

        // Removing the spilled stream must not disturb the slot owner
        assert!(registry.remove(new).is_some());
        assert_eq!(registry.get(old).map(|e| e.0), Some(old));
        assert!(registry.get(new).is_none());
    }

    #[test]
    fn test_for_each_matching() {
        let registry = StreamRegistry::new();
        for id in [1, 3, 5, 7, 9] {
            registry.put(Arc::new(Entry(id)));
        }
        let mut above = Vec::new();
        registry.for_each_matching(|id| id > 5, |e| above.push(e.0));
        above.sort_unstable();
        assert_eq!(above, vec![7, 9]);

        let mut count = 0;
        registry.for_each(|e| {
            registry.remove(e.0);
            count += 1;
        });
        assert_eq!(count, 5);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_and_close() {
        let registry = StreamRegistry::new();
        registry.put(Arc::new(Entry(1)));
        registry.put(Arc::new(Entry(1 + 2 * SLOTS as u32)));
        let mut closed = Vec::new();
        registry.clear_and_close(|e| closed.push(e.0));
        closed.sort_unstable();
        assert_eq!(closed, vec![1, 1 + 2 * SLOTS as u32]);
        assert!(registry.is_empty());
    }
}
