//! Registry - session id keyed table with explicit removal
//!
//! Client sessions and server connectors live here while their sockets are
//! open. Owners remove their entry when the stream ends; nothing is left to
//! drift until the process exits.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Table of live entries keyed by session id
pub struct Registry<T> {
    entries: Mutex<HashMap<u64, Arc<T>>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert an entry. Returns false (and leaves the table unchanged) if the
    /// id is already taken.
    pub fn insert(&self, id: u64, entry: Arc<T>) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return false;
        }
        entries.insert(id, entry);
        true
    }

    pub fn get(&self, id: u64) -> Option<Arc<T>> {
        self.entries.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<T>> {
        self.entries.lock().remove(&id)
    }

    /// Remove `id` only if it still maps to `entry`.
    pub fn remove_entry(&self, id: u64, entry: &Arc<T>) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&id) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every entry matching `predicate`, returning what was removed.
    pub fn drain_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<Arc<T>> {
        let mut entries = self.entries.lock();
        let mut ids = Vec::new();
        for (id, entry) in entries.iter() {
            if predicate(entry.as_ref()) {
                ids.push(*id);
            }
        }
        ids.into_iter().filter_map(|id| entries.remove(&id)).collect()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let registry = Registry::new();
        assert!(registry.insert(1, Arc::new("one")));
        assert_eq!(registry.get(1).as_deref(), Some(&"one"));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(1).is_some());
        assert!(registry.get(1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let registry = Registry::new();
        assert!(registry.insert(7, Arc::new(1u32)));
        assert!(!registry.insert(7, Arc::new(2u32)));
        assert_eq!(*registry.get(7).unwrap(), 1);
    }

    #[test]
    fn test_remove_entry_checks_identity() {
        let registry = Registry::new();
        let old = Arc::new(1u32);
        let new = Arc::new(1u32);
        registry.insert(3, old.clone());
        registry.remove(3);
        registry.insert(3, new.clone());

        assert!(!registry.remove_entry(3, &old));
        assert!(registry.get(3).is_some());
        assert!(registry.remove_entry(3, &new));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain_where() {
        let registry = Registry::new();
        for id in 0..6u64 {
            registry.insert(id, Arc::new(id));
        }
        let removed = registry.drain_where(|v| v % 2 == 0);
        assert_eq!(removed.len(), 3);
        assert_eq!(registry.len(), 3);
        assert!(registry.get(1).is_some());
        assert!(registry.get(2).is_none());
    }
}
