//! Fixed-capacity tables standing in for BPF hash maps
//!
//! Each operation takes the lock once, so single-key operations are atomic
//! and nothing spanning two operations is. Inserting a new key into a full
//! table fails; updating an existing key always succeeds.

use memtrace_common::{AncestryMaps, EnableFlag, PendingCalls, TRACKING_ENABLED_KEY};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub struct BoundedMap<K, V> {
    entries: Mutex<HashMap<K, V>>,
    capacity: usize,
}

impl<K: Eq + Hash, V: Copy> BoundedMap<K, V> {
    #[must_use]
    pub fn with_max_entries(capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::with_capacity(capacity.min(1024))), capacity }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        // a panicking test thread must not wedge the other hooks
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` when `key` is new and the table is full
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut entries = self.lock();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, value);
        true
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).copied()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    // occupancy only; emptiness never matters for a BPF-style table
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

impl<V: Copy> PendingCalls<V> for BoundedMap<u64, V> {
    fn stash(&self, pid_tgid: u64, args: &V) -> bool {
        self.insert(pid_tgid, *args)
    }

    fn take(&self, pid_tgid: u64) -> Option<V> {
        self.remove(&pid_tgid)
    }
}

/// Absent means enabled
impl EnableFlag for BoundedMap<u32, u8> {
    fn is_enabled(&self) -> bool {
        self.get(&TRACKING_ENABLED_KEY).map_or(true, |flag| flag != 0)
    }
}

/// Tracked-pid and parent tables of one object
#[derive(Debug)]
pub struct HostAncestry {
    pub tracked: BoundedMap<u32, u8>,
    pub parents: BoundedMap<u32, u32>,
}

impl HostAncestry {
    #[must_use]
    pub fn with_max_entries(capacity: usize) -> Self {
        Self {
            tracked: BoundedMap::with_max_entries(capacity),
            parents: BoundedMap::with_max_entries(capacity),
        }
    }
}

impl AncestryMaps for HostAncestry {
    fn is_marked(&self, pid: u32) -> bool {
        self.tracked.contains(&pid)
    }

    fn parent_of(&self, pid: u32) -> Option<u32> {
        self.parents.get(&pid)
    }

    fn mark(&self, pid: u32) -> bool {
        self.tracked.insert(pid, 1)
    }

    fn link(&self, child: u32, parent: u32) -> bool {
        self.parents.insert(child, parent)
    }

    fn forget(&self, pid: u32) {
        self.tracked.remove(&pid);
        self.parents.remove(&pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rejects_only_new_keys() {
        let map = BoundedMap::<u32, u32>::with_max_entries(2);
        assert!(map.insert(1, 10));
        assert!(map.insert(2, 20));
        assert!(!map.insert(3, 30));
        assert!(map.insert(1, 11));
        assert_eq!(map.get(&1), Some(11));
        assert_eq!(map.get(&3), None);

        map.remove(&2);
        assert!(map.insert(3, 30));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_enable_flag_defaults_on() {
        let flag = BoundedMap::<u32, u8>::with_max_entries(1);
        assert!(flag.is_enabled());
        flag.insert(TRACKING_ENABLED_KEY, 0);
        assert!(!flag.is_enabled());
        flag.insert(TRACKING_ENABLED_KEY, 1);
        assert!(flag.is_enabled());
    }

    #[test]
    fn test_pending_take_consumes() {
        let pending = BoundedMap::<u64, u64>::with_max_entries(4);
        assert!(pending.stash(7, &100));
        assert!(pending.stash(7, &200));
        assert_eq!(pending.take(7), Some(200));
        assert_eq!(pending.take(7), None);
    }
}
