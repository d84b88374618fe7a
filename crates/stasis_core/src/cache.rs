//! Read-optimized concurrent map.
//!
//! Readers go through an immutable snapshot published behind an
//! [`ArcSwap`]; writers serialize on one mutex guarding a mutable overlay.
//!
//! ```text
//! read snapshot (ArcSwap)            overlay (Mutex)
//! ┌──────────────────────────┐       ┌───────────────────────────┐
//! │ map: K -> Arc<Entry>     │       │ dirty: Option<K -> Entry> │
//! │ amended: bool            │       │ misses: usize             │
//! └──────────────────────────┘       └───────────────────────────┘
//! ```
//!
//! The snapshot's key set is never mutated after publication. Only entry
//! contents change, each through its own `ArcSwap<Slot>`. A deleted key that
//! is in the snapshot stays there as a tombstone so lookups of it remain
//! lock-free.
//!
//! Once the overlay exists it holds every live key of the snapshot plus the
//! keys added since (`amended`). Lookups that miss the snapshot while
//! `amended` is set take the lock and count a miss; when misses reach the
//! overlay's size, the overlay is promoted to be the new snapshot.

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Contents of a cache entry.
enum Slot<V> {
    /// Logically deleted, still structurally present in the snapshot.
    Tombstoned,
    /// Live value.
    Present(Arc<V>),
}

/// A key's slot. Shared between the snapshot and the overlay.
struct Entry<V> {
    slot: ArcSwap<Slot<V>>,
}

impl<V> Entry<V> {
    fn new(value: Arc<V>) -> Self {
        Self {
            slot: ArcSwap::from_pointee(Slot::Present(value)),
        }
    }

    fn load(&self) -> Option<Arc<V>> {
        match &**self.slot.load() {
            Slot::Present(value) => Some(Arc::clone(value)),
            Slot::Tombstoned => None,
        }
    }

    fn is_live(&self) -> bool {
        matches!(**self.slot.load(), Slot::Present(_))
    }

    /// Swaps in `value` unless the entry is tombstoned.
    ///
    /// Reviving a tombstone must go through the overlay lock.
    fn try_store(&self, value: &Arc<V>) -> bool {
        let mut current = self.slot.load_full();
        loop {
            if matches!(*current, Slot::Tombstoned) {
                return false;
            }
            let previous = self
                .slot
                .compare_and_swap(&current, Arc::new(Slot::Present(Arc::clone(value))));
            if Arc::ptr_eq(&*previous, &current) {
                return true;
            }
            current = Guard::into_inner(previous);
        }
    }

    /// Unconditionally stores `value`. Caller holds the overlay lock.
    fn set(&self, value: Arc<V>) {
        self.slot.store(Arc::new(Slot::Present(value)));
    }

    /// Tombstones the entry, returning the value it held.
    fn delete(&self) -> Option<Arc<V>> {
        match &*self.slot.swap(Arc::new(Slot::Tombstoned)) {
            Slot::Present(value) => Some(Arc::clone(value)),
            Slot::Tombstoned => None,
        }
    }
}

type EntryMap<K, V> = HashMap<K, Arc<Entry<V>>>;

/// Published read snapshot.
struct ReadOnly<K, V> {
    map: Arc<EntryMap<K, V>>,
    /// The overlay may hold keys missing from `map`.
    amended: bool,
}

struct Overlay<K, V> {
    dirty: Option<EntryMap<K, V>>,
    misses: usize,
}

/// A concurrent map with lock-free reads of stable keys.
///
/// Suited to read-heavy tables whose key set grows slowly: once a key has
/// been promoted into the read snapshot, `load`, in-place `store` and
/// `delete` on it never take the lock.
///
/// Values are handed out as `Arc<V>`; a stored value is never mutated in
/// place, it is replaced.
///
/// # Example
///
/// ```rust
/// use stasis_core::ConcurrentCache;
///
/// let cache = ConcurrentCache::new();
/// cache.store(1u64, "one".to_string());
/// assert_eq!(cache.load(&1).as_deref().map(String::as_str), Some("one"));
///
/// cache.delete(&1);
/// assert!(cache.load(&1).is_none());
/// ```
pub struct ConcurrentCache<K, V> {
    read: ArcSwap<ReadOnly<K, V>>,
    overlay: Mutex<Overlay<K, V>>,
}

impl<K, V> ConcurrentCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            read: ArcSwap::from_pointee(ReadOnly {
                map: Arc::new(HashMap::new()),
                amended: false,
            }),
            overlay: Mutex::new(Overlay {
                dirty: None,
                misses: 0,
            }),
        }
    }

    /// Returns the value stored for `key`.
    pub fn load(&self, key: &K) -> Option<Arc<V>> {
        {
            let read = self.read.load();
            if let Some(entry) = read.map.get(key) {
                return entry.load();
            }
            if !read.amended {
                return None;
            }
        }

        let mut overlay = self.overlay.lock();
        let read = self.read.load_full();
        if let Some(entry) = read.map.get(key) {
            return entry.load();
        }
        if !read.amended {
            return None;
        }
        let entry = overlay.dirty.as_ref().and_then(|d| d.get(key)).cloned();
        self.miss_locked(&mut overlay);
        entry.and_then(|e| e.load())
    }

    /// Returns true if `key` has a live value.
    pub fn contains(&self, key: &K) -> bool {
        self.load(key).is_some()
    }

    /// Stores `value` for `key`, replacing any previous value.
    pub fn store(&self, key: K, value: V) {
        self.store_arc(key, Arc::new(value));
    }

    /// Stores an already shared value.
    pub fn store_arc(&self, key: K, value: Arc<V>) {
        {
            let read = self.read.load();
            if let Some(entry) = read.map.get(&key) {
                if entry.try_store(&value) {
                    return;
                }
            }
        }

        let mut overlay = self.overlay.lock();
        let read = self.read.load_full();
        if let Some(entry) = read.map.get(&key) {
            if !entry.is_live() {
                Self::dirty_locked(&mut overlay, &read)
                    .entry(key)
                    .or_insert_with(|| Arc::clone(entry));
            }
            entry.set(value);
        } else if let Some(entry) = overlay.dirty.as_ref().and_then(|d| d.get(&key)) {
            entry.set(value);
        } else {
            self.insert_locked(&mut overlay, &read, key, value);
        }
    }

    /// Returns the existing value for `key` if live; otherwise stores
    /// `value` and returns it.
    ///
    /// The flag is true if the value was loaded, false if stored.
    pub fn load_or_store(&self, key: K, value: V) -> (Arc<V>, bool) {
        {
            let read = self.read.load();
            if let Some(existing) = read.map.get(&key).and_then(|e| e.load()) {
                return (existing, true);
            }
        }

        let value = Arc::new(value);
        let mut overlay = self.overlay.lock();
        let read = self.read.load_full();

        if let Some(entry) = read.map.get(&key) {
            if let Some(existing) = entry.load() {
                return (existing, true);
            }
            Self::dirty_locked(&mut overlay, &read)
                .entry(key)
                .or_insert_with(|| Arc::clone(entry));
            entry.set(Arc::clone(&value));
            return (value, false);
        }

        if let Some(entry) = overlay.dirty.as_ref().and_then(|d| d.get(&key)).cloned() {
            let result = match entry.load() {
                Some(existing) => (existing, true),
                None => {
                    entry.set(Arc::clone(&value));
                    (value, false)
                }
            };
            self.miss_locked(&mut overlay);
            return result;
        }

        self.insert_locked(&mut overlay, &read, key, Arc::clone(&value));
        (value, false)
    }

    /// Removes `key`, returning the value it held.
    pub fn load_and_delete(&self, key: &K) -> Option<Arc<V>> {
        {
            let read = self.read.load();
            if let Some(entry) = read.map.get(key) {
                return entry.delete();
            }
            if !read.amended {
                return None;
            }
        }

        let mut overlay = self.overlay.lock();
        let read = self.read.load_full();
        if let Some(entry) = read.map.get(key) {
            drop(overlay);
            return entry.delete();
        }
        if !read.amended {
            return None;
        }
        let removed = overlay.dirty.as_mut().and_then(|d| d.remove(key));
        self.miss_locked(&mut overlay);
        removed.and_then(|e| e.delete())
    }

    /// Removes `key`.
    pub fn delete(&self, key: &K) {
        self.load_and_delete(key);
    }

    /// Calls `f` for every live entry until it returns false.
    ///
    /// If the overlay holds keys the snapshot lacks, it is promoted first so
    /// the walk runs lock-free over one consistent key set. Values stored
    /// concurrently may or may not be observed.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, &Arc<V>) -> bool,
    {
        let mut read = self.read.load_full();
        if read.amended {
            let mut overlay = self.overlay.lock();
            read = self.read.load_full();
            if read.amended {
                if let Some(promoted) = self.promote_locked(&mut overlay) {
                    read = promoted;
                }
            }
        }

        for (key, entry) in read.map.iter() {
            if let Some(value) = entry.load() {
                if !f(key, &value) {
                    break;
                }
            }
        }
    }

    /// Returns the number of live entries.
    ///
    /// Walks the whole map.
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.range(|_, _| {
            count += 1;
            true
        });
        count
    }

    /// Returns true if there are no live entries.
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.range(|_, _| {
            empty = false;
            false
        });
        empty
    }

    /// Returns a copy of every live key.
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::new();
        self.range(|key, _| {
            keys.push(key.clone());
            true
        });
        keys
    }

    /// Returns the overlay, materializing it from the snapshot's live
    /// entries if it does not exist yet.
    fn dirty_locked<'a>(
        overlay: &'a mut Overlay<K, V>,
        read: &ReadOnly<K, V>,
    ) -> &'a mut EntryMap<K, V> {
        overlay.dirty.get_or_insert_with(|| {
            read.map
                .iter()
                .filter(|(_, entry)| entry.is_live())
                .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
                .collect()
        })
    }

    fn insert_locked(
        &self,
        overlay: &mut Overlay<K, V>,
        read: &ReadOnly<K, V>,
        key: K,
        value: Arc<V>,
    ) {
        Self::dirty_locked(overlay, read).insert(key, Arc::new(Entry::new(value)));
        if !read.amended {
            self.read.store(Arc::new(ReadOnly {
                map: Arc::clone(&read.map),
                amended: true,
            }));
        }
    }

    fn miss_locked(&self, overlay: &mut Overlay<K, V>) {
        overlay.misses += 1;
        let dirty_len = overlay.dirty.as_ref().map_or(0, HashMap::len);
        if overlay.misses >= dirty_len {
            self.promote_locked(overlay);
        }
    }

    fn promote_locked(&self, overlay: &mut Overlay<K, V>) -> Option<Arc<ReadOnly<K, V>>> {
        overlay.misses = 0;
        let dirty = overlay.dirty.take()?;
        let promoted = Arc::new(ReadOnly {
            map: Arc::new(dirty),
            amended: false,
        });
        self.read.store(Arc::clone(&promoted));
        Some(promoted)
    }

    #[cfg(test)]
    fn in_snapshot(&self, key: &K) -> bool {
        self.read.load().map.contains_key(key)
    }

    #[cfg(test)]
    fn is_amended(&self) -> bool {
        self.read.load().amended
    }
}

impl<K, V> Default for ConcurrentCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for ConcurrentCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let read = self.read.load();
        f.debug_struct("ConcurrentCache")
            .field("snapshot_len", &read.map.len())
            .field("amended", &read.amended)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn empty_cache() {
        let cache: ConcurrentCache<u32, String> = ConcurrentCache::new();
        assert!(cache.load(&1).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn store_and_load() {
        let cache = ConcurrentCache::new();
        cache.store(1, "a");
        cache.store(2, "b");
        assert_eq!(cache.load(&1).as_deref(), Some(&"a"));
        assert_eq!(cache.load(&2).as_deref(), Some(&"b"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn store_replaces() {
        let cache = ConcurrentCache::new();
        cache.store(1, 10);
        cache.store(1, 11);
        assert_eq!(cache.load(&1).as_deref(), Some(&11));

        // promote, then replace through the lock-free path
        cache.range(|_, _| true);
        assert!(cache.in_snapshot(&1));
        cache.store(1, 12);
        assert_eq!(cache.load(&1).as_deref(), Some(&12));
    }

    #[test]
    fn new_key_marks_snapshot_amended() {
        let cache = ConcurrentCache::new();
        cache.store(1, ());
        assert!(cache.is_amended());
        assert!(!cache.in_snapshot(&1));
    }

    #[test]
    fn delete_tombstones_snapshot_key() {
        let cache = ConcurrentCache::new();
        cache.store(7, "x");
        cache.range(|_, _| true);
        assert!(cache.in_snapshot(&7));

        cache.delete(&7);
        assert!(cache.load(&7).is_none());
        assert!(cache.in_snapshot(&7));
        assert!(!cache.is_amended());

        cache.store(7, "y");
        assert_eq!(cache.load(&7).as_deref(), Some(&"y"));
    }

    #[test]
    fn delete_overlay_only_key() {
        let cache = ConcurrentCache::new();
        cache.store(1, 1);
        assert_eq!(cache.load_and_delete(&1).as_deref(), Some(&1));
        assert!(cache.load(&1).is_none());
        assert!(cache.load_and_delete(&1).is_none());
    }

    #[test]
    fn misses_promote_overlay() {
        let cache = ConcurrentCache::new();
        for key in 0..4 {
            cache.store(key, key * 10);
        }
        assert!(cache.is_amended());

        // Keys only in the overlay cost one locked miss each.
        for key in 0..4 {
            assert_eq!(cache.load(&key).as_deref(), Some(&(key * 10)));
        }

        assert!(!cache.is_amended());
        for key in 0..4 {
            assert!(cache.in_snapshot(&key));
            assert_eq!(cache.load(&key).as_deref(), Some(&(key * 10)));
        }
    }

    #[test]
    fn revived_tombstone_survives_promotion() {
        let cache = ConcurrentCache::new();
        cache.store(1, "a");
        cache.store(2, "b");
        cache.range(|_, _| true);

        cache.delete(&1);
        cache.store(3, "c"); // materializes the overlay without key 1
        cache.store(1, "again");

        cache.range(|_, _| true);
        assert_eq!(cache.load(&1).as_deref(), Some(&"again"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn load_or_store_semantics() {
        let cache = ConcurrentCache::new();
        let (value, loaded) = cache.load_or_store(1, "first");
        assert_eq!(*value, "first");
        assert!(!loaded);

        let (value, loaded) = cache.load_or_store(1, "second");
        assert_eq!(*value, "first");
        assert!(loaded);

        cache.range(|_, _| true);
        cache.delete(&1);
        let (value, loaded) = cache.load_or_store(1, "third");
        assert_eq!(*value, "third");
        assert!(!loaded);
        assert_eq!(cache.load(&1).as_deref(), Some(&"third"));
    }

    #[test]
    fn range_stops_early() {
        let cache = ConcurrentCache::new();
        for key in 0..10 {
            cache.store(key, ());
        }
        let mut seen = 0;
        cache.range(|_, _| {
            seen += 1;
            seen < 3
        });
        assert_eq!(seen, 3);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let cache = Arc::new(ConcurrentCache::new());
        for key in 0..100u64 {
            cache.store(key, key);
        }

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for round in 0..200u64 {
                    let key = (round * 7 + t) % 100;
                    if let Some(value) = cache.load(&key) {
                        assert!(*value == key || *value == key + 1000);
                    }
                    if round % 5 == 0 {
                        cache.store(key, key + 1000);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 100);
    }

    #[derive(Debug, Clone)]
    enum CacheOp {
        Store(u8, u32),
        Delete(u8),
        Load(u8),
        LoadOrStore(u8, u32),
        Range,
    }

    fn cache_op() -> impl Strategy<Value = CacheOp> {
        prop_oneof![
            (0u8..16, any::<u32>()).prop_map(|(k, v)| CacheOp::Store(k, v)),
            (0u8..16).prop_map(CacheOp::Delete),
            (0u8..16).prop_map(CacheOp::Load),
            (0u8..16, any::<u32>()).prop_map(|(k, v)| CacheOp::LoadOrStore(k, v)),
            Just(CacheOp::Range),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_hashmap(ops in proptest::collection::vec(cache_op(), 1..200)) {
            let cache = ConcurrentCache::new();
            let mut model = HashMap::new();

            for op in ops {
                match op {
                    CacheOp::Store(k, v) => {
                        cache.store(k, v);
                        model.insert(k, v);
                    }
                    CacheOp::Delete(k) => {
                        let removed = cache.load_and_delete(&k).map(|v| *v);
                        prop_assert_eq!(removed, model.remove(&k));
                    }
                    CacheOp::Load(k) => {
                        prop_assert_eq!(cache.load(&k).map(|v| *v), model.get(&k).copied());
                    }
                    CacheOp::LoadOrStore(k, v) => {
                        let was_present = model.contains_key(&k);
                        let (value, loaded) = cache.load_or_store(k, v);
                        let expected = *model.entry(k).or_insert(v);
                        prop_assert_eq!(*value, expected);
                        prop_assert_eq!(loaded, was_present);
                    }
                    CacheOp::Range => {
                        prop_assert_eq!(cache.len(), model.len());
                    }
                }
            }

            let mut keys = cache.keys();
            keys.sort_unstable();
            let mut expected: Vec<u8> = model.keys().copied().collect();
            expected.sort_unstable();
            prop_assert_eq!(keys, expected);
        }
    }
}
