//! Hash table indexed by a delta-encoded expiry timeline
//!
//! Every entry lives in two structures at once:
//!
//! - a fixed array of bucket chains, for O(1) expected lookup by key
//! - a doubly-linked timeline ordered by expiry, where each entry stores the
//!   number of ticks between the previous entry's expiry and its own
//!
//! Because every entry in one table gets the same TTL and is appended at the
//! tail, the timeline never needs sorting. Advancing time only touches the
//! head, so [`ExpiringTable::tick`] is O(1) amortized.
//!
//! Entries are kept in an arena (`Vec` of slots) and linked by slot index.

use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::ops::ControlFlow;

/// Callbacks run when the table drops a value on its own
///
/// Values handed back to the caller (from [`ExpiringTable::remove`]) do not go
/// through `release`; the caller owns them from then on.
pub trait ExpiryHooks<K, V>: Send + Sync {
    /// Observe an entry whose TTL ran out. Runs before `release`.
    fn on_expire(&self, _key: &K, _value: &V) {}

    /// Dispose of a value the table no longer holds
    fn release(&self, _key: K, _value: V) {}
}

/// Hooks that do nothing; values are simply dropped
impl<K, V> ExpiryHooks<K, V> for () {}

type Slot = usize;

struct Entry<K, V> {
    key: K,
    value: V,
    /// Ticks after the previous timeline entry expires
    gap: u64,
    /// Next entry in the same bucket
    chain: Option<Slot>,
    prev: Option<Slot>,
    next: Option<Slot>,
}

/// Unsynchronized core of [`ExpiringTable`]
pub(crate) struct DeltaList<K, V, S = RandomState> {
    buckets: Vec<Option<Slot>>,
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<Slot>,
    head: Option<Slot>,
    tail: Option<Slot>,
    /// Ticks until the tail expires; always equals the sum of all gaps
    pending: u64,
    ttl: u64,
    len: usize,
    hasher: S,
}

impl<K, V, S> DeltaList<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    pub(crate) fn with_hasher(ttl: u64, bucket_count: usize, hasher: S) -> Self {
        Self {
            buckets: vec![None; bucket_count.max(1)],
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            pending: 0,
            ttl: ttl.max(1),
            len: 0,
            hasher,
        }
    }

    fn bucket_of<Q>(&self, key: &Q) -> usize
    where
        Q: Hash + ?Sized,
    {
        (self.hasher.hash_one(key) % self.buckets.len() as u64) as usize
    }

    fn entry(&self, slot: Slot) -> &Entry<K, V> {
        self.slots[slot]
            .as_ref()
            .unwrap_or_else(|| unreachable!("dangling slot {slot}"))
    }

    fn entry_mut(&mut self, slot: Slot) -> &mut Entry<K, V> {
        self.slots[slot]
            .as_mut()
            .unwrap_or_else(|| unreachable!("dangling slot {slot}"))
    }

    /// Slot holding `key`, and the slot before it in the bucket chain
    fn find<Q>(&self, key: &Q) -> Option<(Slot, Option<Slot>)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut prev = None;
        let mut cursor = self.buckets[self.bucket_of(key)];
        while let Some(slot) = cursor {
            let entry = self.entry(slot);
            if entry.key.borrow() == key {
                return Some((slot, prev));
            }
            prev = Some(slot);
            cursor = entry.chain;
        }
        None
    }

    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).map(|(slot, _)| &self.entry(slot).value)
    }

    pub(crate) fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).is_some()
    }

    /// Insert at the timeline tail with a full TTL.
    ///
    /// An existing entry with the same key is removed first and returned.
    pub(crate) fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let replaced = self.remove(&key);

        let bucket = self.bucket_of(&key);
        let gap = if self.head.is_none() {
            self.ttl
        } else {
            self.ttl - self.pending
        };

        let entry = Entry {
            key,
            value,
            gap,
            chain: self.buckets[bucket],
            prev: self.tail,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            },
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            },
        };

        self.buckets[bucket] = Some(slot);
        match self.tail {
            Some(tail) => self.entry_mut(tail).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.pending = self.ttl;
        self.len += 1;

        replaced
    }

    pub(crate) fn remove<Q>(&mut self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (slot, chain_prev) = self.find(key)?;
        let bucket = self.bucket_of(key);
        Some(self.detach(slot, bucket, chain_prev))
    }

    /// Unlink `slot` from both indexes and free it
    fn detach(&mut self, slot: Slot, bucket: usize, chain_prev: Option<Slot>) -> (K, V) {
        let entry = self.slots[slot]
            .take()
            .unwrap_or_else(|| unreachable!("dangling slot {slot}"));

        match chain_prev {
            Some(prev) => self.entry_mut(prev).chain = entry.chain,
            None => self.buckets[bucket] = entry.chain,
        }

        // The successor inherits our gap so its absolute expiry is unchanged
        match entry.next {
            Some(next) => {
                let next_entry = self.entry_mut(next);
                next_entry.gap += entry.gap;
                next_entry.prev = entry.prev;
            },
            None => {
                self.pending -= entry.gap;
                self.tail = entry.prev;
            },
        }
        match entry.prev {
            Some(prev) => self.entry_mut(prev).next = entry.next,
            None => self.head = entry.next,
        }

        self.free.push(slot);
        self.len -= 1;
        (entry.key, entry.value)
    }

    /// Advance time by one tick and return every entry that expired
    pub(crate) fn tick(&mut self) -> Vec<(K, V)> {
        let mut expired = Vec::new();
        let Some(head) = self.head else {
            return expired;
        };

        self.pending = self.pending.saturating_sub(1);
        let head_entry = self.entry_mut(head);
        head_entry.gap = head_entry.gap.saturating_sub(1);

        while let Some(head) = self.head {
            if self.entry(head).gap != 0 {
                break;
            }
            let bucket = self.bucket_of(&self.entry(head).key);
            let chain_prev = self.chain_predecessor(bucket, head);
            expired.push(self.detach(head, bucket, chain_prev));
        }
        expired
    }

    fn chain_predecessor(&self, bucket: usize, target: Slot) -> Option<Slot> {
        let mut prev = None;
        let mut cursor = self.buckets[bucket];
        while let Some(slot) = cursor {
            if slot == target {
                return prev;
            }
            prev = Some(slot);
            cursor = self.entry(slot).chain;
        }
        unreachable!("slot {target} missing from its bucket")
    }

    /// Remove everything, oldest first
    pub(crate) fn drain(&mut self) -> Vec<(K, V)> {
        let mut drained = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let entry = self.slots[slot]
                .take()
                .unwrap_or_else(|| unreachable!("dangling slot {slot}"));
            cursor = entry.next;
            drained.push((entry.key, entry.value));
        }

        self.buckets.iter_mut().for_each(|b| *b = None);
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.pending = 0;
        self.len = 0;
        drained
    }

    /// Visit entries oldest to newest until the visitor breaks
    pub(crate) fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let entry = self.entry(slot);
            if visit(&entry.key, &entry.value).is_break() {
                break;
            }
            cursor = entry.next;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn ttl(&self) -> u64 {
        self.ttl
    }

    pub(crate) fn pending(&self) -> u64 {
        self.pending
    }

    /// Gap of every timeline entry, head first
    #[cfg(test)]
    pub(crate) fn gaps(&self) -> Vec<u64> {
        let mut gaps = Vec::with_capacity(self.len);
        self.for_each(|key, _| {
            if let Some((slot, _)) = self.find(key) {
                gaps.push(self.entry(slot).gap);
            }
            ControlFlow::Continue(())
        });
        gaps
    }

    /// Number of entries reachable through the bucket chains
    #[cfg(test)]
    pub(crate) fn chained_len(&self) -> usize {
        let mut count = 0;
        for head in &self.buckets {
            let mut cursor = *head;
            while let Some(slot) = cursor {
                count += 1;
                cursor = self.entry(slot).chain;
            }
        }
        count
    }
}

/// Thread-safe expiring hash table with one fixed TTL
///
/// All operations take the table's single lock for their whole duration, so a
/// background ticker and request handlers can share one instance. Hooks run
/// after the lock is released.
///
/// # Example
///
/// ```
/// use floodnet::cache::ExpiringTable;
///
/// let table: ExpiringTable<&str, u32> = ExpiringTable::new(3, 16, ());
/// table.insert("a", 1);
/// table.tick();
/// table.tick();
/// assert_eq!(table.get("a"), Some(1));
/// table.tick();
/// assert_eq!(table.get("a"), None);
/// ```
pub struct ExpiringTable<K, V, H = (), S = RandomState> {
    inner: Mutex<DeltaList<K, V, S>>,
    hooks: H,
}

impl<K, V, H> ExpiringTable<K, V, H, RandomState>
where
    K: Hash + Eq,
    H: ExpiryHooks<K, V>,
{
    /// Create a table whose entries live `ttl_ticks` ticks
    ///
    /// `ttl_ticks` and `bucket_count` are clamped to at least 1.
    pub fn new(ttl_ticks: u64, bucket_count: usize, hooks: H) -> Self {
        Self::with_hasher(ttl_ticks, bucket_count, hooks, RandomState::new())
    }
}

impl<K, V, H, S> ExpiringTable<K, V, H, S>
where
    K: Hash + Eq,
    H: ExpiryHooks<K, V>,
    S: BuildHasher,
{
    /// Create a table with a caller-supplied hash function
    pub fn with_hasher(ttl_ticks: u64, bucket_count: usize, hooks: H, hasher: S) -> Self {
        Self {
            inner: Mutex::new(DeltaList::with_hasher(ttl_ticks, bucket_count, hasher)),
            hooks,
        }
    }

    /// Insert or refresh an entry, giving it a full TTL
    ///
    /// Returns `true` if an entry with an equal key was replaced. The replaced
    /// value goes through [`ExpiryHooks::release`].
    pub fn insert(&self, key: K, value: V) -> bool {
        let replaced = self.inner.lock().insert(key, value);
        match replaced {
            Some((key, value)) => {
                self.hooks.release(key, value);
                true
            },
            None => false,
        }
    }

    /// Insert only if no equal key is present
    ///
    /// The presence check and the insertion happen under one lock hold.
    /// Returns `true` if the entry was inserted.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let mut inner = self.inner.lock();
        if inner.contains(&key) {
            return false;
        }
        inner.insert(key, value);
        true
    }

    /// Clone out the value stored under `key`
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.inner.lock().get(key).cloned()
    }

    /// Whether `key` is present
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().contains(key)
    }

    /// Remove `key`, handing its value back to the caller
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().remove(key).map(|(_, value)| value)
    }

    /// Advance logical time by one tick, evicting whatever expires
    ///
    /// Returns the number of evicted entries.
    pub fn tick(&self) -> usize {
        let expired = self.inner.lock().tick();
        let count = expired.len();
        for (key, value) in expired {
            self.hooks.on_expire(&key, &value);
            self.hooks.release(key, value);
        }
        count
    }

    /// Release every entry and reset the table to empty
    pub fn clear(&self) {
        let drained = self.inner.lock().drain();
        for (key, value) in drained {
            self.hooks.release(key, value);
        }
    }

    /// Atomically swap the whole contents for `entries`
    ///
    /// New entries all get a full TTL, in iteration order.
    pub fn replace<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut released = Vec::new();
        {
            let mut inner = self.inner.lock();
            released.extend(inner.drain());
            for (key, value) in entries {
                released.extend(inner.insert(key, value));
            }
        }
        for (key, value) in released {
            self.hooks.release(key, value);
        }
    }

    /// Visit entries oldest to newest while holding the lock
    ///
    /// The visitor must not call back into this table.
    pub fn for_each<F>(&self, visit: F)
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        self.inner.lock().for_each(visit);
    }

    /// Current number of entries
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// TTL every entry receives, in ticks
    pub fn ttl_ticks(&self) -> u64 {
        self.inner.lock().ttl()
    }

    /// Ticks until the most recently inserted entry expires
    pub fn pending_ticks(&self) -> u64 {
        self.inner.lock().pending()
    }

    /// Hooks this table was built with
    pub fn hooks(&self) -> &H {
        &self.hooks
    }
}
