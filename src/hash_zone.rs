// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Hash-zone dedup coordination (spec §4.4): one hash zone per logical
//! thread, owning a fixed-capacity pool of hash locks and a map from
//! chunk-name to hash lock.
//!
//! The chunk name itself is an opaque content-address (the dedup index is
//! out of scope, spec §1); this module only needs a stable 32-bit
//! fragment of it to index into a hash map.

use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Byte offset into a chunk name this zone hashes on. The dedup index
/// (out of scope here) hashes bytes `[0..4]`; this crate deliberately
/// hashes a disjoint fragment, `[4..8]`, so that a hash collision in one
/// subsystem doesn't correlate with a collision in the other (spec §9,
/// "Pointer-map keyed by chunk-name").
pub const HASH_KEY_OFFSET: usize = 4;

/// A chunk name: the dedup index's content address. Opaque payload byte
/// array; this core never interprets its contents (spec §1 Non-goals).
pub type ChunkName = [u8; 16];

fn hash_key(name: &ChunkName) -> u32 {
    name.get(HASH_KEY_OFFSET..HASH_KEY_OFFSET + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or_else(|| {
            // Should be unreachable given ChunkName's fixed size, but fall
            // back to an independent hash of the whole name rather than
            // panic, per the spec §9 open question on this offset.
            use std::hash::{Hash, Hasher};
            let mut hasher = rustc_hash::FxHasher::default();
            name.hash(&mut hasher);
            hasher.finish() as u32
        })
}

/// Lifecycle of one hash lock. The states preceding `Destroying` live in
/// a separate, opaque state machine (spec §9 open question); this core
/// only contracts on the `Destroying` precondition for `return_lock`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HashLockState {
    /// In the free pool, not bound to any chunk name.
    Free,
    /// Bound to a chunk name, actively coordinating a write (opaque to
    /// this core beyond existing).
    Active,
    /// Finished; about to be returned to the pool.
    Destroying,
}

/// One entry in the hash-lock pool.
#[derive(Debug)]
pub struct HashLock {
    state: HashLockState,
    chunk_name: Option<ChunkName>,
    registered: bool,
    waiter_count: u32,
    holds_pbn_lock: bool,
}

impl HashLock {
    fn new() -> Self {
        Self {
            state: HashLockState::Free,
            chunk_name: None,
            registered: false,
            waiter_count: 0,
            holds_pbn_lock: false,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HashLockState {
        self.state
    }

    /// The chunk name this lock is bound to, if any.
    #[must_use]
    pub fn chunk_name(&self) -> Option<ChunkName> {
        self.chunk_name
    }

    /// Moves this lock into `Destroying`, ready to be returned.
    pub fn begin_destroy(&mut self) {
        self.state = HashLockState::Destroying;
    }

    /// Test/diagnostic hook: record that a waiter is queued on this lock.
    pub fn add_waiter(&mut self) {
        self.waiter_count += 1;
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

/// Fixed-capacity pool of [`HashLock`]s plus the chunk-name -> lock map,
/// owned by one logical (hash) zone thread (spec §4.4).
pub struct HashZone {
    locks: Vec<HashLock>,
    free_list: VecDeque<usize>,
    by_chunk_name: FxHashMap<u32, Vec<usize>>,
}

impl HashZone {
    /// Builds a hash zone with `capacity` preallocated locks
    /// (`LOCK_POOL_CAPACITY`, spec §4.4 — sized to the maximum concurrent
    /// user I/Os so `acquire` never needs to block).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            locks: (0..capacity).map(|_| HashLock::new()).collect(),
            free_list: (0..capacity).collect(),
            by_chunk_name: FxHashMap::default(),
        }
    }

    /// Number of preallocated locks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.locks.len()
    }

    /// Borrows a lock from the free pool and binds it to `chunk_name`. If
    /// a lock is already registered for this chunk name:
    ///   - with `replace_with = None`, the existing lock's index is
    ///     returned and the freshly borrowed one is recycled;
    ///   - with `replace_with = Some(idx)`, the existing entry must equal
    ///     `idx` (an invariant violation otherwise) and is swapped out for
    ///     the new borrow.
    ///
    /// Panics if the pool is exhausted: per spec §4.4 this is an
    /// assertion, since every in-flight request owns at most one hash
    /// lock and the pool is sized to the maximum concurrency.
    pub fn acquire(&mut self, chunk_name: ChunkName, replace_with: Option<usize>) -> usize {
        let key = hash_key(&chunk_name);

        if let Some(bucket) = self.by_chunk_name.get(&key) {
            if let Some(&existing) = bucket
                .iter()
                .find(|&&idx| self.locks[idx].chunk_name == Some(chunk_name))
            {
                if let Some(expected) = replace_with {
                    assert_eq!(
                        existing, expected,
                        "replace_lock did not match the lock found for this chunk name"
                    );
                }
                return existing;
            }
        }

        let idx = self
            .free_list
            .pop_front()
            .expect("hash lock pool exhausted: capacity must bound concurrent user I/Os");

        let lock = &mut self.locks[idx];
        lock.state = HashLockState::Active;
        lock.chunk_name = Some(chunk_name);
        lock.registered = true;

        self.by_chunk_name.entry(key).or_default().push(idx);

        idx
    }

    /// Returns a lock to the pool.
    ///
    /// Preconditions (asserted, per spec §4.4): the lock is in
    /// `Destroying` state, has no waiters, and is not currently holding a
    /// duplicate PBN lock.
    pub fn return_lock(&mut self, idx: usize) {
        assert_eq!(
            self.locks[idx].state,
            HashLockState::Destroying,
            "hash lock returned while not in Destroying state"
        );
        assert_eq!(
            self.locks[idx].waiter_count, 0,
            "hash lock returned with waiters still queued"
        );
        assert!(
            !self.locks[idx].holds_pbn_lock,
            "hash lock returned while still holding a PBN lock"
        );

        if self.locks[idx].registered {
            if let Some(name) = self.locks[idx].chunk_name {
                let key = hash_key(&name);
                if let Some(bucket) = self.by_chunk_name.get_mut(&key) {
                    bucket.retain(|&i| i != idx);
                    if bucket.is_empty() {
                        self.by_chunk_name.remove(&key);
                    }
                }
            }
        }

        self.locks[idx].clear();
        self.free_list.push_back(idx);
    }

    /// Borrows the lock at `idx`.
    #[must_use]
    pub fn lock(&self, idx: usize) -> &HashLock {
        &self.locks[idx]
    }

    /// Mutably borrows the lock at `idx`.
    pub fn lock_mut(&mut self, idx: usize) -> &mut HashLock {
        &mut self.locks[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(tag: u8) -> ChunkName {
        let mut n = [0u8; 16];
        n[0] = tag;
        // vary the hashed fragment too so different tags land in
        // different buckets
        n[4] = tag;
        n
    }

    #[test]
    fn acquire_new_binds_and_activates() {
        let mut zone = HashZone::new(4);
        let idx = zone.acquire(name(1), None);
        assert_eq!(zone.lock(idx).state(), HashLockState::Active);
        assert_eq!(zone.lock(idx).chunk_name(), Some(name(1)));
    }

    #[test]
    fn acquire_same_name_returns_existing_and_recycles_borrow() {
        let mut zone = HashZone::new(4);
        let first = zone.acquire(name(2), None);
        let second = zone.acquire(name(2), None);
        assert_eq!(first, second, "second acquire should find the existing lock");
        // only one lock was consumed from the free pool
        assert_eq!(zone.free_list.len(), 3);
    }

    #[test]
    fn return_then_acquire_reuses_slot() {
        let mut zone = HashZone::new(1);
        let idx = zone.acquire(name(3), None);
        zone.lock_mut(idx).begin_destroy();
        zone.return_lock(idx);

        let idx2 = zone.acquire(name(3), None);
        assert_eq!(idx, idx2);
        assert_eq!(zone.lock(idx2).state(), HashLockState::Active);
    }

    #[test]
    #[should_panic(expected = "not in Destroying state")]
    fn return_without_destroying_panics() {
        let mut zone = HashZone::new(1);
        let idx = zone.acquire(name(4), None);
        zone.return_lock(idx);
    }

    #[test]
    fn hash_key_uses_disjoint_offset() {
        let mut n = [0u8; 16];
        n[0..4].copy_from_slice(&[1, 2, 3, 4]);
        n[4..8].copy_from_slice(&[9, 9, 9, 9]);
        assert_eq!(hash_key(&n), u32::from_le_bytes([9, 9, 9, 9]));
    }
}
