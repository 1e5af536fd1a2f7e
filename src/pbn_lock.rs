// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! PBN locks: per-physical-zone ownership tokens for an in-flight write
//! (spec §4.5). A PBN lock may, at any instant, be the sole owner of a
//! PROVISIONAL reference on its PBN (spec invariant I5).

/// An ownership token for a specific PBN, held by an in-flight write.
///
/// Re-architected per spec §9 ("Provisional reference as a magic count
/// value"): rather than overloading the counter byte with no independent
/// owner record, the lock itself tracks whether it currently holds the
/// provisional pin, so `ReferenceCounts::adjust` can assert single
/// ownership (invariant I5) instead of trusting the byte alone.
#[derive(Debug, Default)]
pub struct PbnLock {
    pbn: u64,
    holds_provisional: bool,
}

impl PbnLock {
    /// Creates a lock for `pbn`, not yet holding a provisional reference.
    #[must_use]
    pub fn new(pbn: u64) -> Self {
        Self {
            pbn,
            holds_provisional: false,
        }
    }

    /// The PBN this lock is bound to.
    #[must_use]
    pub fn pbn(&self) -> u64 {
        self.pbn
    }

    /// Whether this lock currently owns a PROVISIONAL reference.
    #[must_use]
    pub fn has_provisional_reference(&self) -> bool {
        self.holds_provisional
    }

    /// Marks this lock as the owner of a PROVISIONAL reference. Called by
    /// `ReferenceCounts::allocate`/`provisional_reference` when the
    /// counter transitions FREE -> PROVISIONAL (spec §4.1, §4.5).
    pub fn assign_provisional_reference(&mut self) {
        debug_assert!(
            !self.holds_provisional,
            "lock already owns a provisional reference"
        );
        self.holds_provisional = true;
    }

    /// Clears the provisional-ownership flag. Called when the counter
    /// transitions away from PROVISIONAL, either by confirmation
    /// (DATA_INCREMENT, BLOCK_MAP_INCREMENT) or release (DATA_DECREMENT).
    pub fn unassign_provisional_reference(&mut self) {
        self.holds_provisional = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unassigned() {
        let lock = PbnLock::new(42);
        assert_eq!(lock.pbn(), 42);
        assert!(!lock.has_provisional_reference());
    }

    #[test]
    fn assign_and_unassign() {
        let mut lock = PbnLock::new(1);
        lock.assign_provisional_reference();
        assert!(lock.has_provisional_reference());
        lock.unassign_provisional_reference();
        assert!(!lock.has_provisional_reference());
    }
}
