// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Fixed-capacity pool of preallocated I/O carriers, pinned to one thread
//! (spec §4.8). Re-architected per spec §9 ("Async I/O via VIO callbacks
//! -> task queue"): entries are plain arena slots identified by index,
//! and waiters are boxed closures invoked synchronously rather than
//! intrusive ring nodes.

use std::collections::VecDeque;

/// One preallocated I/O carrier: a 4 KiB buffer plus a completion slot.
#[derive(Debug)]
pub struct VioEntry {
    /// Arena index of this entry, stable for the entry's lifetime.
    pub index: usize,
    /// The 4 KiB I/O buffer.
    pub buffer: Box<[u8; crate::geometry::BLOCK_SIZE]>,
}

impl VioEntry {
    fn new(index: usize) -> Self {
        Self {
            index,
            buffer: Box::new([0u8; crate::geometry::BLOCK_SIZE]),
        }
    }
}

type Waiter = Box<dyn FnOnce(VioEntry) + Send>;

/// A fixed-capacity, single-thread-owned pool of [`VioEntry`] carriers.
///
/// `acquire` never blocks the caller's thread: if no entry is free, the
/// waiter closure is queued and invoked later, in FIFO order, from
/// `give_back` (spec §4.8, §5 "Suspension points").
pub struct VioPool {
    available: Vec<VioEntry>,
    waiters: VecDeque<Waiter>,
    capacity: usize,
    busy: usize,
    outage_count: u64,
}

impl VioPool {
    /// Builds a pool of `capacity` preallocated entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let available = (0..capacity).map(VioEntry::new).collect();
        Self {
            available,
            waiters: VecDeque::new(),
            capacity,
            busy: 0,
            outage_count: 0,
        }
    }

    /// Total capacity of the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries currently checked out.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.busy
    }

    /// Number of times `acquire` had to queue a waiter because the pool
    /// was empty.
    #[must_use]
    pub fn outage_count(&self) -> u64 {
        self.outage_count
    }

    /// Checks out one entry, invoking `waiter` with it synchronously. If
    /// none is free, `waiter` is queued and will run later from
    /// [`Self::give_back`], in the order `acquire` was called.
    pub fn acquire(&mut self, waiter: impl FnOnce(VioEntry) + Send + 'static) {
        if let Some(entry) = self.available.pop() {
            self.busy += 1;
            waiter(entry);
        } else {
            self.outage_count += 1;
            log::trace!(
                "vio pool outage #{}: no entries free (capacity={})",
                self.outage_count,
                self.capacity
            );
            self.waiters.push_back(Box::new(waiter));
        }
    }

    /// Returns `entry` to the pool: if a waiter is queued, hands the same
    /// entry straight to it; otherwise pushes it back onto the available
    /// list.
    pub fn give_back(&mut self, entry: VioEntry) {
        self.busy -= 1;
        if let Some(waiter) = self.waiters.pop_front() {
            self.busy += 1;
            waiter(entry);
        } else {
            self.available.push(entry);
        }
    }
}

impl Drop for VioPool {
    fn drop(&mut self) {
        assert_eq!(
            self.busy, 0,
            "VioPool dropped with {} entries still checked out",
            self.busy
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn acquire_synchronous_when_available() {
        let mut pool = VioPool::new(2);
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        pool.acquire(move |entry| *seen2.borrow_mut() = Some(entry.index));
        assert!(seen.borrow().is_some());
        assert_eq!(pool.busy_count(), 1);
        pool.give_back(VioEntry::new(seen.borrow().unwrap()));
    }

    #[test]
    fn waiter_served_fifo_on_give_back() {
        let mut pool = VioPool::new(1);
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut entry0 = None;
        pool.acquire(|e| entry0 = Some(e));
        let entry0 = entry0.unwrap();
        assert_eq!(pool.busy_count(), 1);

        let order_a = order.clone();
        pool.acquire(move |e| {
            order_a.borrow_mut().push(("a", e.index));
        });
        let order_b = order.clone();
        pool.acquire(move |e| {
            order_b.borrow_mut().push(("b", e.index));
        });

        assert_eq!(pool.outage_count(), 2);
        assert!(order.borrow().is_empty());

        pool.give_back(entry0);
        assert_eq!(order.borrow().as_slice(), &[("a", 0)]);

        // second waiter still queued until the first served entry comes back
        let (_, idx) = order.borrow()[0];
        pool.give_back(VioEntry::new(idx));
        assert_eq!(order.borrow().as_slice(), &[("a", 0), ("b", 0)]);
    }

    #[test]
    #[should_panic(expected = "still checked out")]
    fn drop_asserts_all_entries_returned() {
        let mut pool = VioPool::new(1);
        pool.acquire(|_entry| {});
        // pool dropped here with busy_count() == 1
    }
}
