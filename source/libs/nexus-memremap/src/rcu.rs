// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Read-copy-update cell for hot-path lookups
//! PUBLIC API: RcuCell::new(), RcuCell::read(), RcuCell::update(), RcuCell::reclaim()
//! DEPENDS_ON: parking_lot::Mutex (writer side only)
//! INVARIANTS: Readers never block and never see a half-built value; a
//!             replaced value is freed only after every reader that could
//!             have loaded it has left its critical section; writers never
//!             wait for readers
//!
//! Readers register in one of two counters selected by the epoch parity.
//! A writer swaps in the new value, advances the epoch and parks the old
//! value on a retire list. A retired value is freed once each counter has
//! been seen at zero after its retirement, either by a later writer or by
//! the last reader leaving a counter. A reader that registered under a
//! stale epoch notices the epoch moved and re-registers before touching
//! the pointer.
//!
//! Because writers never wait, a thread may update the cell while it still
//! holds a read guard on it.

use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

struct Retired<T> {
    value: NonNull<T>,
    drained: [bool; 2],
}

/// Shared value replaced wholesale by writers and read without locks.
pub struct RcuCell<T> {
    current: AtomicPtr<T>,
    epoch: AtomicUsize,
    readers: [AtomicUsize; 2],
    // Doubles as the writer lock.
    retired: Mutex<Vec<Retired<T>>>,
    pending: AtomicUsize,
    _owns: PhantomData<Box<T>>,
}

// SAFETY: the cell hands out `&T` to concurrent readers and moves `T`
// between threads on reclamation, the same contract as `Arc<T>`. Retired
// pointers are only touched under `retired`.
unsafe impl<T: Send + Sync> Send for RcuCell<T> {}
// SAFETY: see above; mutation of the pointer is serialized by `retired`.
unsafe impl<T: Send + Sync> Sync for RcuCell<T> {}

impl<T> RcuCell<T> {
    /// Creates a cell publishing `value`.
    pub fn new(value: T) -> Self {
        Self {
            current: AtomicPtr::new(Box::into_raw(Box::new(value))),
            epoch: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            retired: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
            _owns: PhantomData,
        }
    }

    /// Enters a read-side critical section.
    ///
    /// Never blocks; retries only when a writer advanced the epoch between
    /// registration and confirmation.
    pub fn read(&self) -> RcuReadGuard<'_, T> {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let slot = epoch & 1;
            self.readers[slot].fetch_add(1, Ordering::SeqCst);
            if self.epoch.load(Ordering::SeqCst) == epoch {
                let ptr = self.current.load(Ordering::SeqCst);
                // SAFETY: `current` is never null, and the value it points to
                // stays allocated while this reader is counted in `slot`.
                let value = unsafe { NonNull::new_unchecked(ptr) };
                return RcuReadGuard { cell: self, slot, value };
            }
            self.readers[slot].fetch_sub(1, Ordering::SeqCst);
            core::hint::spin_loop();
        }
    }

    /// Replaces the published value with the result of `f`.
    ///
    /// `f` sees the current value and runs under the writer lock, so updates
    /// are totally ordered. When `f` fails or returns `None` nothing is
    /// published. The old value is retired, not waited for.
    pub fn update<E, F>(&self, f: F) -> Result<(), E>
    where
        F: FnOnce(&T) -> Result<Option<T>, E>,
    {
        let mut retired = self.retired.lock();
        let old = self.current.load(Ordering::SeqCst);
        // SAFETY: only writers replace or free values, and we hold the writer lock.
        let next = match f(unsafe { &*old })? {
            Some(next) => next,
            None => return Ok(()),
        };
        self.current.store(Box::into_raw(Box::new(next)), Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        // SAFETY: `current` is never null.
        let value = unsafe { NonNull::new_unchecked(old) };
        retired.push(Retired { value, drained: [false; 2] });
        self.pending.store(retired.len(), Ordering::SeqCst);
        self.reclaim_locked(&mut retired);
        Ok(())
    }

    /// Frees every retired value no reader can still observe.
    pub fn reclaim(&self) {
        let mut retired = self.retired.lock();
        self.reclaim_locked(&mut retired);
    }

    /// Number of replaced values not yet freed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn try_reclaim(&self) {
        // A writer holding the lock reclaims on its own.
        if let Some(mut retired) = self.retired.try_lock() {
            self.reclaim_locked(&mut retired);
        }
    }

    fn reclaim_locked(&self, retired: &mut Vec<Retired<T>>) {
        // Every entry was retired before these loads, so an idle counter
        // proves its readers of that parity are gone.
        let idle = [
            self.readers[0].load(Ordering::SeqCst) == 0,
            self.readers[1].load(Ordering::SeqCst) == 0,
        ];
        retired.retain_mut(|entry| {
            entry.drained[0] |= idle[0];
            entry.drained[1] |= idle[1];
            if entry.drained != [true, true] {
                return true;
            }
            // SAFETY: the pointer came from `Box::into_raw`, is unpublished,
            // and both reader counters drained since it was retired.
            drop(unsafe { Box::from_raw(entry.value.as_ptr()) });
            false
        });
        self.pending.store(retired.len(), Ordering::SeqCst);
    }
}

impl<T: Default> Default for RcuCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Drop for RcuCell<T> {
    fn drop(&mut self) {
        let ptr = *self.current.get_mut();
        // SAFETY: exclusive access; no guard can outlive the borrow of `self`.
        drop(unsafe { Box::from_raw(ptr) });
        for entry in self.retired.get_mut().drain(..) {
            // SAFETY: as above; retired pointers are owned by the cell.
            drop(unsafe { Box::from_raw(entry.value.as_ptr()) });
        }
    }
}

/// Proof of an active read-side critical section.
pub struct RcuReadGuard<'a, T> {
    cell: &'a RcuCell<T>,
    slot: usize,
    value: NonNull<T>,
}

impl<T> Deref for RcuReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the value is pinned by our registration in `slot`.
        unsafe { self.value.as_ref() }
    }
}

impl<T> Drop for RcuReadGuard<'_, T> {
    fn drop(&mut self) {
        let before = self.cell.readers[self.slot].fetch_sub(1, Ordering::SeqCst);
        if before == 1 && self.cell.pending.load(Ordering::SeqCst) != 0 {
            self.cell.try_reclaim();
        }
    }
}
