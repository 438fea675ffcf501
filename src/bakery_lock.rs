// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Lamport's bakery lock.
//!
//! A core entering the critical section takes a ticket one greater than every ticket it can see,
//! then waits for each core holding a smaller ticket (or an equal ticket and a smaller core index)
//! to leave. Only plain loads and stores of per-core slots are used, so the lock works on cores
//! whose caches and MMU are still off after reset, where exclusive load/store pairs can't be relied
//! on.
//!
//! This is not a portable primitive: it depends on every access to the per-core slots being
//! sequentially consistent, and on each participant having a distinct core index. It is not
//! reentrant, and a core must not hold more than one lock unless all cores acquire them in the
//! same order.

use crate::platform::{CoresImpl, Platform, PlatformImpl};
use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};
use percore::Cores;

const CORE_COUNT: usize = PlatformImpl::CORE_COUNT;

/// A mutual exclusion lock with one bakery slot per core.
pub struct BakeryLock<T> {
    /// Set while the corresponding core is choosing its ticket.
    entering: [AtomicBool; CORE_COUNT],
    /// Ticket of the corresponding core, or 0 if it doesn't want the lock.
    number: [AtomicU32; CORE_COUNT],
    data: UnsafeCell<T>,
}

// SAFETY: Access to `data` is only possible through a `BakeryLockGuard`, of which at most one
// exists at a time across all cores, or through `&mut self`.
unsafe impl<T: Send> Sync for BakeryLock<T> {}

impl<T> BakeryLock<T> {
    /// Creates a new unlocked bakery lock protecting the given value.
    pub const fn new(data: T) -> Self {
        Self {
            entering: [const { AtomicBool::new(false) }; CORE_COUNT],
            number: [const { AtomicU32::new(0) }; CORE_COUNT],
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock for the calling core, spinning until it is available.
    pub fn lock(&self) -> BakeryLockGuard<'_, T> {
        let core = CoresImpl::core_index();
        assert!(core < CORE_COUNT);
        debug_assert_eq!(
            self.number[core].load(Ordering::SeqCst),
            0,
            "Bakery lock is already held by core #{core}"
        );

        self.entering[core].store(true, Ordering::SeqCst);
        let ticket = self
            .number
            .iter()
            .map(|number| number.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
            + 1;
        self.number[core].store(ticket, Ordering::SeqCst);
        self.entering[core].store(false, Ordering::SeqCst);

        for other in (0..CORE_COUNT).filter(|&other| other != core) {
            while self.entering[other].load(Ordering::SeqCst) {
                spin_loop();
            }

            loop {
                let other_ticket = self.number[other].load(Ordering::SeqCst);
                if other_ticket == 0 || (other_ticket, other) > (ticket, core) {
                    break;
                }
                spin_loop();
            }
        }

        BakeryLockGuard {
            lock: self,
            core,
            _not_send: PhantomData,
        }
    }

    /// Returns a mutable reference to the protected value without locking.
    ///
    /// The exclusive borrow guarantees that no other core can hold the lock.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Holds a [`BakeryLock`] for the calling core until dropped.
///
/// The guard must be dropped on the core which acquired it.
pub struct BakeryLockGuard<'a, T> {
    lock: &'a BakeryLock<T>,
    core: usize,
    _not_send: PhantomData<*mut ()>,
}

impl<T> Deref for BakeryLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard holding the lock proves that no other reference to the data exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for BakeryLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard holding the lock proves that no other reference to the data exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for BakeryLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.number[self.core].store(0, Ordering::SeqCst);
    }
}
