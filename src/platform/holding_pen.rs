// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Holding pen protocol for platforms which can't remove power from a core.
//!
//! Each core owns a 64-bit hold entry. A parked core waits in `wfe` until another core writes
//! `HOLD_STATE_GO` to its entry, and only then rearms the entry with `HOLD_STATE_WAIT`. A release
//! which happens before the core has parked is therefore never lost.

use crate::aarch64::{dsb_sy, sev, wfe};

pub const HOLD_STATE_WAIT: u64 = 0;
pub const HOLD_STATE_GO: u64 = 1;

/// Releases the core parked on `entry`, or the next core to park on it.
///
/// # Safety
///
/// `entry` must be valid for volatile writes and only be accessed through this module.
pub unsafe fn release(entry: *mut u64) {
    // Anything the released core reads, e.g. its entry point, must be visible before GO.
    dsb_sy();
    // SAFETY: The caller guarantees that `entry` is valid.
    unsafe {
        entry.write_volatile(HOLD_STATE_GO);
    }
    dsb_sy();
    sev();
}

/// Waits until `entry` is released, then rearms it for the next wait.
///
/// # Safety
///
/// `entry` must be valid for volatile reads and writes and only be accessed through this module.
pub unsafe fn wait(entry: *mut u64) {
    // SAFETY: The caller guarantees that `entry` is valid.
    while unsafe { entry.read_volatile() } != HOLD_STATE_GO {
        wfe();
    }

    // SAFETY: As above.
    unsafe {
        entry.write_volatile(HOLD_STATE_WAIT);
    }
    dsb_sy();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, AtomicU64, Ordering},
        thread,
    };

    #[test]
    fn release_before_wait_is_not_lost() {
        let mut entry = HOLD_STATE_WAIT;

        // SAFETY: `entry` is a local only used through the holding pen functions.
        unsafe {
            release(&mut entry);
            wait(&mut entry);
        }

        assert_eq!(HOLD_STATE_WAIT, entry);
    }

    #[test]
    fn wait_returns_after_release() {
        let entry = AtomicU64::new(HOLD_STATE_WAIT);
        let released = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                // SAFETY: `entry` outlives the scope and is only used through the holding pen
                // functions.
                unsafe { wait(entry.as_ptr()) };
                assert!(released.load(Ordering::SeqCst));
            });

            released.store(true, Ordering::SeqCst);
            // SAFETY: As above.
            unsafe { release(entry.as_ptr()) };
        });

        assert_eq!(HOLD_STATE_WAIT, entry.load(Ordering::SeqCst));
    }
}
