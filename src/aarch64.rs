// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Wrappers for the AArch64 instructions used by power management.
//!
//! On other architectures these compile to host equivalents so that the library and its unit tests
//! can be built on a development machine.

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Data synchronisation barrier, full system.
pub fn dsb_sy() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: `dsb sy` only orders memory accesses.
    unsafe {
        asm!("dsb sy", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Waits for an interrupt.
pub fn wfi() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: `wfi` has no effect on memory.
    unsafe {
        asm!("wfi", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::hint::spin_loop();
}

/// Waits for an event.
pub fn wfe() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: `wfe` has no effect on memory.
    unsafe {
        asm!("wfe", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::hint::spin_loop();
}

/// Sends an event to all cores, waking any which are waiting in `wfe`.
pub fn sev() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: `sev` has no effect on memory.
    unsafe {
        asm!("sev", options(nomem, nostack, preserves_flags));
    }
}

/// Every `(addr, size)` passed to [`flush_dcache_range`] by unit tests.
#[cfg(test)]
pub static FLUSHED_RANGES: std::sync::Mutex<Vec<(usize, usize)>> =
    std::sync::Mutex::new(Vec::new());

/// Cleans and invalidates the data cache lines covering `size` bytes starting at `addr`, to the
/// point of coherency.
///
/// This makes data written with the caches on visible to cores which still run with their caches
/// and MMU off.
pub fn flush_dcache_range(addr: usize, size: usize) {
    #[cfg(test)]
    FLUSHED_RANGES.lock().unwrap().push((addr, size));

    #[cfg(target_arch = "aarch64")]
    {
        let ctr_el0: u64;
        // SAFETY: Reading CTR_EL0 has no side effects.
        unsafe {
            asm!("mrs {}, ctr_el0", out(reg) ctr_el0, options(nomem, nostack, preserves_flags));
        }
        // DminLine is log2 of the number of words in the smallest data cache line.
        let line_size = 4 << ((ctr_el0 >> 16) & 0xf);
        let end = addr + size;
        let mut line = addr & !(line_size - 1);
        while line < end {
            // SAFETY: Cleaning and invalidating a cache line doesn't change the contents of memory
            // as observed by this program.
            unsafe {
                asm!("dc civac, {}", in(reg) line, options(nostack, preserves_flags));
            }
            line += line_size;
        }
        dsb_sy();
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (addr, size);
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// Returns the MPIDR_EL1 of the calling core.
#[cfg_attr(test, allow(unused))]
pub fn read_mpidr() -> u64 {
    #[cfg(target_arch = "aarch64")]
    {
        arm_sysregs::read_mpidr_el1().bits()
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        0
    }
}

/// Returns whether an interrupt is pending on the calling core.
pub fn has_pending_interrupt() -> bool {
    #[cfg(target_arch = "aarch64")]
    {
        arm_sysregs::read_isr_el1() != 0
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        false
    }
}
