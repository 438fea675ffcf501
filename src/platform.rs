// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

macro_rules! select_platform {
    (platform = $condition:literal, $mod:ident::$plat_impl:ident) => {
        #[cfg(all(platform = $condition, not(test)))]
        mod $mod;

        #[cfg(all(platform = $condition, not(test)))]
        pub use $mod::$plat_impl as PlatformImpl;
    };
    (test, $mod:ident::$plat_impl:ident) => {
        #[cfg(test)]
        mod $mod;

        #[cfg(test)]
        pub use $mod::$plat_impl as PlatformImpl;
    };
}

mod holding_pen;

select_platform!(platform = "qemu", qemu::Qemu);
select_platform!(test, test::TestPlatform);

#[cfg(test)]
pub use test::{FakeTopology, TestPlatform, TestPsciPlatformImpl};

use crate::{
    logger::LogSink,
    services::psci::{AffinityId, PsciPlatformInterface},
};
use percore::Cores;

/// Type alias for convenience, to avoid having to use the complicated type name everywhere.
pub type LogSinkImpl = <PlatformImpl as Platform>::LogSinkImpl;

/// The PSCI implementation of the selected platform.
pub type PsciPlatformImpl = <PlatformImpl as Platform>::PsciPlatformImpl;

/// The hooks implemented by all platforms.
///
/// # Safety
///
/// `core_position` must never return the same index for two different valid MPIDR values, and
/// must never return a value greater than or equal to `CORE_COUNT` for a valid MPIDR value.
/// `current_mpidr` must return the affinity of the core it runs on.
pub unsafe trait Platform {
    /// The number of CPU cores.
    const CORE_COUNT: usize;

    /// Platform dependent LogSink implementation type for Logger.
    type LogSinkImpl: LogSink;

    /// Platform dependent PsciPlatformInterface implementation type.
    type PsciPlatformImpl: PsciPlatformInterface;

    /// Initialises the logger and anything else the platform needs before PSCI setup.
    ///
    /// Any logs sent before this is called will be ignored.
    fn init_logger();

    /// Returns the affinity of the calling core.
    fn current_mpidr() -> AffinityId;

    /// Returns whether the given MPIDR is valid for this platform.
    fn mpidr_is_valid(mpidr: AffinityId) -> bool;

    /// Given a valid MPIDR value, returns the corresponding linear core index.
    fn core_position(mpidr: AffinityId) -> usize;

    /// Returns an option with a PSCI platform implementation handle, i.e. the set of power
    /// management operations. The function should only be called once, when it returns `Some`.
    /// All subsequent calls must return `None`.
    fn psci_platform() -> Option<Self::PsciPlatformImpl>;
}

/// Implementation of the `Cores` trait to get the index of the current CPU core.
pub struct CoresImpl;

// SAFETY: This implementation never returns the same index for different cores because
// `core_position` is guaranteed not to.
unsafe impl Cores for CoresImpl {
    fn core_index() -> usize {
        PlatformImpl::core_position(PlatformImpl::current_mpidr())
    }
}

/// Returns the corresponding linear core index for the given MPIDR value.
///
/// For any valid MPIDR this will return a unique value less than `Platform::CORE_COUNT`.
/// For any invalid MPIDR it will return `None`.
pub fn try_get_cpu_index_by_mpidr(mpidr: AffinityId) -> Option<usize> {
    if PlatformImpl::mpidr_is_valid(mpidr) {
        Some(PlatformImpl::core_position(mpidr))
    } else {
        None
    }
}
