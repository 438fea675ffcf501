// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

pub mod psci;

use crate::{
    aarch64::flush_dcache_range,
    platform::{Platform, PlatformImpl},
    smccc::{FunctionId, NOT_SUPPORTED, SmcReturn},
};
use core::mem::size_of_val;
use log::info;
use spin::Once;

/// Helper macro to define the range of SMC function ID values covered by a service
macro_rules! owns {
    // service handles the entire Owning Entity Number (OEN)
    ($owning_entity:expr) => {
        #[inline(always)]
        fn owns(&self, function: $crate::smccc::FunctionId) -> bool {
            function.oen() == $owning_entity
                && matches!(
                    function.call_type(),
                    $crate::smccc::SmcccCallType::Fast32 | $crate::smccc::SmcccCallType::Fast64
                )
        }
    };
    // service handles a sub-range of the OEN
    // range refers to the lower 16 bits [15:0] of the SMC FunctionId
    ($owning_entity:expr, $range:expr) => {
        #[inline(always)]
        fn owns(&self, function: $crate::smccc::FunctionId) -> bool {
            function.oen() == $owning_entity
                && $range.contains(&function.number())
                && matches!(
                    function.call_type(),
                    $crate::smccc::SmcccCallType::Fast32 | $crate::smccc::SmcccCallType::Fast64
                )
        }
    };
}
pub(crate) use owns;

/// A service which handles some range of SMC calls.
///
/// According to SMCCC v1.3+ the implementation must disregard the SVE hint bit in the function ID
/// and consider it to be 0 for the purpose of function identification.
pub trait Service {
    /// Returns whether this service is intended to handle the given function ID.
    fn owns(&self, function: FunctionId) -> bool;

    /// Handles the given SMC call from Normal World.
    fn handle_non_secure_smc(&self, _regs: &[u64; 18]) -> SmcReturn {
        NOT_SUPPORTED.into()
    }
}

static SERVICES: Once<Services> = Once::new();

/// Contains an instance of all of the currently implemented services.
pub struct Services {
    /// The PSCI service.
    pub psci: psci::Psci,
}

impl Services {
    /// Creates the global Services instance and writes it back to memory, so that secondary cores
    /// see it even before they turn on their caches.
    ///
    /// Must be called once on the primary core, before any secondary core is released. Later
    /// calls return the existing instance.
    pub fn init() -> &'static Self {
        let mut created = false;
        let services = SERVICES.call_once(|| {
            created = true;
            Self::new()
        });

        if created {
            // The `Once` state and the affinity map inside it are read by cores which just came
            // out of reset.
            flush_dcache_range(&raw const SERVICES as usize, size_of_val(&SERVICES));
            info!("PSCI state initialised");
        }

        services
    }

    /// Returns a reference to the global Services instance.
    ///
    /// Panics if [`Services::init`] has not been called yet.
    pub fn get() -> &'static Self {
        SERVICES.get().expect("Services used before initialisation")
    }

    fn new() -> Self {
        Self {
            psci: psci::Psci::new(
                PlatformImpl::psci_platform().expect("PSCI platform already taken"),
            ),
        }
    }

    /// Dispatches an SMC call from Normal World to the service which owns it.
    ///
    /// `regs` are the general purpose registers x0-x17 of the caller, the result has to be written
    /// back to the caller's registers.
    pub fn handle_smc(&self, regs: &[u64; 18]) -> SmcReturn {
        let mut function = FunctionId(regs[0] as u32);
        function.clear_sve_hint();

        if !function.valid() {
            return NOT_SUPPORTED.into();
        }

        let service: &dyn Service = if self.psci.owns(function) {
            &self.psci
        } else {
            return NOT_SUPPORTED.into();
        };

        service.handle_non_secure_smc(regs)
    }
}
