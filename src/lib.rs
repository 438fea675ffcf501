// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! PSCI power state coordination for RF-A.
//!
//! Builds the affinity topology of the system from the platform's description once at cold boot,
//! and then serialises the power state transitions requested by the normal world through PSCI
//! calls on any core.

#![cfg_attr(not(test), no_std)]

mod aarch64;
mod bakery_lock;
mod debug;
mod logger;
mod platform;
mod services;
mod smccc;

pub use services::{
    Services,
    psci::{Psci, WakeUpReason},
};
pub use smccc::SmcReturn;

use crate::platform::{CoresImpl, Platform, PlatformImpl};
use log::{debug, info};
use percore::Cores;

/// Cold boot setup of the PSCI state on the primary core.
///
/// This must run exactly once, before any secondary core is released from its holding pen.
pub fn psci_cold_boot() -> &'static Services {
    PlatformImpl::init_logger();
    info!("RF-A PSCI setup on core #{}", CoresImpl::core_index());
    Services::init()
}

/// Warm boot entry for a core which has been powered on or has woken up from a power down suspend.
///
/// Returns the non-secure entry point the core should continue at.
pub fn psci_warm_boot() -> WakeUpReason {
    debug!("Warmboot on core #{}", CoresImpl::core_index());
    Services::get().psci.handle_cpu_boot()
}
