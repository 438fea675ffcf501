// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

mod affinity_map;
mod topology;

pub use affinity_map::{AffinityMap, CoreEntryInfo, LockedChain, NodePowerState};
#[cfg(test)]
pub use topology::MAX_AFFINITY_LEVEL;
pub use topology::{AffinityId, Presence, TopologyDescriptor};

use crate::{
    aarch64::{dsb_sy, has_pending_interrupt, wfi},
    platform::{Platform, PlatformImpl, PsciPlatformImpl},
    services::{Service, owns},
    smccc::{FunctionId as SmcFunctionId, OwningEntityNumber, SmcReturn},
};
use arm_psci::{
    AffinityInfo, EntryPoint, ErrorCode, FeatureFlagsCpuSuspend, Function, FunctionId,
    MigrateInfoType, Mpidr, PowerState, PsciFeature, Version,
};
use bitflags::bitflags;
use core::fmt::{self, Debug, Formatter};
use log::{debug, info, trace, warn};

const FUNCTION_NUMBER_MIN: u16 = 0x0000;
const FUNCTION_NUMBER_MAX: u16 = 0x001F;

bitflags! {
    /// Optional platform feature flags
    #[derive(Debug, Eq, PartialEq, Clone, Copy)]
    #[repr(transparent)]
    pub struct PsciPlatformOptionalFeatures: u64 {
        /// The platform can turn off the whole system.
        const SYSTEM_OFF = 1 << 0;
        /// The platform can reset the whole system.
        const SYSTEM_RESET = 1 << 1;
    }
}

/// Kind of low power state requested by `CPU_SUSPEND`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SuspendType {
    /// The core keeps its context and continues after the suspend call on wake-up.
    StandbyOrRetention,
    /// The core loses its context and restarts at the given entry point on wake-up.
    PowerDown,
}

/// A `CPU_SUSPEND` power state accepted by the platform.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SuspendRequest {
    /// Standby or power down.
    pub suspend_type: SuspendType,
    /// Highest affinity level affected by the suspend.
    pub target_level: usize,
    /// Platform specific state id from the power state parameter.
    pub state_id: u32,
}

/// Affinity instances affected by a power transition of a core, passed to the platform hooks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PowerTransition {
    /// The core which changes state.
    pub mpidr: AffinityId,
    /// The highest level, counting up from the core, which is physically off. On the way down
    /// this is the level the platform has to power off, on the way up it is the level which was
    /// off before the core woke up.
    pub max_off_level: usize,
    /// The suspend request, for transitions into or out of a suspend state.
    pub suspend: Option<SuspendRequest>,
}

/// PSCI platform interface
///
/// The platform describes its topology through the [`TopologyDescriptor`] supertrait and performs
/// the physical power transitions requested by the coordinator. Whether the platform implements
/// the optional functions has to be in sync with the reported optional features in the `FEATURES`
/// constant.
pub trait PsciPlatformInterface: TopologyDescriptor {
    /// Count of all affinity instances on all levels
    const POWER_DOMAIN_COUNT: usize;

    /// Flags for describing optional features implemented by the platform.
    const FEATURES: PsciPlatformOptionalFeatures;

    /// Tries to convert a PSCI power state parameter into a suspend request.
    fn try_parse_power_state(power_state: PowerState) -> Option<SuspendRequest>;

    /// Places the current core into standby state and continues execution on interrupt.
    fn cpu_standby(&self, request: &SuspendRequest);

    /// Turns on the core identified by its MPIDR. The core must start at the warm boot entry
    /// point of the firmware.
    fn power_domain_on(&self, mpidr: Mpidr) -> Result<(), ErrorCode>;

    /// Prepares the core and the ancestors up to `transition.max_off_level` for turning off.
    fn power_domain_off(&self, transition: &PowerTransition);

    /// Prepares the core and the ancestors up to `transition.max_off_level` for a power down
    /// suspend.
    fn power_domain_suspend(&self, transition: &PowerTransition);

    /// Platform-specific function for entering WFI on power down, optional.
    fn power_domain_power_down_wfi(&self, _transition: &PowerTransition) -> ! {
        dsb_sy();
        loop {
            wfi();
        }
    }

    /// Performs platform-specific actions after the core has been turned on.
    fn power_domain_on_finish(&self, transition: &PowerTransition);

    /// Performs platform-specific actions after the core has woken up from a power down suspend.
    fn power_domain_suspend_finish(&self, transition: &PowerTransition);

    /// Shuts down the system, optional.
    fn system_off(&self) -> ! {
        unimplemented!("SYSTEM_OFF is not implemented for the platform")
    }

    /// Resets the system, optional.
    fn system_reset(&self) -> ! {
        unimplemented!("SYSTEM_RESET is not implemented for the platform")
    }

    /// Validates a non-secure entry point, optional.
    fn is_valid_ns_entrypoint(&self, _entry: &EntryPoint) -> bool {
        true
    }

    /// Checks if the core has pending interrupts
    fn has_pending_interrupts(&self) -> bool {
        has_pending_interrupt()
    }
}

/// Why a core entered the firmware through the warm boot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeUpReason {
    /// The core was turned on by `CPU_ON`, and continues at the given entry point.
    CpuOn(EntryPoint),
    /// The core woke up from a power down `CPU_SUSPEND`, and continues at the given entry point.
    SuspendFinished(EntryPoint),
}

/// The PSCI service, coordinating the power state of every affinity instance.
pub struct Psci {
    platform: PsciPlatformImpl,
    map: AffinityMap,
}

impl Psci {
    /// Builds the affinity map of the platform and marks the calling core and its ancestors as
    /// running.
    pub fn new(platform: PsciPlatformImpl) -> Self {
        let mut map = AffinityMap::build(&platform);
        let boot_core = PlatformImpl::current_mpidr();
        map.mark_boot_chain_on(boot_core);

        info!(
            "PSCI: {} cores, {} affinity levels, boot core {boot_core}",
            map.core_count(),
            map.max_level() + 1
        );
        trace!("{map:?}");

        Self { platform, map }
    }

    /// Locks the chain of `mpidr` up to `end_level`, which must exist.
    fn locked_chain(&self, mpidr: AffinityId, end_level: usize) -> LockedChain<'_> {
        self.map
            .chain(mpidr, end_level)
            .unwrap_or_else(|| panic!("Core {mpidr} is not in the affinity map"))
            .lock()
    }

    fn max_off_level(chain: &LockedChain) -> usize {
        chain
            .max_phys_off_level()
            .expect("Core in a low power state is physically on")
    }

    /// Handles `CPU_ON` PSCI call by turning on the core identified by the given `target_cpu`
    /// MPIDR. The caller has to provide a valid non-secure entry point for the core.
    fn cpu_on(&self, target_cpu: Mpidr, entry: EntryPoint) -> Result<(), ErrorCode> {
        if !self.platform.is_valid_ns_entrypoint(&entry) {
            return Err(ErrorCode::InvalidAddress);
        }

        let target = AffinityId::from(target_cpu);
        let core = self.map.find(target, 0).ok_or(ErrorCode::InvalidParameters)?;
        if !core.is_present() {
            warn!("CPU_ON of absent core {target}");
            return Err(ErrorCode::NotPresent);
        }

        let mut chain = self.locked_chain(target, 0);
        match chain.core_state() {
            NodePowerState::On | NodePowerState::Suspend => return Err(ErrorCode::AlreadyOn),
            NodePowerState::OnPending => return Err(ErrorCode::OnPending),
            // The core was off, so continue CPU on operation.
            NodePowerState::Off => {}
        }

        *chain.entry_info_mut() = CoreEntryInfo {
            entry_point: Some(entry),
            suspend: None,
        };
        chain.set_state(NodePowerState::OnPending);

        match self.platform.power_domain_on(target_cpu) {
            Ok(()) => {
                debug!("CPU_ON {target} pending");
                Ok(())
            }
            Err(error) => {
                warn!("Failed to power on core {target}: {error:?}");
                *chain.entry_info_mut() = CoreEntryInfo::EMPTY;
                chain.set_state(NodePowerState::Off);
                Err(error)
            }
        }
    }

    /// This function must be called when a core is powered up. It finishes the pending `CPU_ON`
    /// or power down `CPU_SUSPEND` of the core, and returns the non-secure entry point and the
    /// reason why the core was powered up.
    pub fn handle_cpu_boot(&self) -> WakeUpReason {
        let mpidr = PlatformImpl::current_mpidr();

        // Only this core can move its node out of these states, so the level stays valid after
        // the lock is released.
        let end_level = {
            let chain = self.locked_chain(mpidr, 0);
            match chain.core_state() {
                NodePowerState::OnPending => self.map.max_level(),
                NodePowerState::Suspend => {
                    let suspend = chain.entry_info().suspend;
                    drop(chain);
                    suspend
                        .expect("Suspended core without a suspend request")
                        .target_level
                }
                state => {
                    drop(chain);
                    panic!("Unexpected power state {state:?} of booting core {mpidr}");
                }
            }
        };

        let mut chain = self.locked_chain(mpidr, end_level);
        let state = chain.core_state();
        let transition = PowerTransition {
            mpidr,
            max_off_level: Self::max_off_level(&chain),
            suspend: chain.entry_info().suspend,
        };

        let reason: fn(EntryPoint) -> WakeUpReason = if state == NodePowerState::OnPending {
            self.platform.power_domain_on_finish(&transition);
            WakeUpReason::CpuOn
        } else {
            self.platform.power_domain_suspend_finish(&transition);
            WakeUpReason::SuspendFinished
        };
        chain.set_state(NodePowerState::On);

        let entry_info = core::mem::replace(chain.entry_info_mut(), CoreEntryInfo::EMPTY);
        let core_index = chain.core().core_index();
        drop(chain); // Unlock before possible panic

        debug!(
            "Core {mpidr} (slot {core_index:?}) is on, was off up to level {}",
            transition.max_off_level
        );
        let entry_point = entry_info.entry_point;
        reason(entry_point.expect("Entry point not set for booting core"))
    }

    /// Handles `CPU_OFF` PSCI call.
    /// On success, turns off the current core and does not return.
    fn cpu_off(&self) -> Result<(), ErrorCode> {
        let mpidr = PlatformImpl::current_mpidr();
        let mut chain = self.locked_chain(mpidr, self.map.max_level());

        if chain.core_state() != NodePowerState::On {
            return Err(ErrorCode::Denied);
        }

        chain.set_state(NodePowerState::Off);
        let transition = PowerTransition {
            mpidr,
            max_off_level: Self::max_off_level(&chain),
            suspend: None,
        };
        self.platform.power_domain_off(&transition);

        // Unlock the chain before actually turning off the core
        drop(chain);

        debug!("CPU_OFF {mpidr} up to level {}", transition.max_off_level);
        self.platform.power_domain_power_down_wfi(&transition);
        // Does not return
    }

    /// Handles `CPU_SUSPEND` PSCI call.
    ///
    /// A standby request only affects the calling core, it waits for an interrupt in
    /// `cpu_standby` and returns. A power down request doesn't return on success, the core
    /// continues at `entry` through `handle_cpu_boot` when it wakes up.
    fn cpu_suspend(&self, power_state: PowerState, entry: EntryPoint) -> Result<(), ErrorCode> {
        let request = PsciPlatformImpl::try_parse_power_state(power_state)
            .ok_or(ErrorCode::InvalidParameters)?;

        if request.target_level > self.map.max_level() {
            return Err(ErrorCode::InvalidParameters);
        }

        match request.suspend_type {
            SuspendType::StandbyOrRetention => {
                if request.target_level != 0 {
                    return Err(ErrorCode::InvalidParameters);
                }

                // Continues execution after an interrupt woke up the core.
                self.platform.cpu_standby(&request);
                Ok(())
            }
            SuspendType::PowerDown => self.cpu_suspend_power_down(request, entry),
        }
    }

    fn cpu_suspend_power_down(
        &self,
        request: SuspendRequest,
        entry: EntryPoint,
    ) -> Result<(), ErrorCode> {
        if !self.platform.is_valid_ns_entrypoint(&entry) {
            return Err(ErrorCode::InvalidAddress);
        }

        let mpidr = PlatformImpl::current_mpidr();
        let mut chain = self.locked_chain(mpidr, request.target_level);
        assert_eq!(chain.core_state(), NodePowerState::On);

        if self.platform.has_pending_interrupts() {
            // Has pending interrupts, do not suspend
            return Ok(());
        }

        chain.set_state(NodePowerState::Suspend);
        *chain.entry_info_mut() = CoreEntryInfo {
            entry_point: Some(entry),
            suspend: Some(request),
        };

        let transition = PowerTransition {
            mpidr,
            max_off_level: Self::max_off_level(&chain),
            suspend: Some(request),
        };
        self.platform.power_domain_suspend(&transition);

        // Unlock the chain before entering suspend state
        drop(chain);

        debug!(
            "CPU_SUSPEND {mpidr} to level {}, state {:#x}",
            request.target_level, request.state_id
        );
        self.platform.power_domain_power_down_wfi(&transition);
        // Does not return
    }

    /// Handles `AFFINITY_INFO` PSCI call.
    fn affinity_info(
        &self,
        target_affinity: Mpidr,
        lowest_affinity_level: u32,
    ) -> Result<AffinityInfo, ErrorCode> {
        let level = lowest_affinity_level as usize;
        if level > self.map.max_level() {
            return Err(ErrorCode::InvalidParameters);
        }

        let node = self
            .map
            .find(target_affinity.into(), level)
            .filter(|node| node.is_present())
            .ok_or(ErrorCode::InvalidParameters)?;

        Ok(match node.state() {
            NodePowerState::On | NodePowerState::Suspend => AffinityInfo::On,
            NodePowerState::OnPending => AffinityInfo::OnPending,
            NodePowerState::Off => AffinityInfo::Off,
        })
    }

    /// Handles `SYSTEM_OFF` PSCI call.
    /// Turns off the system and does not return on success.
    fn system_off(&self) -> Result<(), ErrorCode> {
        if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::SYSTEM_OFF) {
            return Err(ErrorCode::NotSupported);
        }

        info!("SYSTEM_OFF");
        self.platform.system_off()
    }

    /// Handles `SYSTEM_RESET` PSCI call.
    /// Resets the system and does not return on success.
    fn system_reset(&self) -> Result<(), ErrorCode> {
        if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::SYSTEM_RESET) {
            return Err(ErrorCode::NotSupported);
        }

        info!("SYSTEM_RESET");
        self.platform.system_reset()
    }

    /// Handles `PSCI_FEATURES` PSCI call.
    fn handle_features(&self, feature: PsciFeature) -> Result<u64, ErrorCode> {
        const SUCCESS: u64 = 0;

        let check_optional_feature = |feature| {
            if PsciPlatformImpl::FEATURES.contains(feature) {
                Ok(SUCCESS)
            } else {
                Err(ErrorCode::NotSupported)
            }
        };

        match feature {
            PsciFeature::PsciFunction(function_id) => match function_id {
                FunctionId::PsciVersion
                | FunctionId::CpuOff
                | FunctionId::CpuOn32
                | FunctionId::CpuOn64
                | FunctionId::AffinityInfo32
                | FunctionId::AffinityInfo64
                | FunctionId::MigrateInfoType
                | FunctionId::PsciFeatures => Ok(SUCCESS),

                FunctionId::CpuSuspend32 | FunctionId::CpuSuspend64 => {
                    Ok(u32::from(FeatureFlagsCpuSuspend::EXTENDED_POWER_STATE).into())
                }

                FunctionId::SystemOff => {
                    check_optional_feature(PsciPlatformOptionalFeatures::SYSTEM_OFF)
                }
                FunctionId::SystemReset => {
                    check_optional_feature(PsciPlatformOptionalFeatures::SYSTEM_RESET)
                }

                _ => Err(ErrorCode::NotSupported),
            },
            PsciFeature::SmcccVersion => Ok(SUCCESS),
        }
    }

    fn handle_smc_inner(&self, regs: &[u64; 4]) -> Result<u64, ErrorCode> {
        const SUCCESS: u64 = 0;
        let function = Function::try_from(regs)?;

        match function {
            Function::Version => {
                let version = Version { major: 1, minor: 1 };
                Ok(u32::from(version).into())
            }
            Function::CpuSuspend { state, entry } => {
                self.cpu_suspend(state, entry)?;
                Ok(SUCCESS)
            }
            Function::CpuOff => {
                self.cpu_off()?;
                Ok(SUCCESS)
            }
            Function::CpuOn { target_cpu, entry } => {
                self.cpu_on(target_cpu, entry)?;
                Ok(SUCCESS)
            }
            Function::AffinityInfo {
                mpidr,
                lowest_affinity_level,
            } => {
                let affinity_info = self.affinity_info(mpidr, lowest_affinity_level)?;
                Ok(u32::from(affinity_info).into())
            }
            Function::MigrateInfoType => {
                Ok(u32::from(MigrateInfoType::MigrationNotRequired).into())
            }
            Function::SystemOff => {
                self.system_off()?;
                Ok(SUCCESS)
            }
            Function::SystemReset => {
                self.system_reset()?;
                Ok(SUCCESS)
            }
            Function::Features { psci_func_id } => self.handle_features(psci_func_id),
            _ => Err(ErrorCode::NotSupported),
        }
    }
}

impl Service for Psci {
    owns!(
        OwningEntityNumber::STANDARD_SECURE,
        FUNCTION_NUMBER_MIN..=FUNCTION_NUMBER_MAX
    );

    fn handle_non_secure_smc(&self, regs: &[u64; 18]) -> SmcReturn {
        let mut function = SmcFunctionId(regs[0] as u32);
        function.clear_sve_hint();
        let in_regs = [function.0.into(), regs[1], regs[2], regs[3]];

        let result: u64 = match self.handle_smc_inner(&in_regs) {
            Ok(result) => result,
            Err(error_code) => {
                debug!("PSCI call {function} failed: {error_code:?}");
                error_code.into()
            }
        };

        result.into()
    }
}

impl Debug for Psci {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.map.fmt(f)
    }
}
