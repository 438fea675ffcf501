// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::{Platform, holding_pen, try_get_cpu_index_by_mpidr};
use crate::{
    aarch64::{dsb_sy, read_mpidr, wfi},
    logger::{self, LockedWriter},
    services::psci::{
        AffinityId, PowerTransition, Presence, PsciPlatformInterface, PsciPlatformOptionalFeatures,
        SuspendRequest, SuspendType, TopologyDescriptor,
    },
};
use arm_pl011_uart::{PL011Registers, Uart, UniqueMmioPointer};
use arm_psci::{EntryPoint, ErrorCode, Mpidr, PowerState};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};
use log::debug;

const SEC_SRAM_BASE: usize = 0x0e00_0000;
const SHARED_RAM_BASE: usize = SEC_SRAM_BASE;

/// Base address of the trusted mailbox.
/// The mailbox has a storage buffer at its base, and a doorbell for each CPU.
const TRUSTED_MAILBOX_BASE: usize = SHARED_RAM_BASE;
/// Location to which to write the address that secondary cores should jump to after being released
/// from their holding pens.
const HOLD_ENTRYPOINT: *mut unsafe extern "C" fn() = TRUSTED_MAILBOX_BASE as _;
/// Base address of hold entries for secondary cores. Writing `holding_pen::HOLD_STATE_GO` to the
/// entry for a secondary core will cause it to be released from its holding pen and jump to
/// `*HOLD_ENTRYPOINT`.
const HOLD_BASE: usize = TRUSTED_MAILBOX_BASE + 8;

/// Base address of the secure world PL011 UART, aka. UART1.
const UART1_BASE: usize = 0x0904_0000;
const PL011_BASE_ADDRESS: *mut PL011Registers = UART1_BASE as _;

/// Normal world DRAM, where non-secure entry points must be.
const NS_DRAM_BASE: u64 = 0x4000_0000;
const NS_DRAM_SIZE: u64 = 0xc000_0000;

/// The number of CPU clusters.
const CLUSTER_COUNT: usize = 1;
const PLATFORM_CPU_PER_CLUSTER_SHIFT: usize = 2;
/// The maximum number of CPUs in each cluster.
const MAX_CPUS_PER_CLUSTER: usize = 1 << PLATFORM_CPU_PER_CLUSTER_SHIFT;
/// Cores are at level 0 and clusters at level 1.
const MAX_AFFINITY_LEVEL: usize = 1;

/// Local power state ids of a level, packed into the state id of the power state parameter with
/// 4 bits per level.
const LOCAL_STATE_RETENTION: u32 = 0x1;
const LOCAL_STATE_CORE_OFF: u32 = 0x2;
const LOCAL_STATE_CLUSTER_OFF: u32 = 0x22;

/// The aarch64 'virt' machine of the QEMU emulator.
pub struct Qemu;

// SAFETY: `core_position` returns a unique index below `CORE_COUNT` for each valid MPIDR, as long
// as `PLATFORM_CPU_PER_CLUSTER_SHIFT` is correct.
unsafe impl Platform for Qemu {
    const CORE_COUNT: usize = CLUSTER_COUNT * MAX_CPUS_PER_CLUSTER;

    type LogSinkImpl = LockedWriter<Uart<'static>>;
    type PsciPlatformImpl = QemuPsciPlatformImpl;

    fn init_logger() {
        // SAFETY: `PL011_BASE_ADDRESS` is the base address of a PL011 device, and nothing else
        // accesses that address range.
        let uart_pointer =
            unsafe { UniqueMmioPointer::new(NonNull::new(PL011_BASE_ADDRESS).unwrap()) };
        logger::init(LockedWriter::new(Uart::new(uart_pointer)))
            .expect("Failed to initialise logger");
    }

    fn current_mpidr() -> AffinityId {
        AffinityId::from_bits(read_mpidr())
    }

    fn mpidr_is_valid(mpidr: AffinityId) -> bool {
        mpidr.aff3() == 0
            && mpidr.aff2() == 0
            && usize::from(mpidr.aff1()) < CLUSTER_COUNT
            && usize::from(mpidr.aff0()) < MAX_CPUS_PER_CLUSTER
    }

    fn core_position(mpidr: AffinityId) -> usize {
        (usize::from(mpidr.aff1()) << PLATFORM_CPU_PER_CLUSTER_SHIFT) + usize::from(mpidr.aff0())
    }

    fn psci_platform() -> Option<Self::PsciPlatformImpl> {
        static TAKEN: AtomicBool = AtomicBool::new(false);

        if TAKEN.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(QemuPsciPlatformImpl)
        }
    }
}

/// Returns the holding pen entry of the given core.
fn hold_entry(cpu_index: usize) -> *mut u64 {
    debug_assert!(cpu_index < Qemu::CORE_COUNT);
    (HOLD_BASE as *mut u64).wrapping_add(cpu_index)
}

pub struct QemuPsciPlatformImpl;

impl TopologyDescriptor for QemuPsciPlatformImpl {
    fn max_affinity_level(&self) -> usize {
        MAX_AFFINITY_LEVEL
    }

    fn affinity_instance_count(&self, level: usize, _parent: AffinityId) -> usize {
        match level {
            0 => MAX_CPUS_PER_CLUSTER,
            1 => CLUSTER_COUNT,
            _ => 0,
        }
    }

    fn affinity_presence(&self, _level: usize, _id: AffinityId) -> Presence {
        Presence::Present
    }
}

impl PsciPlatformInterface for QemuPsciPlatformImpl {
    const POWER_DOMAIN_COUNT: usize = CLUSTER_COUNT * (MAX_CPUS_PER_CLUSTER + 1);

    const FEATURES: PsciPlatformOptionalFeatures = PsciPlatformOptionalFeatures::empty();

    fn try_parse_power_state(power_state: PowerState) -> Option<SuspendRequest> {
        let (suspend_type, target_level, state_id) = match power_state {
            PowerState::StandbyOrRetention(LOCAL_STATE_RETENTION) => {
                (SuspendType::StandbyOrRetention, 0, LOCAL_STATE_RETENTION)
            }
            PowerState::PowerDown(LOCAL_STATE_CORE_OFF) => {
                (SuspendType::PowerDown, 0, LOCAL_STATE_CORE_OFF)
            }
            PowerState::PowerDown(LOCAL_STATE_CLUSTER_OFF) => {
                (SuspendType::PowerDown, 1, LOCAL_STATE_CLUSTER_OFF)
            }
            _ => return None,
        };

        Some(SuspendRequest {
            suspend_type,
            target_level,
            state_id,
        })
    }

    fn cpu_standby(&self, request: &SuspendRequest) {
        assert_eq!(request.suspend_type, SuspendType::StandbyOrRetention);

        dsb_sy();
        wfi();
    }

    fn power_domain_on(&self, mpidr: Mpidr) -> Result<(), ErrorCode> {
        let cpu_index =
            try_get_cpu_index_by_mpidr(mpidr.into()).ok_or(ErrorCode::InvalidParameters)?;
        // SAFETY: HOLD_ENTRYPOINT and the hold entry of a valid core are within the trusted
        // mailbox, which is only used by the holding pen.
        unsafe {
            HOLD_ENTRYPOINT.write_volatile(bl31_warm_entrypoint);
            holding_pen::release(hold_entry(cpu_index));
        }
        Ok(())
    }

    fn power_domain_off(&self, transition: &PowerTransition) {
        debug!(
            "QEMU: core {} off up to level {}",
            transition.mpidr, transition.max_off_level
        );
    }

    fn power_domain_suspend(&self, transition: &PowerTransition) {
        debug!(
            "QEMU: core {} suspend up to level {}",
            transition.mpidr, transition.max_off_level
        );
    }

    fn power_domain_power_down_wfi(&self, transition: &PowerTransition) -> ! {
        let hold = hold_entry(Qemu::core_position(transition.mpidr));

        // QEMU can't remove power from a core, so park it in the holding pen until another core
        // releases it with `power_domain_on`. A release which raced ahead of this is kept.
        // SAFETY: The hold entry of a valid core is within the trusted mailbox, which is only used
        // by the holding pen.
        unsafe {
            holding_pen::wait(hold);
        }

        // SAFETY: The core which released this one wrote the warm boot entry point of the firmware
        // to the mailbox before setting the hold entry.
        unsafe {
            let entry_point = HOLD_ENTRYPOINT.read_volatile();
            entry_point();
        }
        panic!("Warm boot entry point returned");
    }

    fn power_domain_on_finish(&self, transition: &PowerTransition) {
        debug!(
            "QEMU: core {} on, was off up to level {}",
            transition.mpidr, transition.max_off_level
        );
    }

    fn power_domain_suspend_finish(&self, transition: &PowerTransition) {
        debug!(
            "QEMU: core {} resumed, was off up to level {}",
            transition.mpidr, transition.max_off_level
        );
    }

    fn is_valid_ns_entrypoint(&self, entry: &EntryPoint) -> bool {
        (NS_DRAM_BASE..NS_DRAM_BASE + NS_DRAM_SIZE).contains(&entry.entry_point_address())
    }
}

unsafe extern "C" {
    /// Warm boot entry point of the firmware image. It sets up the core and calls
    /// `psci_warm_boot`.
    unsafe fn bl31_warm_entrypoint();
}
