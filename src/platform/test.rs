// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::Platform;
use crate::{
    logger::{self, LogSink},
    services::psci::{
        AffinityId, MAX_AFFINITY_LEVEL, PowerTransition, Presence, PsciPlatformInterface,
        PsciPlatformOptionalFeatures, SuspendRequest, SuspendType, TopologyDescriptor,
    },
};
use arm_psci::{ErrorCode, Mpidr, PowerState};
use std::{
    cell::Cell,
    fmt,
    io::{Write, stdout},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

/// Number of Aff1 values with a core slot.
const CLUSTER_SLOTS: usize = 4;
/// Number of Aff0 values with a core slot in each cluster.
const CORES_PER_CLUSTER_SLOTS: usize = 4;

thread_local! {
    static CURRENT_MPIDR: Cell<AffinityId> =
        const { Cell::new(AffinityId::from_aff3210(0, 0, 0, 0)) };
}

/// A fake platform for unit tests.
///
/// Each test thread acts as one core; the core it impersonates is set with
/// [`TestPlatform::set_current_core`] and defaults to 0.0.0.0.
pub struct TestPlatform;

impl TestPlatform {
    /// Makes the calling thread act as the core with the given affinity.
    pub fn set_current_core(mpidr: AffinityId) {
        assert!(Self::mpidr_is_valid(mpidr));
        CURRENT_MPIDR.with(|current| current.set(mpidr));
    }
}

// SAFETY: The test platform is only used in unit tests, where each thread impersonates a single
// core.
// `core_position` maps each valid MPIDR to a distinct slot below `CORE_COUNT`.
unsafe impl Platform for TestPlatform {
    const CORE_COUNT: usize = CLUSTER_SLOTS * CORES_PER_CLUSTER_SLOTS;

    type LogSinkImpl = StdOutSink;
    type PsciPlatformImpl = TestPsciPlatformImpl;

    fn init_logger() {
        // Several tests may initialise the logger, only the first one succeeds.
        let _ = logger::init(StdOutSink);
    }

    fn current_mpidr() -> AffinityId {
        CURRENT_MPIDR.with(Cell::get)
    }

    fn mpidr_is_valid(mpidr: AffinityId) -> bool {
        mpidr.aff3() == 0
            && mpidr.aff2() == 0
            && usize::from(mpidr.aff1()) < CLUSTER_SLOTS
            && usize::from(mpidr.aff0()) < CORES_PER_CLUSTER_SLOTS
    }

    fn core_position(mpidr: AffinityId) -> usize {
        assert!(TestPlatform::mpidr_is_valid(mpidr));

        usize::from(mpidr.aff1()) * CORES_PER_CLUSTER_SLOTS + usize::from(mpidr.aff0())
    }

    fn psci_platform() -> Option<Self::PsciPlatformImpl> {
        Some(TestPsciPlatformImpl::new(FakeTopology::new(&[2, 4])))
    }
}

/// A log sink for tests which writes logs to standard output.
pub struct StdOutSink;

impl LogSink for StdOutSink {
    fn write_fmt(&self, args: fmt::Arguments) {
        stdout().write_fmt(args).unwrap();
    }
}

/// A topology description which can be shaped by each test.
#[derive(Clone, Debug)]
pub struct FakeTopology {
    max_level: usize,
    /// Default number of children of each instance, indexed by the level of the children.
    arity: [usize; MAX_AFFINITY_LEVEL + 1],
    /// `(level, parent, count)` entries overriding `arity` for a single parent.
    overrides: Vec<(usize, AffinityId, usize)>,
    /// `(level, id)` of absent instances. Descendants of an absent instance are absent too.
    absent: Vec<(usize, AffinityId)>,
}

impl FakeTopology {
    /// Creates a uniform topology from the number of instances per parent, listed from the
    /// highest affinity level down to level 0.
    ///
    /// `&[2, 4]` is a system with two clusters of four cores.
    pub fn new(arity_from_top: &[usize]) -> Self {
        assert!(!arity_from_top.is_empty() && arity_from_top.len() <= MAX_AFFINITY_LEVEL + 1);

        let mut arity = [0; MAX_AFFINITY_LEVEL + 1];
        for (level, count) in arity_from_top.iter().rev().enumerate() {
            arity[level] = *count;
        }

        Self {
            max_level: arity_from_top.len() - 1,
            arity,
            overrides: Vec::new(),
            absent: Vec::new(),
        }
    }

    /// Overrides the number of instances at `level` under the given parent.
    pub fn with_count(mut self, level: usize, parent: AffinityId, count: usize) -> Self {
        self.overrides.push((level, parent, count));
        self
    }

    /// Marks the instance at `level` with the given id as absent.
    pub fn with_absent(mut self, level: usize, id: AffinityId) -> Self {
        self.absent.push((level, id));
        self
    }
}

impl TopologyDescriptor for FakeTopology {
    fn max_affinity_level(&self) -> usize {
        self.max_level
    }

    fn affinity_instance_count(&self, level: usize, parent: AffinityId) -> usize {
        self.overrides
            .iter()
            .find(|&&(override_level, override_parent, _)| {
                override_level == level && override_parent == parent
            })
            .map_or(self.arity[level], |&(_, _, count)| count)
    }

    fn affinity_presence(&self, level: usize, id: AffinityId) -> Presence {
        let absent = self
            .absent
            .iter()
            .any(|&(absent_level, absent_id)| {
                absent_level >= level && id.masked(absent_level) == absent_id
            });
        if absent {
            Presence::Absent
        } else {
            Presence::Present
        }
    }
}

/// PSCI implementation of the test platform which records the calls it receives.
pub struct TestPsciPlatformImpl {
    topology: FakeTopology,
    power_on_calls: AtomicUsize,
    fail_next_power_on: AtomicBool,
    off_calls: AtomicUsize,
    suspend_calls: AtomicUsize,
    standby_calls: AtomicUsize,
    on_finish_calls: AtomicUsize,
    suspend_finish_calls: AtomicUsize,
    pending_interrupt: AtomicBool,
    last_transition: Mutex<Option<PowerTransition>>,
}

impl TestPsciPlatformImpl {
    // Functions that normally do not return make it impossible to test any PSCI call which ends in
    // these functions. The test platform calls panic with the following magic strings that can be
    // caught by `catch_unwind`. This way the test can expect unwind the calls on power down
    // testing.
    pub const POWER_DOWN_WFI_MAGIC: &str = "POWER_DOWN_WFI_MAGIC";
    pub const SYSTEM_OFF_MAGIC: &str = "SYSTEM_OFF_MAGIC";
    pub const SYSTEM_RESET_MAGIC: &str = "SYSTEM_RESET_MAGIC";

    pub fn new(topology: FakeTopology) -> Self {
        Self {
            topology,
            power_on_calls: AtomicUsize::new(0),
            fail_next_power_on: AtomicBool::new(false),
            off_calls: AtomicUsize::new(0),
            suspend_calls: AtomicUsize::new(0),
            standby_calls: AtomicUsize::new(0),
            on_finish_calls: AtomicUsize::new(0),
            suspend_finish_calls: AtomicUsize::new(0),
            pending_interrupt: AtomicBool::new(false),
            last_transition: Mutex::new(None),
        }
    }

    /// Makes the next `power_domain_on` call report that the core didn't respond.
    pub fn fail_next_power_on(&self) {
        self.fail_next_power_on.store(true, Ordering::SeqCst);
    }

    /// Sets whether cores see a pending interrupt when they try to power down.
    pub fn set_pending_interrupt(&self, pending: bool) {
        self.pending_interrupt.store(pending, Ordering::SeqCst);
    }

    pub fn power_on_calls(&self) -> usize {
        self.power_on_calls.load(Ordering::SeqCst)
    }

    pub fn off_calls(&self) -> usize {
        self.off_calls.load(Ordering::SeqCst)
    }

    pub fn suspend_calls(&self) -> usize {
        self.suspend_calls.load(Ordering::SeqCst)
    }

    pub fn standby_calls(&self) -> usize {
        self.standby_calls.load(Ordering::SeqCst)
    }

    pub fn on_finish_calls(&self) -> usize {
        self.on_finish_calls.load(Ordering::SeqCst)
    }

    pub fn suspend_finish_calls(&self) -> usize {
        self.suspend_finish_calls.load(Ordering::SeqCst)
    }

    /// Returns the transition passed to the most recent off, suspend or finish callback.
    pub fn last_transition(&self) -> Option<PowerTransition> {
        *self.last_transition.lock().unwrap()
    }

    fn record(&self, counter: &AtomicUsize, transition: &PowerTransition) {
        counter.fetch_add(1, Ordering::SeqCst);
        *self.last_transition.lock().unwrap() = Some(*transition);
    }
}

impl TopologyDescriptor for TestPsciPlatformImpl {
    fn max_affinity_level(&self) -> usize {
        self.topology.max_affinity_level()
    }

    fn affinity_instance_count(&self, level: usize, parent: AffinityId) -> usize {
        self.topology.affinity_instance_count(level, parent)
    }

    fn affinity_presence(&self, level: usize, id: AffinityId) -> Presence {
        self.topology.affinity_presence(level, id)
    }
}

impl PsciPlatformInterface for TestPsciPlatformImpl {
    const POWER_DOMAIN_COUNT: usize = 32;

    const FEATURES: PsciPlatformOptionalFeatures = PsciPlatformOptionalFeatures::all();

    fn try_parse_power_state(power_state: PowerState) -> Option<SuspendRequest> {
        let (suspend_type, target_level, state_id) = match power_state {
            PowerState::StandbyOrRetention(state_id @ (0 | 1)) => {
                (SuspendType::StandbyOrRetention, state_id as usize, state_id)
            }
            PowerState::PowerDown(state_id @ 0x3) => (SuspendType::PowerDown, 0, state_id),
            PowerState::PowerDown(state_id @ 0x33) => (SuspendType::PowerDown, 1, state_id),
            PowerState::PowerDown(state_id @ 0x333) => (SuspendType::PowerDown, 2, state_id),
            PowerState::PowerDown(state_id @ 0x3333) => (SuspendType::PowerDown, 3, state_id),
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
        self.standby_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn power_domain_on(&self, _mpidr: Mpidr) -> Result<(), ErrorCode> {
        self.power_on_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_power_on.swap(false, Ordering::SeqCst) {
            Err(ErrorCode::InternalFailure)
        } else {
            Ok(())
        }
    }

    fn power_domain_off(&self, transition: &PowerTransition) {
        self.record(&self.off_calls, transition);
    }

    fn power_domain_suspend(&self, transition: &PowerTransition) {
        assert!(transition.suspend.is_some());
        self.record(&self.suspend_calls, transition);
    }

    fn power_domain_power_down_wfi(&self, _transition: &PowerTransition) -> ! {
        panic!("{}", Self::POWER_DOWN_WFI_MAGIC);
    }

    fn power_domain_on_finish(&self, transition: &PowerTransition) {
        self.record(&self.on_finish_calls, transition);
    }

    fn power_domain_suspend_finish(&self, transition: &PowerTransition) {
        self.record(&self.suspend_finish_calls, transition);
    }

    fn system_off(&self) -> ! {
        panic!("{}", Self::SYSTEM_OFF_MAGIC);
    }

    fn system_reset(&self) -> ! {
        panic!("{}", Self::SYSTEM_RESET_MAGIC);
    }

    fn is_valid_ns_entrypoint(&self, entry: &arm_psci::EntryPoint) -> bool {
        entry.entry_point_address() != 0
    }

    fn has_pending_interrupts(&self) -> bool {
        self.pending_interrupt.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_logging() {
        let writer = StdOutSink;
        writeln!(writer, "hello");
    }

    #[test]
    fn fake_topology_counts() {
        let topology = FakeTopology::new(&[1, 3, 2]).with_count(
            0,
            AffinityId::from_aff3210(0, 0, 2, 0),
            4,
        );

        assert_eq!(topology.max_affinity_level(), 2);
        assert_eq!(topology.affinity_instance_count(2, AffinityId::from_aff3210(0, 0, 0, 0)), 1);
        assert_eq!(topology.affinity_instance_count(1, AffinityId::from_aff3210(0, 0, 0, 0)), 3);
        assert_eq!(topology.affinity_instance_count(0, AffinityId::from_aff3210(0, 0, 1, 0)), 2);
        assert_eq!(topology.affinity_instance_count(0, AffinityId::from_aff3210(0, 0, 2, 0)), 4);
    }

    #[test]
    fn fake_topology_absent_subtree() {
        let topology =
            FakeTopology::new(&[2, 4]).with_absent(1, AffinityId::from_aff3210(0, 0, 1, 0));

        assert_eq!(
            topology.affinity_presence(1, AffinityId::from_aff3210(0, 0, 1, 0)),
            Presence::Absent
        );
        assert_eq!(
            topology.affinity_presence(0, AffinityId::from_aff3210(0, 0, 1, 2)),
            Presence::Absent
        );
        assert_eq!(
            topology.affinity_presence(0, AffinityId::from_aff3210(0, 0, 0, 2)),
            Presence::Present
        );
    }

    #[test]
    fn core_positions_are_distinct() {
        let mut seen = [false; TestPlatform::CORE_COUNT];
        for cluster in 0..CLUSTER_SLOTS as u8 {
            for core in 0..CORES_PER_CLUSTER_SLOTS as u8 {
                let position =
                    TestPlatform::core_position(AffinityId::from_aff3210(0, 0, cluster, core));
                assert!(!seen[position]);
                seen[position] = true;
            }
        }
        assert!(!TestPlatform::mpidr_is_valid(AffinityId::from_aff3210(0, 1, 0, 0)));
    }
}
