// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The affinity map holds one node per affinity instance of the system, grouped by level.
//!
//! Nodes of a level are stored contiguously in ascending id order, starting with level 0, so a
//! node can be found with a binary search inside the index range of its level.

use super::{
    PsciPlatformInterface as _, SuspendRequest,
    topology::{AffinityId, MAX_AFFINITY_LEVEL, Presence, TopologyDescriptor},
};
use crate::{
    bakery_lock::{BakeryLock, BakeryLockGuard},
    platform::{Platform, PlatformImpl, PsciPlatformImpl},
};
use arm_psci::EntryPoint;
use arrayvec::ArrayVec;
use core::fmt::{self, Debug, Formatter};
use log::debug;

const NODE_COUNT: usize = PsciPlatformImpl::POWER_DOMAIN_COUNT;
const CORE_COUNT: usize = PlatformImpl::CORE_COUNT;
const LEVEL_COUNT: usize = MAX_AFFINITY_LEVEL + 1;

/// Power state of an affinity node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodePowerState {
    Off,
    On,
    OnPending,
    Suspend,
}

impl NodePowerState {
    /// Only running nodes are powered, pending and suspended nodes are physically off.
    pub fn is_physically_on(self) -> bool {
        self == Self::On
    }

    /// Returns whether a core node may move from this state to `next`.
    fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Off, Self::OnPending)
                | (Self::OnPending, Self::On | Self::Off)
                | (Self::On, Self::Off | Self::Suspend)
                | (Self::Suspend, Self::On)
        )
    }
}

/// Level specific payload of an affinity node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeData {
    /// A core, with the index of its slot in the per-core entry point table.
    Core(usize),
    /// A cluster or a higher level group of cores.
    Aggregate,
}

/// Where a core continues in the normal world, and the suspend it woke up from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CoreEntryInfo {
    pub entry_point: Option<EntryPoint>,
    pub suspend: Option<SuspendRequest>,
}

impl CoreEntryInfo {
    pub const EMPTY: Self = Self {
        entry_point: None,
        suspend: None,
    };
}

/// Mutable part of an affinity node, only accessible while holding the node lock.
#[derive(Debug)]
pub struct NodeStatus {
    state: NodePowerState,
    /// Number of descendant cores which keep an aggregate node on.
    ref_count: usize,
    /// Only used by core nodes.
    entry: CoreEntryInfo,
}

impl NodeStatus {
    const fn new() -> Self {
        Self {
            state: NodePowerState::Off,
            ref_count: 0,
            entry: CoreEntryInfo::EMPTY,
        }
    }
}

/// State of one affinity instance.
pub struct AffinityNode {
    id: AffinityId,
    level: usize,
    presence: Presence,
    data: NodeData,
    status: BakeryLock<NodeStatus>,
}

impl AffinityNode {
    fn new(id: AffinityId, level: usize, presence: Presence, data: NodeData) -> Self {
        Self {
            id,
            level,
            presence,
            data,
            status: BakeryLock::new(NodeStatus::new()),
        }
    }

    pub fn id(&self) -> AffinityId {
        self.id
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    pub fn is_present(&self) -> bool {
        self.presence == Presence::Present
    }

    /// Returns the entry point table slot of a core node.
    pub fn core_index(&self) -> Option<usize> {
        match self.data {
            NodeData::Core(index) => Some(index),
            NodeData::Aggregate => None,
        }
    }

    /// Locks the node for the calling core.
    pub fn lock(&self) -> BakeryLockGuard<'_, NodeStatus> {
        self.status.lock()
    }

    /// Returns the current power state, taking the node lock for the duration of the read.
    pub fn state(&self) -> NodePowerState {
        self.lock().state
    }
}

/// Index range of the nodes of a level, both ends inclusive.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LevelLimits {
    pub min: usize,
    pub max: usize,
}

impl LevelLimits {
    pub fn len(&self) -> usize {
        self.max - self.min + 1
    }
}

/// All affinity nodes of the system and the index limits of each level.
pub struct AffinityMap {
    nodes: ArrayVec<AffinityNode, NODE_COUNT>,
    limits: [LevelLimits; LEVEL_COUNT],
    max_level: usize,
    core_count: usize,
}

impl AffinityMap {
    /// Builds the map by walking the topology described by the platform, one level at a time.
    ///
    /// Panics if the platform describes an impossible topology: a parent without children, more
    /// instances than the map can hold, or siblings not in ascending id order.
    pub fn build(topology: &impl TopologyDescriptor) -> Self {
        let max_level = topology.max_affinity_level();
        assert!(
            max_level <= MAX_AFFINITY_LEVEL,
            "Max affinity level {max_level} is greater than {MAX_AFFINITY_LEVEL}"
        );

        let mut map = Self {
            nodes: ArrayVec::new(),
            limits: [LevelLimits::default(); LEVEL_COUNT],
            max_level,
            core_count: 0,
        };

        for level in 0..=max_level {
            map.populate_level(topology, level);
        }

        map
    }

    /// Appends every node of `target_level`, by a breadth-first walk from the top of the
    /// hierarchy.
    fn populate_level(&mut self, topology: &impl TopologyDescriptor, target_level: usize) {
        let first = self.nodes.len();

        // Entries are (parent id, level of its children). The walk visits parents in the order
        // they are queued, so the children of a level come out in ascending id order.
        let mut worklist: ArrayVec<(AffinityId, usize), NODE_COUNT> = ArrayVec::new();
        worklist.push((AffinityId::default(), self.max_level));
        let mut cursor = 0;

        while let Some(&(parent, level)) = worklist.get(cursor) {
            cursor += 1;

            let count = topology.affinity_instance_count(level, parent);
            assert_ne!(count, 0, "No level {level} instances in {parent}");
            assert!(
                count <= usize::from(u8::MAX) + 1,
                "Too many level {level} instances in {parent}"
            );

            for instance in 0..count {
                let id = parent.with_aff(level, instance as u8);
                if level == target_level {
                    self.push_node(topology, id, level, first);
                } else {
                    assert!(!worklist.is_full(), "Too many affinity instances");
                    worklist.push((id, level - 1));
                }
            }
        }

        self.limits[target_level] = LevelLimits {
            min: if target_level == 0 {
                0
            } else {
                self.limits[target_level - 1].max + 1
            },
            max: self.nodes.len() - 1,
        };
        debug_assert_eq!(self.limits[target_level].min, first);
        debug!(
            "Affinity level {target_level}: {} instances",
            self.limits[target_level].len()
        );
    }

    fn push_node(
        &mut self,
        topology: &impl TopologyDescriptor,
        id: AffinityId,
        level: usize,
        level_start: usize,
    ) {
        // Ids are generated in ascending order by the walk, not reported by the platform.
        if let Some(previous) = self.nodes[level_start..].last() {
            debug_assert!(
                previous.id < id,
                "Level {level} instance {id} does not follow {}",
                previous.id
            );
        }
        assert!(
            !self.nodes.is_full(),
            "More than {NODE_COUNT} affinity instances"
        );

        let data = if level == 0 {
            assert!(self.core_count < CORE_COUNT, "More than {CORE_COUNT} cores");
            self.core_count += 1;
            NodeData::Core(self.core_count - 1)
        } else {
            NodeData::Aggregate
        };

        let presence = topology.affinity_presence(level, id);
        self.nodes.push(AffinityNode::new(id, level, presence, data));
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    /// Returns the index limits of the level.
    pub fn limits(&self, level: usize) -> Option<LevelLimits> {
        (level <= self.max_level).then(|| self.limits[level])
    }

    /// Returns the number of level 0 nodes.
    pub fn core_count(&self) -> usize {
        self.core_count
    }

    pub fn nodes(&self) -> &[AffinityNode] {
        &self.nodes
    }

    /// Returns the index of the node at `level` which contains `id`.
    pub fn find_index(&self, id: AffinityId, level: usize) -> Option<usize> {
        let limits = self.limits(level)?;
        let id = id.masked(level);

        self.nodes[limits.min..=limits.max]
            .binary_search_by_key(&id, AffinityNode::id)
            .ok()
            .map(|offset| limits.min + offset)
    }

    /// Returns the node at `level` which contains `id`.
    pub fn find(&self, id: AffinityId, level: usize) -> Option<&AffinityNode> {
        self.find_index(id, level).map(|index| &self.nodes[index])
    }

    /// Collects the core node of `id` and its ancestors up to `end_level`.
    ///
    /// Returns `None` if there is no such core or `end_level` is above the highest level.
    pub fn chain(&self, id: AffinityId, end_level: usize) -> Option<NodeChain<'_>> {
        if end_level > self.max_level {
            return None;
        }

        let mut nodes = ArrayVec::new();
        nodes.push(self.find(id, 0)?);
        for level in 1..=end_level {
            let node = self
                .find(id, level)
                .unwrap_or_else(|| panic!("Level {level} ancestor of core {id} is missing"));
            nodes.push(node);
        }

        Some(NodeChain { nodes })
    }

    /// Marks the chain of the boot core on up to the highest level, without locking.
    pub fn mark_boot_chain_on(&mut self, id: AffinityId) {
        let chain_length = self
            .chain(id, self.max_level)
            .unwrap_or_else(|| panic!("Boot core {id} is not in the affinity map"))
            .len();

        // Level 0 comes first in the map, so the core node is visited before its ancestors.
        let statuses = self
            .nodes
            .iter_mut()
            .filter(|node| node.id == id.masked(node.level))
            .map(|node| node.status.get_mut());
        let changed = apply_state(statuses, NodePowerState::On);
        debug_assert_eq!(changed, chain_length);
    }
}

impl Debug for AffinityMap {
    /// Outputs the map in Graphviz DOT format.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "digraph {{")?;
        for (index, node) in self.nodes().iter().enumerate() {
            writeln!(
                f,
                "N{index} [label=\"{} L{} {:?}\"]",
                node.id(),
                node.level(),
                node.presence()
            )?;
            if let Some(parent) = self.find_index(node.id(), node.level() + 1) {
                writeln!(f, "N{parent} -> N{index}")?;
            }
        }
        write!(f, "}}")
    }
}

/// Moves the core status, which must come first, to `state` and updates the aggregate statuses
/// which follow it. Returns the number of updated statuses.
///
/// An aggregate is on while any of its cores is on. When its last core stops running the
/// aggregate takes the state of that core.
fn apply_state<'a>(
    mut statuses: impl Iterator<Item = &'a mut NodeStatus>,
    state: NodePowerState,
) -> usize {
    let Some(core) = statuses.next() else {
        return 0;
    };

    let was_on = core.state == NodePowerState::On;
    let is_on = state == NodePowerState::On;
    core.state = state;

    let mut changed = 1;
    for aggregate in statuses {
        if is_on && !was_on {
            aggregate.ref_count += 1;
            aggregate.state = NodePowerState::On;
        } else if was_on && !is_on {
            assert_ne!(aggregate.ref_count, 0);
            aggregate.ref_count -= 1;
            if aggregate.ref_count == 0 {
                aggregate.state = state;
            }
        }
        changed += 1;
    }

    changed
}

/// A core node and its ancestors up to some level, not locked yet.
pub struct NodeChain<'a> {
    nodes: ArrayVec<&'a AffinityNode, LEVEL_COUNT>,
}

impl<'a> NodeChain<'a> {
    /// Returns the number of nodes in the chain.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Locks every node of the chain, from the core towards the root.
    pub fn lock(self) -> LockedChain<'a> {
        let guards = self.nodes.iter().map(|node| node.lock()).collect();
        LockedChain {
            nodes: self.nodes,
            guards,
        }
    }
}

/// A chain of nodes with all of their locks held. The locks are released from the root towards
/// the core on drop.
pub struct LockedChain<'a> {
    nodes: ArrayVec<&'a AffinityNode, LEVEL_COUNT>,
    guards: ArrayVec<BakeryLockGuard<'a, NodeStatus>, LEVEL_COUNT>,
}

impl<'a> LockedChain<'a> {
    pub fn core(&self) -> &'a AffinityNode {
        self.nodes[0]
    }

    /// Returns the state of the node at `level`.
    pub fn state(&self, level: usize) -> NodePowerState {
        self.guards[level].state
    }

    pub fn core_state(&self) -> NodePowerState {
        self.state(0)
    }

    /// Returns the entry point record of the core, guarded by the core node lock.
    pub fn entry_info(&self) -> &CoreEntryInfo {
        &self.guards[0].entry
    }

    pub fn entry_info_mut(&mut self) -> &mut CoreEntryInfo {
        &mut self.guards[0].entry
    }

    /// Moves the core to `state` and updates the ancestors in the chain accordingly.
    ///
    /// Panics if the core cannot move from its current state to `state`.
    pub fn set_state(&mut self, state: NodePowerState) {
        let current = self.core_state();
        assert!(
            current.can_become(state),
            "Invalid power state transition of core {}: {current:?} -> {state:?}",
            self.core().id
        );

        apply_state(self.guards.iter_mut().map(|guard| &mut **guard), state);
    }

    /// Returns the highest level of the chain which is physically off.
    pub fn max_phys_off_level(&self) -> Option<usize> {
        self.guards
            .iter()
            .rposition(|status| !status.state.is_physically_on())
    }
}

impl Drop for LockedChain<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}
