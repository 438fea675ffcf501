// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Description of the affinity hierarchy of the system, as reported by the platform.

use arm_psci::Mpidr;
use core::fmt::{self, Display, Formatter};

/// The highest affinity level of the architecture.
pub const MAX_AFFINITY_LEVEL: usize = 3;

/// Bit offsets of the Aff0..Aff3 fields in an MPIDR value.
const AFFINITY_SHIFTS: [u32; MAX_AFFINITY_LEVEL + 1] = [0, 8, 16, 32];
const AFFINITY_FIELD_MASK: u64 = 0xff;

/// Hierarchical identifier of an affinity instance, laid out like the affinity fields of
/// `MPIDR_EL1`.
///
/// An id of a level `n` instance has all fields below `n` cleared.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AffinityId(u64);

impl AffinityId {
    /// Mask of every affinity field.
    pub const MASK: u64 = 0x00ff_00ff_ffff;

    /// Creates an id from raw MPIDR bits, dropping everything but the affinity fields.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits & Self::MASK)
    }

    pub const fn from_aff3210(aff3: u8, aff2: u8, aff1: u8, aff0: u8) -> Self {
        Self(
            (aff3 as u64) << AFFINITY_SHIFTS[3]
                | (aff2 as u64) << AFFINITY_SHIFTS[2]
                | (aff1 as u64) << AFFINITY_SHIFTS[1]
                | (aff0 as u64) << AFFINITY_SHIFTS[0],
        )
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns the instance selector at the given affinity level.
    pub const fn aff(self, level: usize) -> u8 {
        assert!(level <= MAX_AFFINITY_LEVEL);
        ((self.0 >> AFFINITY_SHIFTS[level]) & AFFINITY_FIELD_MASK) as u8
    }

    pub const fn aff0(self) -> u8 {
        self.aff(0)
    }

    pub const fn aff1(self) -> u8 {
        self.aff(1)
    }

    pub const fn aff2(self) -> u8 {
        self.aff(2)
    }

    pub const fn aff3(self) -> u8 {
        self.aff(3)
    }

    /// Returns a copy of the id with the selector of the given level replaced.
    pub const fn with_aff(self, level: usize, instance: u8) -> Self {
        assert!(level <= MAX_AFFINITY_LEVEL);
        let shift = AFFINITY_SHIFTS[level];
        Self((self.0 & !(AFFINITY_FIELD_MASK << shift)) | (instance as u64) << shift)
    }

    /// Clears every field below `level`, i.e. returns the id of the level `level` instance which
    /// contains this one.
    pub const fn masked(self, level: usize) -> Self {
        assert!(level <= MAX_AFFINITY_LEVEL);
        Self(self.0 & Self::MASK & !((1 << AFFINITY_SHIFTS[level]) - 1))
    }
}

impl fmt::Debug for AffinityId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "AffinityId({self})")
    }
}

impl Display for AffinityId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.aff3(),
            self.aff2(),
            self.aff1(),
            self.aff0()
        )
    }
}

impl From<Mpidr> for AffinityId {
    fn from(mpidr: Mpidr) -> Self {
        Self::from_aff3210(
            mpidr.aff3.unwrap_or_default(),
            mpidr.aff2,
            mpidr.aff1,
            mpidr.aff0,
        )
    }
}

impl From<AffinityId> for Mpidr {
    fn from(id: AffinityId) -> Self {
        Mpidr::from_aff3210(id.aff3(), id.aff2(), id.aff1(), id.aff0())
    }
}

/// Whether an affinity instance is physically implemented.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Presence {
    Present,
    Absent,
}

/// Platform description of the affinity hierarchy.
///
/// Siblings must be numbered contiguously from 0, so the children of a parent are the instances
/// `0..affinity_instance_count(level, parent)`.
pub trait TopologyDescriptor {
    /// Returns the highest affinity level implemented by the platform. It must not be greater than
    /// [`MAX_AFFINITY_LEVEL`].
    fn max_affinity_level(&self) -> usize;

    /// Returns the number of instances at `level` inside the parent instance. `parent` has all
    /// fields up to and including `level` cleared.
    fn affinity_instance_count(&self, level: usize, parent: AffinityId) -> usize;

    /// Returns whether the instance with the given id is present at `level`.
    fn affinity_presence(&self, level: usize, id: AffinityId) -> Presence;
}
