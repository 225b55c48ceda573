// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Collaborator traits consumed by the remap core.
//!
//! The core never walks page tables or extent lists itself; everything it
//! knows about the machine comes through these interfaces.

use crate::error::HotplugError;
use crate::types::{NodeId, PhysRange, VirtAddr};

/// How a physical range relates to ordinary system memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// No byte of the range is ordinary memory.
    Disjoint,
    /// Every byte of the range is ordinary memory.
    FullyKnownMemory,
    /// The range straddles ordinary memory and something else.
    Mixed,
}

/// Cache attribute requested for a fresh mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CachePolicy {
    /// Read-allocate write-back, matching the direct map.
    WriteBack,
    /// Writes never sit dirty in the cache.
    WriteThrough,
}

/// Physical-extent classifier.
pub trait RangeClassifier: Send + Sync {
    /// Classifies `range` against ordinary system memory.
    fn classify(&self, range: &PhysRange) -> RegionKind;
}

/// Virtual-mapping primitives.
pub trait MappingPrimitives: Send + Sync {
    /// Establishes a new mapping of `range` with `policy`.
    fn establish_mapping(&self, range: &PhysRange, policy: CachePolicy) -> Option<VirtAddr>;

    /// Tears down a mapping previously returned by `establish_mapping`.
    fn teardown_mapping(&self, addr: VirtAddr);

    /// Address of `range` inside the direct map, if the direct map covers it.
    fn direct_map_address(&self, range: &PhysRange) -> Option<VirtAddr>;

    /// Returns `true` if `addr` points into the direct map.
    fn is_direct_map_address(&self, addr: VirtAddr) -> bool;
}

/// Memory hotplug: allocator visibility of physical ranges.
pub trait MemoryHotplug: Send + Sync {
    /// Makes section-aligned `range` allocator-visible on `node`.
    fn make_visible(&self, range: &PhysRange, node: NodeId) -> Result<(), HotplugError>;

    /// Reverses [`make_visible`](Self::make_visible).
    fn revoke_visibility(&self, range: &PhysRange);

    /// Returns `true` if `node` can receive memory.
    fn node_online(&self, node: NodeId) -> bool;

    /// Node used when the caller gives no usable hint.
    fn default_node(&self) -> NodeId;
}

/// Everything a [`MemRemap`](crate::MemRemap) instance needs from the machine.
pub trait Platform: RangeClassifier + MappingPrimitives + MemoryHotplug {}

impl<T> Platform for T where T: RangeClassifier + MappingPrimitives + MemoryHotplug {}
