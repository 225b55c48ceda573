// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address and identity value types shared by every component.

use core::fmt;

/// Offset into the machine's physical address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Wraps a raw physical address.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw address value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Kernel virtual address returned by a successful remap or claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Wraps a raw virtual address.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw address value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the address `offset` bytes above `self`, if representable.
    pub fn checked_add(self, offset: u64) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Non-empty physical range.
///
/// Stored as `start` plus `len`; [`last`](Self::last) is the inclusive end.
/// Construction guarantees `len > 0` and that the inclusive end does not
/// wrap the 64-bit address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PhysRange {
    start: u64,
    len: u64,
}

// Never empty by construction.
#[allow(clippy::len_without_is_empty)]
impl PhysRange {
    /// Creates a range of `len` bytes starting at `start`.
    ///
    /// Returns `None` for an empty range or one whose end overflows.
    pub const fn new(start: u64, len: u64) -> Option<Self> {
        if len == 0 {
            return None;
        }
        match start.checked_add(len - 1) {
            Some(_) => Some(Self { start, len }),
            None => None,
        }
    }

    /// Creates the half-open range `[start, end)`.
    pub const fn from_bounds(start: u64, end: u64) -> Option<Self> {
        if end <= start {
            return None;
        }
        Self::new(start, end - start)
    }

    /// First address of the range.
    pub const fn start(&self) -> PhysAddr {
        PhysAddr(self.start)
    }

    /// Last address of the range (inclusive).
    pub const fn last(&self) -> PhysAddr {
        PhysAddr(self.start + (self.len - 1))
    }

    /// Size of the range in bytes.
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if `addr` lies inside the range.
    pub const fn contains(&self, addr: PhysAddr) -> bool {
        addr.0 >= self.start && addr.0 <= self.start + (self.len - 1)
    }

    /// Returns `true` if the two ranges share at least one byte.
    pub const fn overlaps(&self, other: &PhysRange) -> bool {
        self.start <= other.last().0 && other.start <= self.last().0
    }

    /// Returns `true` if `other` lies entirely within `self`.
    pub const fn covers(&self, other: &PhysRange) -> bool {
        other.start >= self.start && other.last().0 <= self.last().0
    }
}

impl fmt::Display for PhysRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}-{:#x}]", self.start, self.last().0)
    }
}

/// Opaque identity of the entity that owns a claim or scoped mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Wraps a caller-chosen owner identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// NUMA node identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Wraps a raw node number.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw node number.
    pub const fn value(self) -> u32 {
        self.0
    }
}
