// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Subsystem configuration and section geometry
//! PUBLIC API: RemapConfig, SectionId, Sections
//! INVARIANTS: PAGE_SHIFT <= section_shift < 63; section_limit > 0

use core::ops::RangeInclusive;

use crate::error::ConfigError;
use crate::types::{PhysAddr, PhysRange};

/// Base page shift; sections are never smaller than a page.
pub const PAGE_SHIFT: u32 = 12;
/// Section shift used when none is configured (128 MiB sections).
pub const DEFAULT_SECTION_SHIFT: u32 = 27;
const MAX_SECTION_SHIFT: u32 = 62;

/// Index of a fixed-size, size-aligned section of physical memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId(u64);

impl SectionId {
    /// Returns the raw section number.
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Tunables for a [`MemRemap`](crate::MemRemap) instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemapConfig {
    section_shift: u32,
    section_limit: usize,
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self { section_shift: DEFAULT_SECTION_SHIFT, section_limit: usize::MAX }
    }
}

impl RemapConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the section size to `1 << shift` bytes.
    pub fn with_section_shift(mut self, shift: u32) -> Self {
        self.section_shift = shift;
        self
    }

    /// Caps the total number of registry entries across all claims.
    pub fn with_section_limit(mut self, limit: usize) -> Self {
        self.section_limit = limit;
        self
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.section_shift < PAGE_SHIFT || self.section_shift > MAX_SECTION_SHIFT {
            return Err(ConfigError::InvalidSectionShift(self.section_shift));
        }
        if self.section_limit == 0 {
            return Err(ConfigError::ZeroSectionLimit);
        }
        Ok(())
    }

    /// Configured section shift.
    pub fn section_shift(&self) -> u32 {
        self.section_shift
    }

    /// Section size in bytes.
    pub fn section_size(&self) -> u64 {
        1u64 << self.section_shift
    }

    /// Maximum number of registry entries.
    pub fn section_limit(&self) -> usize {
        self.section_limit
    }

    /// Section containing `addr`.
    pub fn section_of(&self, addr: PhysAddr) -> SectionId {
        SectionId(addr.as_u64() >> self.section_shift)
    }

    /// Every section touched by `range`, in address order.
    ///
    /// Walks from the section of the first byte to the section of the last
    /// byte, independent of the range's own alignment.
    pub fn sections(&self, range: &PhysRange) -> Sections {
        let first = self.section_of(range.start()).0;
        let last = self.section_of(range.last()).0;
        Sections { inner: first..=last }
    }

    /// Widens `range` to whole sections.
    ///
    /// Returns `None` only when the aligned end does not fit in 64 bits.
    pub fn align_outward(&self, range: &PhysRange) -> Option<PhysRange> {
        let mask = self.section_size() - 1;
        let start = range.start().as_u64() & !mask;
        let count = self.sections(range).len() as u64;
        let len = count.checked_mul(self.section_size())?;
        PhysRange::new(start, len)
    }
}

/// Iterator over the sections covered by a range.
#[derive(Clone, Debug)]
pub struct Sections {
    inner: RangeInclusive<u64>,
}

impl Iterator for Sections {
    type Item = SectionId;

    fn next(&mut self) -> Option<SectionId> {
        self.inner.next().map(SectionId)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Sections {
    fn len(&self) -> usize {
        // Section counts stay far below usize::MAX for any legal shift.
        self.inner.size_hint().0
    }
}
