// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Section-granular ownership index for claimed physical memory
//! PUBLIC API: OwnerRecord, SectionRegistry::{insert, remove, read, lookup}
//! DEPENDS_ON: rcu::RcuCell
//! INVARIANTS: Every section of an installed record maps back to it; no
//!             section maps to two records; a failed insert leaves the
//!             published map unchanged; lookups never block

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use log::warn;

use crate::config::{RemapConfig, SectionId};
use crate::error::RegistryError;
use crate::rcu::{RcuCell, RcuReadGuard};
use crate::types::{NodeId, OwnerId, PhysAddr, PhysRange, VirtAddr};

/// Result alias for registry mutations.
pub type Result<T> = core::result::Result<T, RegistryError>;

type SectionMap = HashMap<SectionId, Arc<OwnerRecord>>;

/// Immutable description of one permanent claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRecord {
    range: PhysRange,
    owner: OwnerId,
    label: String,
    backing: VirtAddr,
    node: NodeId,
}

impl OwnerRecord {
    /// Creates a record for `range` owned by `owner`.
    ///
    /// `backing` is the address the owner uses to reach the memory; `label`
    /// is only used in diagnostics.
    pub fn new(
        range: PhysRange,
        owner: OwnerId,
        label: impl Into<String>,
        backing: VirtAddr,
        node: NodeId,
    ) -> Self {
        Self { range, owner, label: label.into(), backing, node }
    }

    /// Claimed physical range.
    pub fn range(&self) -> PhysRange {
        self.range
    }

    /// Owning entity.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Human-readable owner name.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Virtual address of the first byte of the range.
    pub fn backing(&self) -> VirtAddr {
        self.backing
    }

    /// NUMA node the memory was onlined on.
    pub fn node(&self) -> NodeId {
        self.node
    }
}

/// Concurrent map from section to owning claim.
///
/// Mutations take one registry-wide lock for the whole section walk and
/// publish a complete new snapshot; reads go through [`read`](Self::read)
/// and never block. Mutations never wait for readers, so a thread may
/// mutate while it holds a [`ReadSection`].
pub struct SectionRegistry {
    config: RemapConfig,
    sections: RcuCell<SectionMap>,
}

impl SectionRegistry {
    /// Creates an empty registry using the section geometry of `config`.
    pub fn new(config: RemapConfig) -> Self {
        Self { config, sections: RcuCell::new(SectionMap::new()) }
    }

    /// Installs `record` on every section its range touches.
    ///
    /// Fails without side effects if any section is held by another record
    /// or if the entry budget is exhausted. Sections already held by the
    /// same record count against neither.
    pub fn insert(&self, record: Arc<OwnerRecord>) -> Result<()> {
        self.sections.update(|current| {
            let sections = self.config.sections(&record.range);
            let held_by_record = |section: &SectionId| {
                current.get(section).is_some_and(|held| Arc::ptr_eq(held, &record))
            };
            let fresh = sections.clone().filter(|section| !held_by_record(section)).count();
            if fresh == 0 {
                return Ok(None);
            }
            let wanted = current.len().saturating_add(fresh);
            if wanted > self.config.section_limit() {
                return Err(RegistryError::ResourceExhausted);
            }
            let mut next = SectionMap::new();
            next.try_reserve(wanted).map_err(|_| RegistryError::ResourceExhausted)?;
            next.extend(current.iter().map(|(id, rec)| (*id, Arc::clone(rec))));

            for section in sections {
                match next.entry(section) {
                    Entry::Occupied(slot) if Arc::ptr_eq(slot.get(), &record) => {}
                    Entry::Occupied(slot) => {
                        let holder = slot.get();
                        warn!(
                            target: "memremap",
                            "{}: {} collides with mapping for {}",
                            record.label, record.range, holder.label
                        );
                        // Dropping `next` discards everything placed so far.
                        return Err(RegistryError::Collision { conflicting_owner: holder.owner });
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(Arc::clone(&record));
                    }
                }
            }
            Ok(Some(next))
        })
    }

    /// Deletes the entry of every section `record`'s range touches.
    ///
    /// Absent sections are skipped, so repeated removal is a no-op.
    pub fn remove(&self, record: &OwnerRecord) {
        let outcome = self.sections.update::<Infallible, _>(|current| {
            let mut sections = self.config.sections(&record.range);
            if !sections.any(|section| current.contains_key(&section)) {
                return Ok(None);
            }
            let mut next = current.clone();
            for section in self.config.sections(&record.range) {
                next.remove(&section);
            }
            Ok(Some(next))
        });
        if let Err(never) = outcome {
            match never {}
        }
    }

    /// Enters a read-side critical section.
    pub fn read(&self) -> ReadSection<'_> {
        ReadSection { config: &self.config, sections: self.sections.read() }
    }

    /// Looks up the claim covering `addr` and keeps it alive past the read.
    pub fn lookup(&self, addr: PhysAddr) -> Option<Arc<OwnerRecord>> {
        self.read().lookup(addr).cloned()
    }

    /// Number of sections currently claimed.
    pub fn len(&self) -> usize {
        self.read().sections.len()
    }

    /// Returns `true` if no section is claimed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaced snapshots still pinned by open read sections.
    pub fn retired_snapshots(&self) -> usize {
        self.sections.pending()
    }

    /// Section geometry in use.
    pub fn config(&self) -> &RemapConfig {
        &self.config
    }
}

/// Read-side critical section over a [`SectionRegistry`].
///
/// References obtained through it are valid until it is dropped, even if
/// the claim is released concurrently.
pub struct ReadSection<'a> {
    config: &'a RemapConfig,
    sections: RcuReadGuard<'a, SectionMap>,
}

impl ReadSection<'_> {
    /// Claim covering `addr`, if any.
    pub fn lookup(&self, addr: PhysAddr) -> Option<&Arc<OwnerRecord>> {
        self.sections.get(&self.config.section_of(addr))
    }

    /// Distinct claims visible in this snapshot, ordered by start address.
    pub fn owners(&self) -> Vec<Arc<OwnerRecord>> {
        let mut owners: Vec<Arc<OwnerRecord>> = Vec::new();
        for record in self.sections.values() {
            if !owners.iter().any(|seen| Arc::ptr_eq(seen, record)) {
                owners.push(Arc::clone(record));
            }
        }
        owners.sort_by_key(|record| record.range.start());
        owners
    }
}
