// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Permanent device-memory claims bound to an owner's lifetime
//! PUBLIC API: MemRemap::{claim_region, unclaim_region, read_section, find_owner}
//! DEPENDS_ON: SectionRegistry, MemoryHotplug, OwnerScope
//! INVARIANTS: Registry entries exist only for allocator-visible claims;
//!             release drops the registry entry before revoking visibility

use std::sync::Arc;

#[cfg(feature = "zone-device")]
use log::error;
use log::{debug, info, warn};

use crate::error::ClaimError;
use crate::platform::Platform;
#[cfg(feature = "zone-device")]
use crate::platform::RegionKind;
use crate::registry::{OwnerRecord, ReadSection};
use crate::scope::{OwnerScope, ResourceKey};
use crate::types::{NodeId, PhysAddr, PhysRange, VirtAddr};
use crate::MemRemap;

/// Result alias for claim operations.
pub type Result<T> = core::result::Result<T, ClaimError>;

impl<P: Platform> MemRemap<P> {
    /// Permanently claims `range` for `scope`'s owner and makes it ordinary,
    /// allocator-visible memory.
    ///
    /// A range that already is ordinary memory is returned through the
    /// direct map without registering anything. Otherwise every section of
    /// the range is registered to the owner, the section-aligned range is
    /// hotplugged on the hinted (or default) node, and a release hook is
    /// bound to `scope`.
    #[cfg(feature = "zone-device")]
    pub fn claim_region<'a>(
        &'a self,
        scope: &OwnerScope<'a>,
        range: PhysRange,
        numa_hint: Option<NodeId>,
    ) -> Result<VirtAddr> {
        match self.platform.classify(&range) {
            RegionKind::Mixed => {
                error!(target: "memremap", "{}: claim attempted on mixed region {range}", scope.name());
                return Err(ClaimError::AmbiguousRegion(range));
            }
            RegionKind::FullyKnownMemory => {
                return self
                    .platform
                    .direct_map_address(&range)
                    .ok_or(ClaimError::NoMappingEstablished(range));
            }
            RegionKind::Disjoint => {}
        }

        let aligned = self
            .registry
            .config()
            .align_outward(&range)
            .ok_or(ClaimError::NoMappingEstablished(range))?;
        let backing = self
            .platform
            .direct_map_address(&range)
            .ok_or(ClaimError::NoMappingEstablished(range))?;
        let node = self.pick_node(scope, numa_hint);
        let record = Arc::new(OwnerRecord::new(range, scope.id(), scope.name(), backing, node));

        self.registry.insert(Arc::clone(&record))?;

        if let Err(err) = self.platform.make_visible(&aligned, node) {
            self.registry.remove(&record);
            warn!(target: "memremap", "{}: hotplug of {aligned} failed: {err}", scope.name());
            return Err(err.into());
        }

        info!(
            target: "memremap",
            "{}: claimed {range} (node {}) at {backing}",
            scope.name(),
            node.value()
        );
        scope.bind(ResourceKey::Region(range.start()), move || {
            self.release_region(&record, &aligned);
        });
        Ok(backing)
    }

    /// Permanent claims are not compiled in; always fails.
    #[cfg(not(feature = "zone-device"))]
    pub fn claim_region<'a>(
        &'a self,
        scope: &OwnerScope<'a>,
        range: PhysRange,
        _numa_hint: Option<NodeId>,
    ) -> Result<VirtAddr> {
        warn!(target: "memremap", "{}: claim of {range} without zone-device support", scope.name());
        Err(ClaimError::Unsupported)
    }

    /// Releases the claim starting at `start` before `scope` is torn down.
    ///
    /// Returns `false` if `scope` holds no such claim.
    pub fn unclaim_region(&self, scope: &OwnerScope<'_>, start: PhysAddr) -> bool {
        scope.release(ResourceKey::Region(start))
    }

    /// Enters the read-side critical section required by [`find_owner`](Self::find_owner).
    ///
    /// Claims may be released, from any thread, while a section is open;
    /// records already found stay valid until it is dropped.
    pub fn read_section(&self) -> ReadSection<'_> {
        self.registry.read()
    }

    /// Finds the claim covering `addr`.
    ///
    /// The returned reference lives as long as `read`; keep a clone of the
    /// `Arc` to hold on to the record beyond it.
    pub fn find_owner<'r>(
        &self,
        read: &'r ReadSection<'_>,
        addr: PhysAddr,
    ) -> Option<&'r Arc<OwnerRecord>> {
        if cfg!(feature = "zone-device") {
            read.lookup(addr)
        } else {
            None
        }
    }

    #[cfg_attr(not(feature = "zone-device"), allow(dead_code))]
    fn pick_node(&self, scope: &OwnerScope<'_>, hint: Option<NodeId>) -> NodeId {
        let node = [hint, scope.node()]
            .into_iter()
            .flatten()
            .find(|node| self.platform.node_online(*node))
            .unwrap_or_else(|| self.platform.default_node());
        debug!(target: "memremap", "{}: using node {}", scope.name(), node.value());
        node
    }

    // Entry first: a racing lookup must never resolve memory being removed.
    #[cfg_attr(not(feature = "zone-device"), allow(dead_code))]
    fn release_region(&self, record: &OwnerRecord, aligned: &PhysRange) {
        self.registry.remove(record);
        self.platform.revoke_visibility(aligned);
        info!(target: "memremap", "{}: released {}", record.label(), record.range());
    }
}
