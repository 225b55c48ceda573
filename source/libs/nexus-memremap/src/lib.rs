// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![deny(clippy::all, missing_docs)]

//! CONTEXT: Physical-memory remapping and device-memory ownership
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: MemRemap::{remap, unmap, scoped_remap, scoped_unmap,
//!             claim_region, unclaim_region, read_section, find_owner}
//! DEPENDS_ON: platform collaborators (classifier, mapper, hotplug)
//! INVARIANTS: No fresh mapping aliases ordinary memory; each section has
//!             at most one owner; owner lookups never block
//!
//! A [`MemRemap`] instance is built once per platform and shared by
//! reference. It hands out cacheable mappings of physical ranges, either by
//! reusing the direct map or by negotiating a new mapping, and keeps the
//! section registry that answers "who owns this physical address" for
//! permanently claimed device memory.
//!
//! With the `backend-host` feature (default) the crate ships
//! [`host::HostPlatform`], an in-memory machine model for tests.

pub mod config;
pub mod error;
#[cfg(feature = "backend-host")]
pub mod host;
pub mod pages;
pub mod platform;
pub mod rcu;
pub mod registry;
pub mod remap;
pub mod scope;
pub mod types;

pub use config::{RemapConfig, SectionId};
pub use error::{ClaimError, ConfigError, HotplugError, RegistryError, RemapError};
pub use platform::{
    CachePolicy, MappingPrimitives, MemoryHotplug, Platform, RangeClassifier, RegionKind,
};
pub use registry::{OwnerRecord, ReadSection, SectionRegistry};
pub use remap::MapFlags;
pub use scope::{OwnerScope, ResourceKey};
pub use types::{NodeId, OwnerId, PhysAddr, PhysRange, VirtAddr};

use log::warn;

/// The remap subsystem: platform collaborators plus the section registry.
pub struct MemRemap<P> {
    platform: P,
    registry: SectionRegistry,
}

impl<P: Platform> MemRemap<P> {
    /// Creates a subsystem instance over `platform`.
    pub fn new(platform: P, config: RemapConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { platform, registry: SectionRegistry::new(config) })
    }

    /// Platform collaborators.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Section registry backing [`find_owner`](Self::find_owner).
    pub fn registry(&self) -> &SectionRegistry {
        &self.registry
    }

    /// Active configuration.
    pub fn config(&self) -> &RemapConfig {
        self.registry.config()
    }

    /// Maps `range` with the first acceptable policy in `flags`.
    ///
    /// See [`remap::remap`] for the negotiation order.
    pub fn remap(&self, range: &PhysRange, flags: MapFlags) -> remap::Result<VirtAddr> {
        remap::remap(&self.platform, range, flags)
    }

    /// Releases an address returned by [`remap`](Self::remap).
    pub fn unmap(&self, addr: VirtAddr) {
        remap::unmap(&self.platform, addr);
    }

    /// Like [`remap`](Self::remap), but unmapped when `scope` is torn down.
    pub fn scoped_remap<'a>(
        &'a self,
        scope: &OwnerScope<'a>,
        range: &PhysRange,
        flags: MapFlags,
    ) -> pages::Result<VirtAddr> {
        let addr = self.remap(range, flags)?;
        scope.bind(ResourceKey::Mapping(addr), move || self.unmap(addr));
        Ok(addr)
    }

    /// Releases a scoped mapping before its owner is torn down.
    ///
    /// Returns `false` (and warns) if `scope` holds no mapping at `addr`.
    pub fn scoped_unmap(&self, scope: &OwnerScope<'_>, addr: VirtAddr) -> bool {
        let released = scope.release(ResourceKey::Mapping(addr));
        if !released {
            warn!(target: "memremap", "{}: no scoped mapping at {addr}", scope.name());
        }
        released
    }
}
