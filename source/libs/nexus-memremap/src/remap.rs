// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cacheable remap negotiation for physical ranges
//! PUBLIC API: MapFlags, remap(), unmap()
//! DEPENDS_ON: RangeClassifier, MappingPrimitives
//! INVARIANTS: Mixed ranges never map; no fresh mapping ever aliases
//!             ordinary memory; write-back prefers the direct map

use bitflags::bitflags;
use log::{debug, error, warn};

use crate::error::RemapError;
use crate::platform::{CachePolicy, MappingPrimitives, RangeClassifier, RegionKind};
use crate::types::{PhysRange, VirtAddr};

/// Result alias for remap operations.
pub type Result<T> = core::result::Result<T, RemapError>;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Cache policies a caller will accept, tried in priority order.
    pub struct MapFlags: u32 {
        /// Matches the direct map; may be satisfied by reusing it.
        const WRITE_BACK = 1 << 0;
        /// Write-through; never allowed over ordinary memory.
        const WRITE_THROUGH = 1 << 1;
    }
}

/// Produces a usable mapping for `range`.
///
/// Steps run in a fixed order and each can short-circuit the next:
/// write-back first (direct map, then a fresh write-back mapping), then the
/// aliasing check for whatever flags remain, then write-through.
pub fn remap<P>(platform: &P, range: &PhysRange, flags: MapFlags) -> Result<VirtAddr>
where
    P: RangeClassifier + MappingPrimitives + ?Sized,
{
    let kind = platform.classify(range);
    if kind == RegionKind::Mixed {
        error!(target: "memremap", "remap attempted on mixed range {range}");
        return Err(RemapError::AmbiguousRegion(*range));
    }
    let is_memory = kind == RegionKind::FullyKnownMemory;

    let mut pending = flags;
    let mut addr = None;

    if pending.contains(MapFlags::WRITE_BACK) {
        pending.remove(MapFlags::WRITE_BACK);
        if is_memory {
            addr = platform.direct_map_address(range);
            if let Some(va) = addr {
                debug!(target: "memremap", "reusing direct map {va} for {range}");
            }
        }
        if addr.is_none() {
            addr = platform.establish_mapping(range, CachePolicy::WriteBack);
        }
    }

    // Anything still pending would be a brand-new mapping.
    if addr.is_none() && is_memory && !pending.is_empty() {
        warn!(target: "memremap", "remap attempted on system memory {range} with {pending:?}");
        return Err(RemapError::AliasingForbidden(*range));
    }

    if addr.is_none() && pending.contains(MapFlags::WRITE_THROUGH) {
        pending.remove(MapFlags::WRITE_THROUGH);
        addr = platform.establish_mapping(range, CachePolicy::WriteThrough);
    }

    addr.ok_or(RemapError::NoMappingEstablished(*range))
}

/// Releases an address returned by [`remap`].
///
/// Direct-map reuses own no mapping and are left untouched.
pub fn unmap<M>(mapper: &M, addr: VirtAddr)
where
    M: MappingPrimitives + ?Sized,
{
    if mapper.is_direct_map_address(addr) {
        return;
    }
    mapper.teardown_mapping(addr);
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use super::*;
    use crate::host::{HostPlatform, DIRECT_MAP_BASE};

    const RAM: (u64, u64) = (0x8000_0000, 0x9000_0000);

    fn platform() -> HostPlatform {
        HostPlatform::builder()
            .system_ram(PhysRange::from_bounds(RAM.0, RAM.1).unwrap())
            .direct_map_limit(0x8800_0000)
            .build()
    }

    #[test]
    fn write_back_on_memory_reuses_direct_map() {
        let host = platform();
        let range = PhysRange::new(0x8000_1000, 0x1000).unwrap();
        let va = remap(&host, &range, MapFlags::WRITE_BACK).expect("direct map");
        assert_eq!(va, VirtAddr::new(DIRECT_MAP_BASE + 0x8000_1000));
        assert_eq!(host.establish_calls(), 0);
    }

    #[test]
    fn write_back_falls_back_beyond_direct_map() {
        let host = platform();
        // Ordinary memory, but above the direct-map limit.
        let range = PhysRange::new(0x8800_0000, 0x1000).unwrap();
        let va = remap(&host, &range, MapFlags::WRITE_BACK).expect("fresh write-back");
        assert!(!host.is_direct_map_address(va));
        assert_eq!(host.establish_calls(), 1);
        assert_eq!(host.live_mappings(), 1);
        unmap(&host, va);
        assert_eq!(host.live_mappings(), 0);
    }

    #[test]
    fn write_through_on_memory_is_aliasing() {
        let host = platform();
        let range = PhysRange::new(0x8000_0000, 0x2000).unwrap();
        assert_eq!(
            remap(&host, &range, MapFlags::WRITE_THROUGH),
            Err(RemapError::AliasingForbidden(range))
        );
        assert_eq!(host.establish_calls(), 0);
    }

    #[test]
    fn write_through_after_failed_write_back_is_aliasing() {
        let host = HostPlatform::builder()
            .system_ram(PhysRange::from_bounds(RAM.0, RAM.1).unwrap())
            .direct_map_limit(RAM.0)
            .refuse_policy(CachePolicy::WriteBack)
            .build();
        let range = PhysRange::new(0x8000_0000, 0x1000).unwrap();
        let flags = MapFlags::WRITE_BACK | MapFlags::WRITE_THROUGH;
        assert_eq!(remap(&host, &range, flags), Err(RemapError::AliasingForbidden(range)));
        // Only the write-back attempt ran.
        assert_eq!(host.establish_calls(), 1);
    }

    #[test]
    fn device_range_gets_write_through() {
        let host = platform();
        let range = PhysRange::new(0x4000_0000, 0x1000).unwrap();
        let va = remap(&host, &range, MapFlags::WRITE_THROUGH).expect("wt mapping");
        assert_eq!(host.mapping_policy(va), Some(CachePolicy::WriteThrough));
    }

    #[test]
    fn device_range_falls_through_to_write_through() {
        let host = HostPlatform::builder()
            .system_ram(PhysRange::from_bounds(RAM.0, RAM.1).unwrap())
            .refuse_policy(CachePolicy::WriteBack)
            .build();
        let range = PhysRange::new(0x4000_0000, 0x1000).unwrap();
        let va = remap(&host, &range, MapFlags::WRITE_BACK | MapFlags::WRITE_THROUGH)
            .expect("second choice");
        assert_eq!(host.mapping_policy(va), Some(CachePolicy::WriteThrough));
        assert_eq!(host.establish_calls(), 2);
    }

    #[test]
    fn mixed_range_is_rejected_without_mapping() {
        let host = platform();
        let range = PhysRange::from_bounds(RAM.0 - 0x1000, RAM.0 + 0x1000).unwrap();
        for flags in [MapFlags::WRITE_BACK, MapFlags::WRITE_THROUGH, MapFlags::all()] {
            assert_eq!(remap(&host, &range, flags), Err(RemapError::AmbiguousRegion(range)));
        }
        assert_eq!(host.establish_calls(), 0);
    }

    #[test]
    fn empty_flags_establish_nothing() {
        let host = platform();
        let range = PhysRange::new(0x4000_0000, 0x1000).unwrap();
        assert_eq!(
            remap(&host, &range, MapFlags::empty()),
            Err(RemapError::NoMappingEstablished(range))
        );
    }

    #[test]
    fn unmap_ignores_direct_map() {
        let host = platform();
        let range = PhysRange::new(0x8000_0000, 0x1000).unwrap();
        let va = remap(&host, &range, MapFlags::WRITE_BACK).unwrap();
        unmap(&host, va);
        assert_eq!(host.teardown_calls(), 0);
    }
}
