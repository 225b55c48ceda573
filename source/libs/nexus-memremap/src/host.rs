// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-memory collaborator backend for host-first tests
//! PUBLIC API: HostPlatform, HostPlatformBuilder, DIRECT_MAP_BASE
//! INVARIANTS: Overlapping System-RAM extents count once; the direct map is
//!             linear (virt = DIRECT_MAP_BASE + phys) below the configured limit

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::HotplugError;
use crate::platform::{CachePolicy, MappingPrimitives, MemoryHotplug, RangeClassifier, RegionKind};
use crate::types::{NodeId, PhysRange, VirtAddr};

/// Virtual base of the linear map of physical memory.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;
/// Virtual base of the window fresh mappings are carved from.
pub const REMAP_WINDOW_BASE: u64 = 0xFFFF_C900_0000_0000;
/// Physical limit of the direct map unless configured otherwise (64 TiB).
pub const DEFAULT_DIRECT_MAP_LIMIT: u64 = 1 << 46;

const PAGE_MASK: u64 = 0xfff;

/// Builder for [`HostPlatform`].
#[derive(Debug, Default)]
pub struct HostPlatformBuilder {
    ram: Vec<PhysRange>,
    direct_map_limit: Option<u64>,
    refused: Vec<CachePolicy>,
    nodes: Vec<NodeId>,
    default_node: Option<NodeId>,
}

impl HostPlatformBuilder {
    /// Adds an extent of ordinary system memory.
    pub fn system_ram(mut self, range: PhysRange) -> Self {
        self.ram.push(range);
        self
    }

    /// Direct map covers physical addresses below `limit` only.
    pub fn direct_map_limit(mut self, limit: u64) -> Self {
        self.direct_map_limit = Some(limit);
        self
    }

    /// Makes `establish_mapping` return nothing for `policy`.
    pub fn refuse_policy(mut self, policy: CachePolicy) -> Self {
        self.refused.push(policy);
        self
    }

    /// Marks `node` as able to receive memory.
    pub fn online_node(mut self, node: NodeId) -> Self {
        self.nodes.push(node);
        self
    }

    /// Node used when no hint applies.
    pub fn default_node(mut self, node: NodeId) -> Self {
        self.default_node = Some(node);
        self
    }

    /// Finalizes the platform.
    pub fn build(mut self) -> HostPlatform {
        self.ram.sort_by_key(|range| range.start());
        let default_node = self.default_node.unwrap_or(NodeId::new(0));
        if !self.nodes.contains(&default_node) {
            self.nodes.push(default_node);
        }
        HostPlatform {
            ram: self.ram,
            direct_map_limit: self
                .direct_map_limit
                .unwrap_or(DEFAULT_DIRECT_MAP_LIMIT)
                .min(DEFAULT_DIRECT_MAP_LIMIT),
            refused: self.refused,
            nodes: self.nodes,
            default_node,
            state: Mutex::new(HostState {
                next_window: REMAP_WINDOW_BASE,
                mappings: HashMap::new(),
                visible: Vec::new(),
                hotplug_failure: None,
            }),
            establish_calls: AtomicUsize::new(0),
            teardown_calls: AtomicUsize::new(0),
        }
    }
}

struct HostState {
    next_window: u64,
    mappings: HashMap<VirtAddr, (PhysRange, CachePolicy)>,
    visible: Vec<(PhysRange, NodeId)>,
    hotplug_failure: Option<String>,
}

/// Simulated machine implementing every collaborator trait.
pub struct HostPlatform {
    ram: Vec<PhysRange>,
    direct_map_limit: u64,
    refused: Vec<CachePolicy>,
    nodes: Vec<NodeId>,
    default_node: NodeId,
    state: Mutex<HostState>,
    establish_calls: AtomicUsize,
    teardown_calls: AtomicUsize,
}

impl HostPlatform {
    /// Starts configuring a platform.
    pub fn builder() -> HostPlatformBuilder {
        HostPlatformBuilder::default()
    }

    /// Makes the next `make_visible` call fail with `reason`.
    pub fn fail_next_hotplug(&self, reason: impl Into<String>) {
        self.state.lock().hotplug_failure = Some(reason.into());
    }

    /// Number of `establish_mapping` calls so far.
    pub fn establish_calls(&self) -> usize {
        self.establish_calls.load(Ordering::SeqCst)
    }

    /// Number of `teardown_mapping` calls so far.
    pub fn teardown_calls(&self) -> usize {
        self.teardown_calls.load(Ordering::SeqCst)
    }

    /// Number of fresh mappings currently established.
    pub fn live_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Cache policy of the fresh mapping at `addr`.
    pub fn mapping_policy(&self, addr: VirtAddr) -> Option<CachePolicy> {
        self.state.lock().mappings.get(&addr).map(|(_, policy)| *policy)
    }

    /// Ranges currently made visible through hotplug, in onlining order.
    pub fn visible_ranges(&self) -> Vec<(PhysRange, NodeId)> {
        self.state.lock().visible.clone()
    }

    // Sweeps the sorted extents with a cursor so overlaps are not counted twice.
    fn covered_by_ram(&self, range: &PhysRange) -> u64 {
        let (lo, hi) = (range.start().as_u64(), range.last().as_u64());
        let mut cursor = lo;
        let mut covered = 0u64;
        for ram in &self.ram {
            let (start, last) = (ram.start().as_u64().max(cursor), ram.last().as_u64().min(hi));
            if start > hi {
                break;
            }
            if last < start {
                continue;
            }
            covered += last - start + 1;
            match last.checked_add(1) {
                Some(next) if next <= hi => cursor = next,
                _ => break,
            }
        }
        covered
    }
}

impl RangeClassifier for HostPlatform {
    fn classify(&self, range: &PhysRange) -> RegionKind {
        match self.covered_by_ram(range) {
            0 => RegionKind::Disjoint,
            covered if covered == range.len() => RegionKind::FullyKnownMemory,
            _ => RegionKind::Mixed,
        }
    }
}

impl MappingPrimitives for HostPlatform {
    fn establish_mapping(&self, range: &PhysRange, policy: CachePolicy) -> Option<VirtAddr> {
        self.establish_calls.fetch_add(1, Ordering::SeqCst);
        if self.refused.contains(&policy) {
            return None;
        }
        let offset = range.start().as_u64() & PAGE_MASK;
        let span = range.len().checked_add(offset)?.checked_add(PAGE_MASK)? & !PAGE_MASK;
        let mut state = self.state.lock();
        let base = state.next_window;
        state.next_window = base.checked_add(span)?;
        let addr = VirtAddr::new(base + offset);
        state.mappings.insert(addr, (*range, policy));
        Some(addr)
    }

    fn teardown_mapping(&self, addr: VirtAddr) {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().mappings.remove(&addr);
    }

    fn direct_map_address(&self, range: &PhysRange) -> Option<VirtAddr> {
        if range.last().as_u64() >= self.direct_map_limit {
            return None;
        }
        Some(VirtAddr::new(DIRECT_MAP_BASE + range.start().as_u64()))
    }

    fn is_direct_map_address(&self, addr: VirtAddr) -> bool {
        let raw = addr.as_u64();
        raw >= DIRECT_MAP_BASE && raw - DIRECT_MAP_BASE < self.direct_map_limit
    }
}

impl MemoryHotplug for HostPlatform {
    fn make_visible(&self, range: &PhysRange, node: NodeId) -> Result<(), HotplugError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.hotplug_failure.take() {
            return Err(HotplugError::new(reason));
        }
        if state.visible.iter().any(|(online, _)| online.overlaps(range)) {
            return Err(HotplugError::new(format!("{range} already online")));
        }
        state.visible.push((*range, node));
        Ok(())
    }

    fn revoke_visibility(&self, range: &PhysRange) {
        self.state.lock().visible.retain(|(online, _)| online != range);
    }

    fn node_online(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    fn default_node(&self) -> NodeId {
        self.default_node
    }
}
