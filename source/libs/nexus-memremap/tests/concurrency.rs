//! CONTEXT: Concurrency tests for lock-free owner lookup
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 4 integration tests
//!
//! TEST_SCOPE:
//!   - Readers racing claim/release churn only observe whole records
//!   - Release never waits for readers, on this or any other thread
//!   - Registry entry is gone before allocator visibility is revoked
//!
//! TEST_SCENARIOS:
//!   - readers_race_claim_churn(): writers claim and unclaim, readers look up
//!   - release_does_not_wait_for_readers(): a pinned record outlives unclaim
//!   - release_on_reading_thread_returns(): unclaim and teardown inside a read section
//!   - registry_cleared_before_revoke(): wrapping platform observes the order
//!
//! DEPENDENCIES:
//!   - nexus_memremap::host::HostPlatform: in-memory collaborators
//!   - nexus_memremap::MemRemap: claim_region, unclaim_region, find_owner
//!   - std::thread::scope: reader/writer threads

#![cfg(all(feature = "backend-host", feature = "zone-device"))]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use nexus_memremap::host::HostPlatform;
use nexus_memremap::{
    CachePolicy, HotplugError, MappingPrimitives, MemRemap, MemoryHotplug, NodeId, OwnerId,
    OwnerScope, PhysAddr, PhysRange, RangeClassifier, RegionKind, RemapConfig, VirtAddr,
};

const SECTION_SHIFT: u32 = 21;
const SECTION: u64 = 1 << SECTION_SHIFT;

fn subsystem() -> MemRemap<HostPlatform> {
    let host = HostPlatform::builder()
        .system_ram(PhysRange::from_bounds(0x8000_0000, 0x1_0000_0000).unwrap())
        .build();
    MemRemap::new(host, RemapConfig::new().with_section_shift(SECTION_SHIFT)).unwrap()
}

#[test]
fn readers_race_claim_churn() {
    const WRITERS: u64 = 3;
    const ROUNDS: usize = 200;

    let remap = subsystem();
    let stop = AtomicBool::new(false);
    let range_of = |idx: u64| PhysRange::new(0x1000_0000 + idx * 4 * SECTION, 2 * SECTION).unwrap();

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    let read = remap.read_section();
                    for idx in 0..WRITERS {
                        let range = range_of(idx);
                        let addrs = [range.start().as_u64(), range.last().as_u64()];
                        for addr in addrs {
                            if let Some(record) = remap.find_owner(&read, PhysAddr::new(addr)) {
                                assert_eq!(record.owner(), OwnerId::new(idx + 1));
                                assert_eq!(record.label(), format!("dev{idx}"));
                                assert_eq!(record.range(), range);
                            }
                        }
                    }
                }
            });
        }

        let writers: Vec<_> = (0..WRITERS)
            .map(|idx| {
                let remap = &remap;
                s.spawn(move || {
                    let scope = OwnerScope::new(OwnerId::new(idx + 1), format!("dev{idx}"));
                    let range = range_of(idx);
                    for _ in 0..ROUNDS {
                        remap.claim_region(&scope, range, None).expect("claim");
                        thread::yield_now();
                        assert!(remap.unclaim_region(&scope, range.start()));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer panicked");
        }
        stop.store(true, Ordering::Release);
    });

    assert!(remap.registry().is_empty());
    assert!(remap.platform().visible_ranges().is_empty());
}

#[test]
fn release_does_not_wait_for_readers() {
    let remap = subsystem();
    let scope = OwnerScope::new(OwnerId::new(1), "pmem0");
    let range = PhysRange::new(0x1000_0000, SECTION).unwrap();
    remap.claim_region(&scope, range, None).unwrap();

    let read = remap.read_section();
    let record = remap.find_owner(&read, range.start()).expect("claimed");
    thread::scope(|s| {
        let released = s.spawn(|| remap.unclaim_region(&scope, range.start()));
        assert!(released.join().expect("release finished"));
    });

    assert_eq!(record.label(), "pmem0");
    assert_eq!(record.range(), range);
    assert!(remap.registry().lookup(range.start()).is_none());
    assert!(remap.platform().visible_ranges().is_empty());
    drop(read);
    assert_eq!(remap.registry().retired_snapshots(), 0);
}

#[test]
fn release_on_reading_thread_returns() {
    let remap = Arc::new(subsystem());
    let first = PhysRange::new(0x1000_0000, SECTION).unwrap();
    let second = PhysRange::new(0x2000_0000, SECTION).unwrap();
    let (done_tx, done_rx) = mpsc::channel();

    // Detached so a hang fails the test instead of blocking it.
    let worker = Arc::clone(&remap);
    thread::spawn(move || {
        let remap = &*worker;
        let scope = OwnerScope::new(OwnerId::new(2), "cxl0");
        remap.claim_region(&scope, first, None).unwrap();
        remap.claim_region(&scope, second, None).unwrap();

        let read = remap.read_section();
        assert!(remap.find_owner(&read, first.start()).is_some());
        assert!(remap.unclaim_region(&scope, first.start()));
        // Error-path teardown while the section is still open.
        drop(scope);
        let owner = remap.find_owner(&read, second.start()).map(|record| record.owner());
        assert_eq!(owner, Some(OwnerId::new(2)));
        drop(read);
        done_tx.send(()).expect("receiver alive");
    });
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("release on the reading thread returned");

    assert!(remap.registry().is_empty());
    assert!(remap.platform().visible_ranges().is_empty());
    assert_eq!(remap.registry().retired_snapshots(), 0);
}

/// Host platform that looks the range up again while it is being revoked.
struct RevokeObserver {
    host: HostPlatform,
    subsystem: OnceLock<&'static MemRemap<RevokeObserver>>,
    resolved_at_revoke: Mutex<Vec<bool>>,
}

impl RangeClassifier for RevokeObserver {
    fn classify(&self, range: &PhysRange) -> RegionKind {
        self.host.classify(range)
    }
}

impl MappingPrimitives for RevokeObserver {
    fn establish_mapping(&self, range: &PhysRange, policy: CachePolicy) -> Option<VirtAddr> {
        self.host.establish_mapping(range, policy)
    }

    fn teardown_mapping(&self, addr: VirtAddr) {
        self.host.teardown_mapping(addr);
    }

    fn direct_map_address(&self, range: &PhysRange) -> Option<VirtAddr> {
        self.host.direct_map_address(range)
    }

    fn is_direct_map_address(&self, addr: VirtAddr) -> bool {
        self.host.is_direct_map_address(addr)
    }
}

impl MemoryHotplug for RevokeObserver {
    fn make_visible(&self, range: &PhysRange, node: NodeId) -> Result<(), HotplugError> {
        self.host.make_visible(range, node)
    }

    fn revoke_visibility(&self, range: &PhysRange) {
        if let Some(remap) = self.subsystem.get() {
            let read = remap.read_section();
            let resolved = remap.find_owner(&read, range.start()).is_some();
            self.resolved_at_revoke.lock().push(resolved);
        }
        self.host.revoke_visibility(range);
    }

    fn node_online(&self, node: NodeId) -> bool {
        self.host.node_online(node)
    }

    fn default_node(&self) -> NodeId {
        self.host.default_node()
    }
}

#[test]
fn registry_cleared_before_revoke() {
    let observer = RevokeObserver {
        host: HostPlatform::builder().build(),
        subsystem: OnceLock::new(),
        resolved_at_revoke: Mutex::new(Vec::new()),
    };
    let config = RemapConfig::new().with_section_shift(SECTION_SHIFT);
    let remap: &'static MemRemap<RevokeObserver> =
        Box::leak(Box::new(MemRemap::new(observer, config).unwrap()));
    let _ = remap.platform().subsystem.set(remap);

    let first = PhysRange::new(0x2000_0000, SECTION).unwrap();
    let second = PhysRange::new(0x3000_0000, SECTION).unwrap();
    {
        let scope = OwnerScope::new(OwnerId::new(3), "cxl1");
        remap.claim_region(&scope, first, None).unwrap();
        remap.claim_region(&scope, second, None).unwrap();
        assert!(remap.unclaim_region(&scope, first.start()));
    }

    assert_eq!(*remap.platform().resolved_at_revoke.lock(), vec![false, false]);
    assert!(remap.platform().host.visible_ranges().is_empty());
}
