// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Owning entity for scoped mappings and permanent claims
//! PUBLIC API: OwnerScope, ResourceKey
//! INVARIANTS: Every bound resource is released exactly once, either
//!             explicitly or at teardown; teardown runs newest first

use log::debug;
use parking_lot::Mutex;

use crate::types::{NodeId, OwnerId, PhysAddr, VirtAddr};

/// Identifies a resource bound to an [`OwnerScope`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    /// Scoped mapping, keyed by the address handed to the owner.
    Mapping(VirtAddr),
    /// Permanent region claim, keyed by the range's first byte.
    Region(PhysAddr),
}

struct Resource<'a> {
    key: ResourceKey,
    release: Box<dyn FnOnce() + Send + 'a>,
}

/// An entity that owns remapped memory for as long as it exists.
///
/// Dropping the scope (or calling [`teardown`](Self::teardown)) releases
/// every resource still bound to it, including on the owner's own error
/// paths. That is allowed while the same thread holds a
/// [`ReadSection`](crate::ReadSection).
pub struct OwnerScope<'a> {
    id: OwnerId,
    name: String,
    node: Option<NodeId>,
    resources: Mutex<Vec<Resource<'a>>>,
}

impl<'a> OwnerScope<'a> {
    /// Creates an empty scope for owner `id`.
    pub fn new(id: OwnerId, name: impl Into<String>) -> Self {
        Self { id, name: name.into(), node: None, resources: Mutex::new(Vec::new()) }
    }

    /// Records the NUMA node the owner is attached to.
    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    /// Owner identity.
    pub fn id(&self) -> OwnerId {
        self.id
    }

    /// Owner name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node the owner is attached to, if known.
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// Number of resources still bound.
    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    /// Returns `true` if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if a resource with `key` is bound.
    pub fn holds(&self, key: ResourceKey) -> bool {
        self.resources.lock().iter().any(|res| res.key == key)
    }

    /// Binds `release` to this scope under `key`.
    pub(crate) fn bind<F>(&self, key: ResourceKey, release: F)
    where
        F: FnOnce() + Send + 'a,
    {
        self.resources.lock().push(Resource { key, release: Box::new(release) });
    }

    /// Releases the most recently bound resource with `key` ahead of teardown.
    ///
    /// Returns `false` if no such resource is bound.
    pub fn release(&self, key: ResourceKey) -> bool {
        let found = {
            let mut resources = self.resources.lock();
            resources.iter().rposition(|res| res.key == key).map(|idx| resources.remove(idx))
        };
        match found {
            // Run outside the lock; release hooks may take other locks.
            Some(res) => {
                (res.release)();
                true
            }
            None => false,
        }
    }

    /// Releases everything and consumes the scope.
    pub fn teardown(self) {
        drop(self);
    }
}

impl Drop for OwnerScope<'_> {
    fn drop(&mut self) {
        let resources = core::mem::take(self.resources.get_mut());
        if !resources.is_empty() {
            debug!(target: "memremap", "{}: releasing {} resources", self.name, resources.len());
        }
        for res in resources.into_iter().rev() {
            (res.release)();
        }
    }
}
