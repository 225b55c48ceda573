// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy. Every failure is a returned value; none is fatal.

use thiserror::Error;

use crate::types::{OwnerId, PhysRange};

/// Errors from [`remap`](crate::remap::remap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RemapError {
    /// Range straddles ordinary memory and non-memory.
    #[error("remap attempted on mixed range {0}")]
    AmbiguousRegion(PhysRange),
    /// A fresh mapping would alias live ordinary memory.
    #[error("remap would alias system memory at {0}")]
    AliasingForbidden(PhysRange),
    /// Every requested strategy yielded nothing.
    #[error("no mapping established for {0}")]
    NoMappingEstablished(PhysRange),
}

/// Errors from [`SectionRegistry`](crate::registry::SectionRegistry) mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A section in the range is already claimed by another owner.
    #[error("section collides with claim held by {conflicting_owner}")]
    Collision {
        /// Owner of the existing entry.
        conflicting_owner: OwnerId,
    },
    /// Entry storage could not grow.
    #[error("section registry exhausted")]
    ResourceExhausted,
}

/// Failure reported by the hotplug collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("hotplug failed: {reason}")]
pub struct HotplugError {
    reason: String,
}

impl HotplugError {
    /// Creates an error carrying a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    /// Returns the reason given by the collaborator.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Errors from owner-bound operations (`claim_region`, `scoped_remap`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// Range straddles ordinary memory and non-memory.
    #[error("claim attempted on mixed range {0}")]
    AmbiguousRegion(PhysRange),
    /// A fresh mapping would alias live ordinary memory.
    #[error("mapping would alias system memory at {0}")]
    AliasingForbidden(PhysRange),
    /// No usable address could be produced for the range.
    #[error("no mapping established for {0}")]
    NoMappingEstablished(PhysRange),
    /// Some section of the range already belongs to another owner.
    #[error("range already claimed by {by}")]
    AlreadyClaimed {
        /// Owner holding the colliding section.
        by: OwnerId,
    },
    /// Registry storage exhausted; the caller may retry later.
    #[error("section registry exhausted")]
    ResourceExhausted,
    /// Making the range allocator-visible failed; the registry claim was undone.
    #[error(transparent)]
    HotplugFailed(#[from] HotplugError),
    /// Permanent claims are not compiled into this build.
    #[error("region claims unsupported in this build")]
    Unsupported,
}

impl From<RemapError> for ClaimError {
    fn from(value: RemapError) -> Self {
        match value {
            RemapError::AmbiguousRegion(range) => Self::AmbiguousRegion(range),
            RemapError::AliasingForbidden(range) => Self::AliasingForbidden(range),
            RemapError::NoMappingEstablished(range) => Self::NoMappingEstablished(range),
        }
    }
}

impl From<RegistryError> for ClaimError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::Collision { conflicting_owner } => {
                Self::AlreadyClaimed { by: conflicting_owner }
            }
            RegistryError::ResourceExhausted => Self::ResourceExhausted,
        }
    }
}

/// Rejected [`RemapConfig`](crate::config::RemapConfig) values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Section shift outside the supported window.
    #[error("section shift {0} out of range")]
    InvalidSectionShift(u32),
    /// A zero section limit would make every claim fail.
    #[error("section limit must be non-zero")]
    ZeroSectionLimit,
}
