//! Normalized recommendations consumed by the descriptor compiler.
//!
//! The scheduler's [`Proposal`] tree nests copies around array choices.
//! [`PlacementAdapter`] flattens it into [`Recommendation`] values whose
//! leaves carry everything naming and descriptor logic need, with the
//! high-availability swap already applied.

use serde::Serialize;
use thiserror::Error;

use crate::model::{ProtectionSystemId, VirtualArrayId};
use crate::store::StoreError;

mod adapter;
mod proposal;

pub use adapter::{PlacementAdapter, SwapPolicy};
pub use proposal::{
    ArrayProposal, CopyProposal, Placement, ProtectedProposal, Proposal, StandbyProposal,
    VirtualProposal,
};

/// Errors raised while normalizing proposals.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum PlacementError {
    /// Raised when the scheduler produced no proposals.
    #[error("no placement recommendations are available for the request")]
    Exhausted,
    /// Raised when a proposal nests in a way the compiler cannot expand.
    #[error("invalid recommendation: {reason}")]
    InvalidShape {
        /// Description of the offending proposal.
        reason: String,
    },
    /// Raised when the requested pool cannot be read.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Placement of one family of identical volumes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Leaf {
    /// Placement of the volume itself.
    pub placement: Placement,
    /// Number of volumes to create; each becomes its own descriptor.
    pub resource_count: u32,
    /// Size of each volume in bytes.
    pub size_bytes: u64,
    /// Appliance site, for protected copies.
    pub internal_site: Option<String>,
    /// Copy name proposed by the scheduler, for protected copies.
    pub copy_name: Option<String>,
    /// Backing legs of a composed volume, primary first.
    pub backing: Vec<Placement>,
}

impl Leaf {
    /// Returns the virtual array of the leaf.
    #[must_use]
    pub const fn virtual_array(&self) -> &VirtualArrayId {
        &self.placement.virtual_array
    }
}

/// Copy a journal recommendation belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalRole {
    /// Journal of the active production copy.
    Source,
    /// Journal of the dual-active standby copy.
    Standby,
    /// Journal of a target copy.
    Target,
}

impl JournalRole {
    /// Returns the lowercase name used in logs and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Standby => "standby",
            Self::Target => "target",
        }
    }
}

/// Placement of one journal.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct JournalRecommendation {
    /// Copy served by the journal.
    pub role: JournalRole,
    /// Journal placement.
    pub leaf: Leaf,
}

/// Standby production copy of a dual-active topology.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct StandbyRecommendation {
    /// Standby copy placement.
    pub leaf: Leaf,
    /// Targets of the standby copy.
    pub targets: Vec<Leaf>,
}

/// Protected recommendation: a source and the copies replicating it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProtectedRecommendation {
    /// Appliance replicating the copies.
    pub protection_system: ProtectionSystemId,
    /// Production copy.
    pub source: Leaf,
    /// Target copies.
    pub targets: Vec<Leaf>,
    /// Journals of every copy.
    pub journals: Vec<JournalRecommendation>,
    /// Dual-active standby copy.
    pub standby: Option<StandbyRecommendation>,
}

impl ProtectedRecommendation {
    /// Returns the first journal recommended for `role`.
    #[must_use]
    pub fn journal(&self, role: JournalRole) -> Option<&Leaf> {
        self.journals
            .iter()
            .find(|journal| journal.role == role)
            .map(|journal| &journal.leaf)
    }

    /// Returns the journal recommended for the target copy in `virtual_array`.
    #[must_use]
    pub fn target_journal(&self, virtual_array: &VirtualArrayId) -> Option<&Leaf> {
        self.journals
            .iter()
            .find(|journal| {
                journal.role == JournalRole::Target && journal.leaf.virtual_array() == virtual_array
            })
            .map(|journal| &journal.leaf)
    }
}

/// Normalized recommendation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recommendation {
    /// Volumes without replication.
    Unprotected(Leaf),
    /// Volumes replicated by an appliance.
    Protected(ProtectedRecommendation),
}
