//! Placement proposals as produced by the scheduler.
//!
//! Proposals nest: a protected proposal wraps one [`CopyProposal`] per
//! replication copy, and each copy wraps the underlying array or virtual
//! placement chosen for it.

use serde::{Deserialize, Serialize};

use crate::model::{ProtectionSystemId, StoragePoolId, StorageSystemId, VirtualArrayId, VirtualPoolId};

const fn one() -> u32 {
    1
}

/// Where a single volume lands.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Placement {
    /// Virtual array hosting the volume.
    pub virtual_array: VirtualArrayId,
    /// Virtual pool (service tier) of the volume.
    pub virtual_pool: VirtualPoolId,
    /// Storage pool, absent for volumes on a virtualization cluster.
    #[serde(default)]
    pub storage_pool: Option<StoragePoolId>,
    /// Array or virtualization cluster.
    pub storage_system: StorageSystemId,
}

/// Scheduler output for one request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Proposal {
    /// Volumes placed directly on one array.
    Array(ArrayProposal),
    /// Composed volumes on a virtualization cluster.
    Virtual(VirtualProposal),
    /// Volumes protected by a replication appliance.
    Protected(ProtectedProposal),
}

/// Array placement.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ArrayProposal {
    /// Chosen array and pool.
    pub placement: Placement,
    /// Number of volumes the placement accommodates.
    #[serde(default = "one")]
    pub resource_count: u32,
    /// Size of each volume in bytes.
    pub size_bytes: u64,
}

/// Virtual placement. The first leg is the primary, the second (if any)
/// the high-availability leg.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VirtualProposal {
    /// Virtualization cluster and virtual array of the composed volume.
    pub placement: Placement,
    /// Number of volumes the placement accommodates.
    #[serde(default = "one")]
    pub resource_count: u32,
    /// Size of each volume in bytes.
    pub size_bytes: u64,
    /// Backing-volume placements.
    pub legs: Vec<ArrayProposal>,
}

/// One replication copy and the placement chosen for it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CopyProposal {
    /// Appliance site serving the copy.
    pub internal_site: String,
    /// Copy name chosen by the scheduler, if any.
    #[serde(default)]
    pub copy_name: Option<String>,
    /// Underlying placement; never itself a protected proposal.
    pub child: Box<Proposal>,
}

/// Dual-active standby copy with its own targets.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StandbyProposal {
    /// Standby production copy.
    pub copy: CopyProposal,
    /// Targets protecting the standby copy.
    #[serde(default)]
    pub targets: Vec<CopyProposal>,
}

/// Protected placement.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProtectedProposal {
    /// Appliance replicating the copies.
    pub protection_system: ProtectionSystemId,
    /// Production copy.
    pub source: CopyProposal,
    /// Remote and local target copies.
    #[serde(default)]
    pub targets: Vec<CopyProposal>,
    /// Journal of the production copy.
    #[serde(default)]
    pub source_journal: Option<CopyProposal>,
    /// Journal of the standby production copy.
    #[serde(default)]
    pub standby_journal: Option<CopyProposal>,
    /// One journal per target copy.
    #[serde(default)]
    pub target_journals: Vec<CopyProposal>,
    /// Dual-active standby copy.
    #[serde(default)]
    pub standby: Option<StandbyProposal>,
}
