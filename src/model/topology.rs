//! Storage topology records: arrays, pools, consistency groups.

use serde::{Deserialize, Serialize};

use super::id::{
    ConsistencyGroupId, ProtectionSystemId, StorageSystemId, VirtualArrayId, VirtualPoolId,
};

/// Array family determining how requested sizes are rounded to allocations.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFamily {
    /// Cylinder-addressed array, previous hardware generation.
    Vmax2,
    /// Cylinder-addressed array, current hardware generation.
    Vmax3,
    /// All-flash array allocating in whole mebibytes.
    Xtremio,
    /// Mid-range array allocating in 512-byte blocks.
    VnxBlock,
    /// Unified array allocating in 512-byte blocks.
    Unity,
    /// Virtualization cluster exposing composed volumes.
    Vplex,
    /// Array that allocates exactly what is requested.
    Generic,
}

impl StorageFamily {
    /// Returns the lowercase name used in logs and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Vmax2 => "vmax2",
            Self::Vmax3 => "vmax3",
            Self::Xtremio => "xtremio",
            Self::VnxBlock => "vnxblock",
            Self::Unity => "unity",
            Self::Vplex => "vplex",
            Self::Generic => "generic",
        }
    }

    /// Returns `true` for cylinder-addressed families.
    #[must_use]
    pub const fn is_cylinder_addressed(self) -> bool {
        matches!(self, Self::Vmax2 | Self::Vmax3)
    }
}

/// Physical array or virtualization cluster record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StorageSystem {
    /// Record identity.
    pub id: StorageSystemId,
    /// Display label.
    pub label: String,
    /// Allocation family.
    pub family: StorageFamily,
}

/// Virtual array record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VirtualArray {
    /// Record identity.
    pub id: VirtualArrayId,
    /// Display label, used when deriving copy and journal names.
    pub label: String,
}

/// Replication mode of a protected copy.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyMode {
    /// Writes acknowledged before replication.
    #[default]
    Asynchronous,
    /// Writes acknowledged after replication.
    Synchronous,
}

impl CopyMode {
    /// Returns the lowercase name used in descriptor parameters.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Asynchronous => "asynchronous",
            Self::Synchronous => "synchronous",
        }
    }
}

/// Protection settings of a virtual pool.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProtectionPolicy {
    /// Journal sizing policy for the production copy (for example `0.25x`).
    #[serde(default)]
    pub journal_policy: Option<String>,
    /// Journal sizing policy for the standby copy.
    #[serde(default)]
    pub standby_journal_policy: Option<String>,
    /// Whether both legs of a distributed source are protected.
    #[serde(default)]
    pub dual_active: bool,
    /// Replication mode.
    #[serde(default)]
    pub copy_mode: CopyMode,
}

/// High-availability settings of a virtual pool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HighAvailability {
    /// Virtual array hosting the second leg.
    pub virtual_array: VirtualArrayId,
    /// Virtual pool of the second leg, defaulting to the source pool.
    #[serde(default)]
    pub virtual_pool: Option<VirtualPoolId>,
    /// Whether the second leg, rather than the primary, is the protected side.
    #[serde(default)]
    pub protect_ha_side: bool,
}

/// Virtual pool (service tier) record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VirtualPool {
    /// Record identity.
    pub id: VirtualPoolId,
    /// Display label.
    pub label: String,
    /// Protection settings, absent for unprotected tiers.
    #[serde(default)]
    pub protection: Option<ProtectionPolicy>,
    /// High-availability settings, absent for local volumes.
    #[serde(default)]
    pub high_availability: Option<HighAvailability>,
}

/// Consistency group record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConsistencyGroup {
    /// Record identity.
    pub id: ConsistencyGroupId,
    /// Display label, used when deriving journal names and lock keys.
    pub label: String,
    /// Protection system replicating the group.
    #[serde(default)]
    pub protection_system: Option<ProtectionSystemId>,
}
