//! Volume records as persisted by the store.

use serde::{Deserialize, Serialize};

use super::id::{
    ConsistencyGroupId, ProjectId, ProtectionSystemId, StoragePoolId, StorageSystemId,
    VirtualArrayId, VirtualPoolId, VolumeId,
};

/// Replication role carried by a volume.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Personality {
    /// Production volume whose writes are replicated.
    Source,
    /// Replica receiving the source's writes.
    Target,
    /// Journal volume tracking replication state for one copy.
    Metadata,
    /// Volume without a replication role.
    #[default]
    Plain,
}

impl Personality {
    /// Returns `true` for the roles that take part in capacity reconciliation.
    #[must_use]
    pub const fn is_data_copy(self) -> bool {
        matches!(self, Self::Source | Self::Target)
    }
}

/// Host access state recorded for a volume.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessState {
    /// Readable and writable by hosts.
    #[default]
    ReadWrite,
    /// Not accessible to hosts until failover.
    NotReady,
}

/// Volume record. The planner updates these but never owns their lifecycle
/// beyond the records it creates for a request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Volume {
    /// Record identity.
    pub id: VolumeId,
    /// Display label.
    pub label: String,
    /// Replication role.
    #[serde(default)]
    pub personality: Personality,
    /// Requested capacity in bytes.
    pub capacity: u64,
    /// Capacity allocated by the array in bytes, zero until provisioned.
    #[serde(default)]
    pub provisioned_capacity: u64,
    /// Owning storage system.
    #[serde(default)]
    pub storage_system: Option<StorageSystemId>,
    /// Storage pool, absent for composed volumes.
    #[serde(default)]
    pub storage_pool: Option<StoragePoolId>,
    /// Virtual array the volume belongs to.
    pub virtual_array: VirtualArrayId,
    /// Virtual pool (service tier) of the volume.
    pub virtual_pool: VirtualPoolId,
    /// Owning project.
    pub project: ProjectId,
    /// Owning consistency group.
    #[serde(default)]
    pub consistency_group: Option<ConsistencyGroupId>,
    /// Backing volumes of a composed volume.
    #[serde(default)]
    pub backing_volumes: Vec<VolumeId>,
    /// Backend replication group the volume is a member of.
    #[serde(default)]
    pub replication_group: Option<String>,
    /// Name of the replication copy the volume belongs to.
    #[serde(default)]
    pub copy_name: Option<String>,
    /// Internal site of the protection appliance serving the copy.
    #[serde(default)]
    pub internal_site: Option<String>,
    /// Replication set name shared by a source and its targets.
    #[serde(default)]
    pub replication_set: Option<String>,
    /// Journal of the active copy.
    #[serde(default)]
    pub journal: Option<VolumeId>,
    /// Journal of the standby copy in a dual-active topology.
    #[serde(default)]
    pub standby_journal: Option<VolumeId>,
    /// Targets protecting this source.
    #[serde(default)]
    pub protection_targets: Vec<VolumeId>,
    /// Protection appliance system replicating this volume.
    #[serde(default)]
    pub protection_system: Option<ProtectionSystemId>,
    /// Host access state.
    #[serde(default)]
    pub access: AccessState,
    /// Whether the volume is hidden from users.
    #[serde(default)]
    pub internal_object: bool,
    /// Whether the volume may be deleted forcibly.
    #[serde(default)]
    pub supports_force: bool,
    /// Set once the volume has been marked for deletion.
    #[serde(default)]
    pub inactive: bool,
}

impl Volume {
    /// Creates a plain volume record with no replication metadata.
    #[must_use]
    pub fn new(
        id: VolumeId,
        label: impl Into<String>,
        virtual_array: VirtualArrayId,
        virtual_pool: VirtualPoolId,
        project: ProjectId,
    ) -> Self {
        Self {
            id,
            label: label.into(),
            personality: Personality::Plain,
            capacity: 0,
            provisioned_capacity: 0,
            storage_system: None,
            storage_pool: None,
            virtual_array,
            virtual_pool,
            project,
            consistency_group: None,
            backing_volumes: Vec::new(),
            replication_group: None,
            copy_name: None,
            internal_site: None,
            replication_set: None,
            journal: None,
            standby_journal: None,
            protection_targets: Vec::new(),
            protection_system: None,
            access: AccessState::ReadWrite,
            internal_object: false,
            supports_force: false,
            inactive: false,
        }
    }

    /// Returns the size currently allocated for the volume: the provisioned
    /// capacity once known, otherwise the requested capacity.
    #[must_use]
    pub const fn allocated_size(&self) -> u64 {
        if self.provisioned_capacity > 0 {
            self.provisioned_capacity
        } else {
            self.capacity
        }
    }

    /// Returns `true` when the volume is composed from backing volumes.
    #[must_use]
    pub fn is_composed(&self) -> bool {
        !self.backing_volumes.is_empty()
    }

    /// Returns `true` when the record names a copy matching `copy_name`,
    /// ignoring ASCII case.
    #[must_use]
    pub fn in_copy(&self, copy_name: &str) -> bool {
        self.copy_name
            .as_deref()
            .is_some_and(|name| name.eq_ignore_ascii_case(copy_name))
    }
}
