//! Typed directives consumed by the orchestration controller.
//!
//! A batch is an ordered `Vec<VolumeDescriptor>`. Order is significant:
//! creation batches run journal, then source, then target, so later
//! descriptors can resolve identities produced by earlier ones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    ConsistencyGroupId, Personality, StoragePoolId, StorageSystemId, Volume, VolumeId,
};

/// What the controller is asked to do with the volume.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorAction {
    /// Provision a new volume.
    Create,
    /// Move an existing volume's data to a new placement.
    Migrate,
    /// Keep an existing volume and attach new protection metadata to it.
    ExistingReuse,
    /// Grow an existing volume.
    Expand,
    /// Remove an existing volume.
    Delete,
}

/// Subtype of a descriptor, telling the controller which workflow step
/// handles it.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    /// Protected production volume on an array.
    ProtectedSource,
    /// Protected production volume composed from backing volumes.
    VirtualSource,
    /// Protected replica on an array.
    ProtectedTarget,
    /// Protected replica composed from backing volumes.
    VirtualTarget,
    /// Journal on an array.
    Journal,
    /// Journal composed from backing volumes.
    VirtualJournal,
    /// Existing unprotected volume becoming a protected source.
    ExistingSource,
    /// Existing protected source receiving additional protection.
    ExistingProtectedSource,
    /// Unprotected composed volume.
    VirtualVolume,
    /// Plain array volume, including the backing legs of composed volumes.
    ArrayVolume,
    /// Data migration of a volume to a new placement.
    DataMigration,
    /// Placeholder anchoring a tier change whose sources do not move.
    PlaceholderMigration,
}

/// Keys of the free-form parameter bag.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorParam {
    /// Existing volume the descriptor replaces or reuses.
    ExistingVolume,
    /// Virtual pool the volume leaves.
    OldVirtualPool,
    /// Virtual pool the volume joins.
    NewVirtualPool,
    /// Journal serving the volume's copy.
    Journal,
    /// Journal serving the standby copy.
    StandbyJournal,
    /// Internal site of each backing leg, as `volume=site` pairs.
    BackingSites,
    /// Composed volume owning a backing leg.
    ParentVolume,
    /// Backend replication group migrated together.
    MigrationGroup,
    /// Replication mode requested by a copy mode change.
    CopyMode,
}

/// One typed directive for the orchestration controller.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeDescriptor {
    /// Requested action.
    pub action: DescriptorAction,
    /// Workflow subtype.
    pub kind: DescriptorKind,
    /// Storage system realising the volume.
    pub storage_system: Option<StorageSystemId>,
    /// Storage pool, absent for composed volumes.
    pub storage_pool: Option<StoragePoolId>,
    /// Volume identity.
    pub volume: VolumeId,
    /// Owning consistency group.
    pub consistency_group: Option<ConsistencyGroupId>,
    /// Replication role.
    pub personality: Personality,
    /// Capacity in bytes.
    pub capacity: u64,
    /// Cross-cutting directives.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<DescriptorParam, String>,
}

impl VolumeDescriptor {
    /// Creates a descriptor with an empty parameter bag.
    #[must_use]
    pub const fn new(
        action: DescriptorAction,
        kind: DescriptorKind,
        volume: VolumeId,
        personality: Personality,
        capacity: u64,
    ) -> Self {
        Self {
            action,
            kind,
            storage_system: None,
            storage_pool: None,
            volume,
            consistency_group: None,
            personality,
            capacity,
            params: BTreeMap::new(),
        }
    }

    /// Creates a descriptor addressing an existing record at its current
    /// placement.
    #[must_use]
    pub fn for_volume(
        action: DescriptorAction,
        kind: DescriptorKind,
        volume: &Volume,
        capacity: u64,
    ) -> Self {
        Self {
            storage_system: volume.storage_system.clone(),
            storage_pool: volume.storage_pool.clone(),
            consistency_group: volume.consistency_group.clone(),
            ..Self::new(action, kind, volume.id.clone(), volume.personality, capacity)
        }
    }

    /// Sets a parameter, replacing any earlier value.
    #[must_use]
    pub fn with_param(mut self, key: DescriptorParam, value: impl Into<String>) -> Self {
        self.params.insert(key, value.into());
        self
    }

    /// Returns a parameter value.
    #[must_use]
    pub fn param(&self, key: DescriptorParam) -> Option<&str> {
        self.params.get(&key).map(String::as_str)
    }
}

/// Returns the descriptors of a batch whose kind is one of `kinds`.
#[must_use]
pub fn filter_by_kind<'a>(
    descriptors: &'a [VolumeDescriptor],
    kinds: &[DescriptorKind],
) -> Vec<&'a VolumeDescriptor> {
    descriptors
        .iter()
        .filter(|descriptor| kinds.contains(&descriptor.kind))
        .collect()
}

/// Raised when a creation batch breaks journal → source → target order.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("descriptor {position} ({later:?} {volume}) follows a {earlier:?} descriptor")]
pub struct OrderingViolation {
    /// Zero-based position of the offending descriptor.
    pub position: usize,
    /// Volume of the offending descriptor.
    pub volume: VolumeId,
    /// Personality of the offending descriptor.
    pub later: Personality,
    /// Personality of the descriptor it should have preceded.
    pub earlier: Personality,
}

/// Position of a personality in creation order. Unprotected volumes sit
/// with the sources.
#[must_use]
pub const fn creation_rank(personality: Personality) -> u8 {
    match personality {
        Personality::Metadata => 0,
        Personality::Source | Personality::Plain => 1,
        Personality::Target => 2,
    }
}

/// Checks that a creation batch is ordered journal → source → target.
///
/// # Errors
///
/// Returns [`OrderingViolation`] naming the first descriptor that appears
/// after one of a later rank.
pub fn verify_creation_order(descriptors: &[VolumeDescriptor]) -> Result<(), OrderingViolation> {
    let mut highest: Option<Personality> = None;
    for (position, descriptor) in descriptors.iter().enumerate() {
        if let Some(earlier) = highest {
            if creation_rank(descriptor.personality) < creation_rank(earlier) {
                return Err(OrderingViolation {
                    position,
                    volume: descriptor.volume.clone(),
                    later: descriptor.personality,
                    earlier,
                });
            }
            if creation_rank(descriptor.personality) > creation_rank(earlier) {
                highest = Some(descriptor.personality);
            }
        } else {
            highest = Some(descriptor.personality);
        }
    }
    Ok(())
}
