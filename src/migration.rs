//! Replication-group aware migration planning.
//!
//! A backend replication group migrates as a unit: a request names every
//! member of the group or none of them. A composed volume belongs to the
//! replication group of every grouped backing volume it has.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::descriptor::{
    DescriptorAction, DescriptorKind, DescriptorParam, VolumeDescriptor, creation_rank,
};
use crate::model::{Personality, StorageSystemId, VirtualPoolId, Volume, VolumeId};
use crate::recommendation::Placement;
use crate::store::{StoreError, VolumeStore};

/// Errors raised while grouping migrations.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum MigrationError {
    /// Raised when a request names only part of a replication group.
    #[error(
        "replication group {group} on {storage_system} must migrate as a whole; missing {}",
        display_ids(.missing)
    )]
    PartialGroup {
        /// Storage system owning the group.
        storage_system: StorageSystemId,
        /// Replication group name.
        group: String,
        /// Members absent from the request.
        missing: Vec<VolumeId>,
    },
    /// Raised when a volume cannot be read.
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn display_ids(ids: &[VolumeId]) -> String {
    ids.iter()
        .map(VolumeId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Identity of a backend replication group.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct GroupKey {
    /// Storage system owning the group.
    pub storage_system: StorageSystemId,
    /// Group name on that system.
    pub replication_group: String,
}

impl GroupKey {
    /// Returns the `<system>/<group>` form recorded in descriptor parameters.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.storage_system, self.replication_group)
    }
}

/// Candidate volumes split into complete groups and independent volumes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Partition {
    /// Volumes migrating together, by group.
    pub grouped: BTreeMap<GroupKey, Vec<Volume>>,
    /// Volumes outside any replication group.
    pub ungrouped: Vec<Volume>,
}

impl Partition {
    /// Returns the group `volume` was placed in, if any.
    #[must_use]
    pub fn group_of(&self, volume: &VolumeId) -> Option<&GroupKey> {
        self.grouped
            .iter()
            .find(|(_, members)| members.iter().any(|member| &member.id == volume))
            .map(|(key, _)| key)
    }
}

/// New placement requested for one volume.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MigrationTarget {
    /// Volume to move.
    pub volume: VolumeId,
    /// Placement it moves to.
    pub target: Placement,
}

#[derive(Default)]
struct Bucket {
    candidates: Vec<Volume>,
    physical: BTreeSet<VolumeId>,
}

/// Partitions migration candidates by replication group.
#[derive(Debug)]
pub struct MigrationGrouper<'a, S> {
    store: &'a S,
}

impl<'a, S> MigrationGrouper<'a, S>
where
    S: VolumeStore,
{
    /// Creates a grouper reading group membership from `store`.
    #[must_use]
    pub const fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Splits `volumes` into complete replication groups and ungrouped
    /// volumes.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::PartialGroup`] when a group is only partly
    /// present and [`MigrationError::Store`] when membership cannot be read.
    pub fn partition(&self, volumes: &[Volume]) -> Result<Partition, MigrationError> {
        let mut buckets: BTreeMap<GroupKey, Bucket> = BTreeMap::new();
        let mut partition = Partition::default();
        for volume in volumes {
            let keys = self.group_keys(volume)?;
            if keys.is_empty() {
                partition.ungrouped.push(volume.clone());
            }
            for (key, physical) in keys {
                let bucket = buckets.entry(key).or_default();
                bucket.physical.insert(physical);
                if !bucket.candidates.iter().any(|candidate| candidate.id == volume.id) {
                    bucket.candidates.push(volume.clone());
                }
            }
        }

        for (key, bucket) in buckets {
            let members: BTreeSet<VolumeId> = self
                .store
                .volumes_in_replication_group(&key.storage_system, &key.replication_group)?
                .into_iter()
                .map(|member| member.id)
                .collect();
            let missing: Vec<VolumeId> = members.difference(&bucket.physical).cloned().collect();
            if !missing.is_empty() {
                return Err(MigrationError::PartialGroup {
                    storage_system: key.storage_system,
                    group: key.replication_group,
                    missing,
                });
            }
            debug!(group = %key.label(), members = members.len(), "replication group is complete");
            partition.grouped.insert(key, bucket.candidates);
        }
        Ok(partition)
    }

    /// Plans the migration descriptors of a tier change.
    ///
    /// `request_volumes` are the volumes the tier change was requested for;
    /// `migrations` name the volumes that physically move. When only
    /// targets or journals move, the requested sources are still checked
    /// for group completeness and anchored by placeholder descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::PartialGroup`] when any role's volumes
    /// cover a replication group only partly, and [`MigrationError::Store`]
    /// when a record cannot be read.
    pub fn plan(
        &self,
        request_volumes: &[VolumeId],
        migrations: &[MigrationTarget],
        new_pool: &VirtualPoolId,
    ) -> Result<Vec<VolumeDescriptor>, MigrationError> {
        let mut by_role: BTreeMap<Personality, Vec<(Volume, &MigrationTarget)>> = BTreeMap::new();
        for migration in migrations {
            let volume = self.store.require_volume(&migration.volume)?;
            by_role
                .entry(volume.personality)
                .or_default()
                .push((volume, migration));
        }

        let mut descriptors = Vec::new();
        for moving in by_role.values() {
            let volumes: Vec<Volume> = moving.iter().map(|(volume, _)| volume.clone()).collect();
            let partition = self.partition(&volumes)?;
            for (volume, migration) in moving {
                let mut descriptor = VolumeDescriptor::new(
                    DescriptorAction::Migrate,
                    DescriptorKind::DataMigration,
                    volume.id.clone(),
                    volume.personality,
                    volume.capacity,
                )
                .with_param(DescriptorParam::NewVirtualPool, new_pool.as_str())
                .with_param(DescriptorParam::OldVirtualPool, volume.virtual_pool.as_str());
                descriptor.storage_system = Some(migration.target.storage_system.clone());
                descriptor.storage_pool.clone_from(&migration.target.storage_pool);
                descriptor.consistency_group.clone_from(&volume.consistency_group);
                if let Some(key) = partition.group_of(&volume.id) {
                    descriptor = descriptor.with_param(DescriptorParam::MigrationGroup, key.label());
                }
                descriptors.push(descriptor);
            }
        }

        if !by_role.contains_key(&Personality::Source) && !by_role.is_empty() {
            let sources: Vec<Volume> = self
                .store
                .require_volumes(request_volumes)?
                .into_iter()
                .filter(|volume| volume.personality == Personality::Source)
                .collect();
            self.partition(&sources)?;
            info!(sources = sources.len(), "sources stay in place; anchoring with placeholders");
            for source in sources {
                let mut descriptor = VolumeDescriptor::new(
                    DescriptorAction::Migrate,
                    DescriptorKind::PlaceholderMigration,
                    source.id.clone(),
                    source.personality,
                    source.capacity,
                )
                .with_param(DescriptorParam::NewVirtualPool, new_pool.as_str());
                descriptor.storage_system.clone_from(&source.storage_system);
                descriptor.consistency_group.clone_from(&source.consistency_group);
                descriptors.push(descriptor);
            }
        }
        descriptors.sort_by_key(|descriptor| creation_rank(descriptor.personality));
        Ok(descriptors)
    }

    /// Returns every replication group `volume` belongs to, each with the
    /// physical volume carrying the membership.
    fn group_keys(&self, volume: &Volume) -> Result<Vec<(GroupKey, VolumeId)>, MigrationError> {
        if let Some(key) = direct_key(volume) {
            return Ok(vec![(key, volume.id.clone())]);
        }
        let mut keys = Vec::new();
        for backing in &volume.backing_volumes {
            let leg = self.store.require_volume(backing)?;
            if let Some(key) = direct_key(&leg) {
                keys.push((key, leg.id));
            }
        }
        Ok(keys)
    }
}

fn direct_key(volume: &Volume) -> Option<GroupKey> {
    match (&volume.storage_system, &volume.replication_group) {
        (Some(system), Some(group)) => Some(GroupKey {
            storage_system: system.clone(),
            replication_group: group.clone(),
        }),
        _ => None,
    }
}
