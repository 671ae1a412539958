//! Process-local store used for dry-run planning and tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::{StoreError, VolumeStore};
use crate::model::{
    ConsistencyGroup, ConsistencyGroupId, StorageSystem, StorageSystemId, VirtualArray,
    VirtualArrayId, VirtualPool, VirtualPoolId, Volume, VolumeId,
};

/// Serialisable contents of an [`InMemoryStore`].
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct StoreSnapshot {
    /// Volume records, including inactive ones.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Storage system records.
    #[serde(default)]
    pub storage_systems: Vec<StorageSystem>,
    /// Virtual array records.
    #[serde(default)]
    pub virtual_arrays: Vec<VirtualArray>,
    /// Virtual pool records.
    #[serde(default)]
    pub virtual_pools: Vec<VirtualPool>,
    /// Consistency group records.
    #[serde(default)]
    pub consistency_groups: Vec<ConsistencyGroup>,
    /// Snapshot counts keyed by volume.
    #[serde(default)]
    pub snapshots: BTreeMap<VolumeId, usize>,
}

#[derive(Debug, Default)]
struct State {
    volumes: BTreeMap<VolumeId, Volume>,
    storage_systems: BTreeMap<StorageSystemId, StorageSystem>,
    virtual_arrays: BTreeMap<VirtualArrayId, VirtualArray>,
    virtual_pools: BTreeMap<VirtualPoolId, VirtualPool>,
    consistency_groups: BTreeMap<ConsistencyGroupId, ConsistencyGroup>,
    snapshots: BTreeMap<VolumeId, usize>,
}

impl From<StoreSnapshot> for State {
    fn from(snapshot: StoreSnapshot) -> Self {
        Self {
            volumes: snapshot
                .volumes
                .into_iter()
                .map(|volume| (volume.id.clone(), volume))
                .collect(),
            storage_systems: snapshot
                .storage_systems
                .into_iter()
                .map(|system| (system.id.clone(), system))
                .collect(),
            virtual_arrays: snapshot
                .virtual_arrays
                .into_iter()
                .map(|varray| (varray.id.clone(), varray))
                .collect(),
            virtual_pools: snapshot
                .virtual_pools
                .into_iter()
                .map(|vpool| (vpool.id.clone(), vpool))
                .collect(),
            consistency_groups: snapshot
                .consistency_groups
                .into_iter()
                .map(|group| (group.id.clone(), group))
                .collect(),
            snapshots: snapshot.snapshots,
        }
    }
}

/// Store holding every record in memory behind a shared mutex.
///
/// Clones share the same records, so a test can keep a handle for
/// assertions while the orchestrator owns another.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::from(snapshot))),
        }
    }

    /// Returns the current contents as a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the store lock is poisoned.
    pub fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let state = self.lock()?;
        Ok(StoreSnapshot {
            volumes: state.volumes.values().cloned().collect(),
            storage_systems: state.storage_systems.values().cloned().collect(),
            virtual_arrays: state.virtual_arrays.values().cloned().collect(),
            virtual_pools: state.virtual_pools.values().cloned().collect(),
            consistency_groups: state.consistency_groups.values().cloned().collect(),
            snapshots: state.snapshots.clone(),
        })
    }

    /// Inserts or replaces a storage system record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the store lock is poisoned.
    pub fn put_storage_system(&self, system: StorageSystem) -> Result<(), StoreError> {
        self.lock()?.storage_systems.insert(system.id.clone(), system);
        Ok(())
    }

    /// Inserts or replaces a virtual array record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the store lock is poisoned.
    pub fn put_virtual_array(&self, varray: VirtualArray) -> Result<(), StoreError> {
        self.lock()?.virtual_arrays.insert(varray.id.clone(), varray);
        Ok(())
    }

    /// Inserts or replaces a virtual pool record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the store lock is poisoned.
    pub fn put_virtual_pool(&self, vpool: VirtualPool) -> Result<(), StoreError> {
        self.lock()?.virtual_pools.insert(vpool.id.clone(), vpool);
        Ok(())
    }

    /// Inserts or replaces a consistency group record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the store lock is poisoned.
    pub fn put_consistency_group(&self, group: ConsistencyGroup) -> Result<(), StoreError> {
        self.lock()?.consistency_groups.insert(group.id.clone(), group);
        Ok(())
    }

    /// Inserts or replaces a volume record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the store lock is poisoned.
    pub fn put_volume(&self, volume: Volume) -> Result<(), StoreError> {
        self.lock()?.volumes.insert(volume.id.clone(), volume);
        Ok(())
    }

    /// Records the number of snapshots a volume has.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the store lock is poisoned.
    pub fn set_snapshot_count(&self, volume: &VolumeId, count: usize) -> Result<(), StoreError> {
        self.lock()?.snapshots.insert(volume.clone(), count);
        Ok(())
    }

    /// Returns the identities of every volume marked for deletion.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the store lock is poisoned.
    pub fn inactive_volumes(&self) -> Result<Vec<VolumeId>, StoreError> {
        Ok(self
            .lock()?
            .volumes
            .values()
            .filter(|volume| volume.inactive)
            .map(|volume| volume.id.clone())
            .collect())
    }

    /// Returns the active volumes satisfying `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the store lock is poisoned.
    pub fn active_volumes_where(
        &self,
        predicate: impl Fn(&Volume) -> bool,
    ) -> Result<Vec<Volume>, StoreError> {
        Ok(self
            .lock()?
            .volumes
            .values()
            .filter(|volume| !volume.inactive && predicate(volume))
            .cloned()
            .collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|err| StoreError::Unavailable(format!("store lock poisoned: {err}")))
    }
}

impl VolumeStore for InMemoryStore {
    fn volume(&self, id: &VolumeId) -> Result<Option<Volume>, StoreError> {
        Ok(self.lock()?.volumes.get(id).cloned())
    }

    fn create_volume(&self, volume: Volume) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.volumes.contains_key(&volume.id) {
            return Err(StoreError::Duplicate {
                kind: "volume",
                id: volume.id.to_string(),
            });
        }
        state.volumes.insert(volume.id.clone(), volume);
        Ok(())
    }

    fn update_volume(&self, volume: &Volume) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let Some(existing) = state.volumes.get_mut(&volume.id) else {
            return Err(StoreError::not_found("volume", &volume.id));
        };
        volume.clone_into(existing);
        Ok(())
    }

    fn mark_for_deletion(&self, id: &VolumeId) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let Some(existing) = state.volumes.get_mut(id) else {
            return Err(StoreError::not_found("volume", id));
        };
        existing.inactive = true;
        Ok(())
    }

    fn storage_system(&self, id: &StorageSystemId) -> Result<Option<StorageSystem>, StoreError> {
        Ok(self.lock()?.storage_systems.get(id).cloned())
    }

    fn virtual_array(&self, id: &VirtualArrayId) -> Result<Option<VirtualArray>, StoreError> {
        Ok(self.lock()?.virtual_arrays.get(id).cloned())
    }

    fn virtual_pool(&self, id: &VirtualPoolId) -> Result<Option<VirtualPool>, StoreError> {
        Ok(self.lock()?.virtual_pools.get(id).cloned())
    }

    fn consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<Option<ConsistencyGroup>, StoreError> {
        Ok(self.lock()?.consistency_groups.get(id).cloned())
    }

    fn volumes_in_consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<Vec<Volume>, StoreError> {
        self.active_volumes_where(|volume| volume.consistency_group.as_ref() == Some(id))
    }

    fn volumes_in_replication_group(
        &self,
        system: &StorageSystemId,
        group: &str,
    ) -> Result<Vec<Volume>, StoreError> {
        self.active_volumes_where(|volume| {
            volume.storage_system.as_ref() == Some(system)
                && volume.replication_group.as_deref() == Some(group)
        })
    }

    fn snapshot_count(&self, volume: &VolumeId) -> Result<usize, StoreError> {
        Ok(self.lock()?.snapshots.get(volume).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::model::{ProjectId, StorageFamily};

    #[fixture]
    fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .put_storage_system(StorageSystem {
                id: StorageSystemId::new("array-1"),
                label: String::from("array-1"),
                family: StorageFamily::Vmax3,
            })
            .unwrap_or_else(|err| panic!("seed storage system: {err}"));
        store
    }

    fn volume(id: &str, group: Option<&str>) -> Volume {
        let mut volume = Volume::new(
            VolumeId::new(id),
            id,
            VirtualArrayId::new("varray-1"),
            VirtualPoolId::new("vpool-1"),
            ProjectId::new("project"),
        );
        volume.storage_system = Some(StorageSystemId::new("array-1"));
        volume.replication_group = group.map(str::to_owned);
        volume
    }

    #[rstest]
    fn create_rejects_duplicate_identities(store: InMemoryStore) {
        store
            .create_volume(volume("vol-1", None))
            .unwrap_or_else(|err| panic!("first create should succeed: {err}"));
        let err = store
            .create_volume(volume("vol-1", None))
            .expect_err("duplicate create should fail");
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[rstest]
    fn marked_volumes_drop_out_of_queries(store: InMemoryStore) {
        for id in ["vol-1", "vol-2"] {
            store
                .create_volume(volume(id, Some("rg-1")))
                .unwrap_or_else(|err| panic!("create {id}: {err}"));
        }
        store
            .mark_for_deletion(&VolumeId::new("vol-1"))
            .unwrap_or_else(|err| panic!("mark should succeed: {err}"));

        let members = store
            .volumes_in_replication_group(&StorageSystemId::new("array-1"), "rg-1")
            .unwrap_or_else(|err| panic!("query should succeed: {err}"));
        let ids: Vec<_> = members.iter().map(|member| member.id.as_str()).collect();
        assert_eq!(ids, ["vol-2"]);
        assert_eq!(
            store.inactive_volumes().unwrap_or_default(),
            vec![VolumeId::new("vol-1")]
        );
    }

    #[rstest]
    fn update_requires_an_existing_record(store: InMemoryStore) {
        let err = store
            .update_volume(&volume("missing", None))
            .expect_err("update of a missing record should fail");
        assert_eq!(
            err,
            StoreError::NotFound {
                kind: "volume",
                id: String::from("missing"),
            }
        );
    }
}
