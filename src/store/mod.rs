//! Persistence collaborator for volumes and the topology around them.
//!
//! Reads are strongly consistent per record; nothing is transactional across
//! records. Callers re-read records by identity instead of caching them
//! across lock or controller suspension points.

use thiserror::Error;

use crate::model::{
    ConsistencyGroup, ConsistencyGroupId, StorageSystem, StorageSystemId, VirtualArray,
    VirtualArrayId, VirtualPool, VirtualPoolId, Volume, VolumeId,
};

mod memory;

pub use memory::{InMemoryStore, StoreSnapshot};

/// Errors raised by persistence implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when a referenced record does not exist.
    #[error("{kind} {id} was not found")]
    NotFound {
        /// Record kind, for example `volume`.
        kind: &'static str,
        /// Identity that was looked up.
        id: String,
    },
    /// Raised when creating a record whose identity is already taken.
    #[error("{kind} {id} already exists")]
    Duplicate {
        /// Record kind, for example `volume`.
        kind: &'static str,
        /// Identity that collided.
        id: String,
    },
    /// Raised when the backing store cannot serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    fn not_found(kind: &'static str, id: &impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Abstraction over the persistent object store for dependency injection.
pub trait VolumeStore {
    /// Looks up a volume by identity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn volume(&self, id: &VolumeId) -> Result<Option<Volume>, StoreError>;

    /// Creates a new volume record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the identity is taken.
    fn create_volume(&self, volume: Volume) -> Result<(), StoreError>;

    /// Replaces an existing volume record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the record does not exist.
    fn update_volume(&self, volume: &Volume) -> Result<(), StoreError>;

    /// Marks a volume record inactive so it is ignored by later queries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the record does not exist.
    fn mark_for_deletion(&self, id: &VolumeId) -> Result<(), StoreError>;

    /// Looks up a storage system by identity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn storage_system(&self, id: &StorageSystemId) -> Result<Option<StorageSystem>, StoreError>;

    /// Looks up a virtual array by identity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn virtual_array(&self, id: &VirtualArrayId) -> Result<Option<VirtualArray>, StoreError>;

    /// Looks up a virtual pool by identity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn virtual_pool(&self, id: &VirtualPoolId) -> Result<Option<VirtualPool>, StoreError>;

    /// Looks up a consistency group by identity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<Option<ConsistencyGroup>, StoreError>;

    /// Returns the active volumes belonging to a consistency group.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn volumes_in_consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<Vec<Volume>, StoreError>;

    /// Returns the active volumes in a backend replication group.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn volumes_in_replication_group(
        &self,
        system: &StorageSystemId,
        group: &str,
    ) -> Result<Vec<Volume>, StoreError>;

    /// Returns the number of active snapshots of a volume.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn snapshot_count(&self, volume: &VolumeId) -> Result<usize, StoreError>;

    /// Looks up a volume that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the volume is absent.
    fn require_volume(&self, id: &VolumeId) -> Result<Volume, StoreError> {
        self.volume(id)?
            .ok_or_else(|| StoreError::not_found("volume", id))
    }

    /// Looks up every volume in `ids`, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when any volume is absent.
    fn require_volumes(&self, ids: &[VolumeId]) -> Result<Vec<Volume>, StoreError> {
        ids.iter().map(|id| self.require_volume(id)).collect()
    }

    /// Looks up a storage system that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the system is absent.
    fn require_storage_system(&self, id: &StorageSystemId) -> Result<StorageSystem, StoreError> {
        self.storage_system(id)?
            .ok_or_else(|| StoreError::not_found("storage system", id))
    }

    /// Looks up a virtual array that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the virtual array is absent.
    fn require_virtual_array(&self, id: &VirtualArrayId) -> Result<VirtualArray, StoreError> {
        self.virtual_array(id)?
            .ok_or_else(|| StoreError::not_found("virtual array", id))
    }

    /// Looks up a virtual pool that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the virtual pool is absent.
    fn require_virtual_pool(&self, id: &VirtualPoolId) -> Result<VirtualPool, StoreError> {
        self.virtual_pool(id)?
            .ok_or_else(|| StoreError::not_found("virtual pool", id))
    }

    /// Looks up a consistency group that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the group is absent.
    fn require_consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<ConsistencyGroup, StoreError> {
        self.consistency_group(id)?
            .ok_or_else(|| StoreError::not_found("consistency group", id))
    }
}
