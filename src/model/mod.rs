//! Domain records read and written through the persistence collaborator.

mod id;
mod topology;
mod volume;

pub use id::{
    ConsistencyGroupId, ProjectId, ProtectionSystemId, StoragePoolId, StorageSystemId, TaskId,
    VirtualArrayId, VirtualPoolId, VolumeId,
};
pub use topology::{
    ConsistencyGroup, CopyMode, HighAvailability, ProtectionPolicy, StorageFamily, StorageSystem,
    VirtualArray, VirtualPool,
};
pub use volume::{AccessState, Personality, Volume};
