//! Strongly typed identifiers for persisted entities.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Generates a fresh identifier in the `urn:ruslan:<kind>:<uuid>` form.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!("urn:ruslan:{}:{}", $kind, Uuid::new_v4()))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

identifier!(
    /// Identifier of a volume record.
    VolumeId,
    "Volume"
);
identifier!(
    /// Identifier of a consistency group.
    ConsistencyGroupId,
    "BlockConsistencyGroup"
);
identifier!(
    /// Identifier of a virtual pool (service tier).
    VirtualPoolId,
    "VirtualPool"
);
identifier!(
    /// Identifier of a virtual array.
    VirtualArrayId,
    "VirtualArray"
);
identifier!(
    /// Identifier of a physical storage pool.
    StoragePoolId,
    "StoragePool"
);
identifier!(
    /// Identifier of a storage system (physical array or virtualization cluster).
    StorageSystemId,
    "StorageSystem"
);
identifier!(
    /// Identifier of a project owning volumes.
    ProjectId,
    "Project"
);
identifier!(
    /// Identifier of a protection appliance system.
    ProtectionSystemId,
    "ProtectionSystem"
);
identifier!(
    /// Identifier of a task tracked by the status tracker.
    TaskId,
    "Task"
);
