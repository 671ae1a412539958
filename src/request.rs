//! Volume requests and the per-request capability set derived from them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ConsistencyGroupId, ProjectId, VirtualArrayId, VirtualPoolId, VolumeId};

/// Errors raised while validating a request.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RequestError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
    /// Raised when a size or count is out of range.
    #[error("{field} is out of range: {message}")]
    OutOfRange {
        /// Offending field.
        field: &'static str,
        /// Human-readable description of the range.
        message: String,
    },
}

/// Abstract volume request entering the planner. Immutable once built.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeRequest {
    /// Base label for the new volumes.
    pub name: String,
    /// Size of each volume in bytes.
    pub size_bytes: u64,
    /// Number of volumes to create.
    pub count: u32,
    /// Virtual pool (service tier) requested.
    pub virtual_pool: VirtualPoolId,
    /// Virtual array requested.
    pub virtual_array: VirtualArrayId,
    /// Owning project.
    pub project: ProjectId,
    /// Consistency group the volumes join.
    #[serde(default)]
    pub consistency_group: Option<ConsistencyGroupId>,
    /// Existing volume being moved to a new tier.
    #[serde(default)]
    pub change_source: Option<VolumeId>,
}

impl VolumeRequest {
    /// Starts a builder for a [`VolumeRequest`].
    #[must_use]
    pub fn builder() -> VolumeRequestBuilder {
        VolumeRequestBuilder::new()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when a field is empty or out of range.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.name.trim().is_empty() {
            return Err(RequestError::Validation("name".to_owned()));
        }
        if self.virtual_pool.as_str().is_empty() {
            return Err(RequestError::Validation("virtual_pool".to_owned()));
        }
        if self.virtual_array.as_str().is_empty() {
            return Err(RequestError::Validation("virtual_array".to_owned()));
        }
        if self.project.as_str().is_empty() {
            return Err(RequestError::Validation("project".to_owned()));
        }
        if self.size_bytes == 0 {
            return Err(RequestError::OutOfRange {
                field: "size_bytes",
                message: String::from("must be greater than zero"),
            });
        }
        if self.count == 0 {
            return Err(RequestError::OutOfRange {
                field: "count",
                message: String::from("must be at least one"),
            });
        }
        Ok(())
    }
}

/// Builder for [`VolumeRequest`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeRequestBuilder {
    name: String,
    size_bytes: u64,
    count: u32,
    virtual_pool: String,
    virtual_array: String,
    project: String,
    consistency_group: Option<String>,
    change_source: Option<VolumeId>,
}

impl VolumeRequestBuilder {
    /// Creates an empty builder; fields must be populated before build.
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: 1,
            ..Self::default()
        }
    }

    /// Sets the base label.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the size of each volume in bytes.
    #[must_use]
    pub const fn size_bytes(mut self, value: u64) -> Self {
        self.size_bytes = value;
        self
    }

    /// Sets the number of volumes; defaults to one.
    #[must_use]
    pub const fn count(mut self, value: u32) -> Self {
        self.count = value;
        self
    }

    /// Sets the virtual pool.
    #[must_use]
    pub fn virtual_pool(mut self, value: impl Into<String>) -> Self {
        self.virtual_pool = value.into();
        self
    }

    /// Sets the virtual array.
    #[must_use]
    pub fn virtual_array(mut self, value: impl Into<String>) -> Self {
        self.virtual_array = value.into();
        self
    }

    /// Sets the owning project.
    #[must_use]
    pub fn project(mut self, value: impl Into<String>) -> Self {
        self.project = value.into();
        self
    }

    /// Sets the optional consistency group.
    #[must_use]
    pub fn consistency_group(mut self, value: Option<String>) -> Self {
        self.consistency_group = value;
        self
    }

    /// Marks the request as a tier change of an existing volume.
    #[must_use]
    pub fn change_source(mut self, value: Option<VolumeId>) -> Self {
        self.change_source = value;
        self
    }

    /// Builds and validates the [`VolumeRequest`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when any required field is empty or out of
    /// range.
    pub fn build(self) -> Result<VolumeRequest, RequestError> {
        let request = VolumeRequest {
            name: self.name.trim().to_owned(),
            size_bytes: self.size_bytes,
            count: self.count,
            virtual_pool: VirtualPoolId::new(self.virtual_pool.trim()),
            virtual_array: VirtualArrayId::new(self.virtual_array.trim()),
            project: ProjectId::new(self.project.trim()),
            consistency_group: self
                .consistency_group
                .map(|value| ConsistencyGroupId::new(value.trim())),
            change_source: self.change_source,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Tier change details carried by [`RequestCapabilities`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChangeContext {
    /// Existing volume whose tier changes.
    pub volume: VolumeId,
    /// Virtual pool the volume leaves.
    pub old_virtual_pool: VirtualPoolId,
    /// Whether the volume was already protected before the request.
    pub already_protected: bool,
}

/// Immutable capability set built once per request.
///
/// Per-branch variants (journals sized differently from sources, for
/// example) are derived copies; the original is never mutated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestCapabilities {
    size_bytes: u64,
    resource_count: u32,
    consistency_group: Option<ConsistencyGroupId>,
    journal_only: bool,
    change: Option<ChangeContext>,
}

impl RequestCapabilities {
    /// Derives the capabilities of a plain creation request.
    #[must_use]
    pub fn from_request(request: &VolumeRequest) -> Self {
        Self {
            size_bytes: request.size_bytes,
            resource_count: request.count,
            consistency_group: request.consistency_group.clone(),
            journal_only: false,
            change: None,
        }
    }

    /// Returns a copy describing a tier change of an existing volume.
    #[must_use]
    pub fn for_change(&self, change: ChangeContext) -> Self {
        Self {
            change: Some(change),
            ..self.clone()
        }
    }

    /// Returns a copy describing a journal-only request.
    #[must_use]
    pub fn for_journal_only(&self) -> Self {
        Self {
            journal_only: true,
            ..self.clone()
        }
    }

    /// Returns a copy with a different per-volume size.
    #[must_use]
    pub fn with_size(&self, size_bytes: u64) -> Self {
        Self {
            size_bytes,
            ..self.clone()
        }
    }

    /// Size of each volume in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Number of volumes requested.
    #[must_use]
    pub const fn resource_count(&self) -> u32 {
        self.resource_count
    }

    /// Consistency group the volumes join.
    #[must_use]
    pub const fn consistency_group(&self) -> Option<&ConsistencyGroupId> {
        self.consistency_group.as_ref()
    }

    /// Whether only journals are being added.
    #[must_use]
    pub const fn journal_only(&self) -> bool {
        self.journal_only
    }

    /// Tier change details, if any.
    #[must_use]
    pub const fn change(&self) -> Option<&ChangeContext> {
        self.change.as_ref()
    }

    /// Whether this is a tier change of an already protected volume.
    #[must_use]
    pub fn upgrades_protected_volume(&self) -> bool {
        self.change
            .as_ref()
            .is_some_and(|change| change.already_protected)
    }

    /// Returns `true` when `volume` is the volume whose tier changes.
    #[must_use]
    pub fn is_change_volume(&self, volume: &VolumeId) -> bool {
        self.change
            .as_ref()
            .is_some_and(|change| &change.volume == volume)
    }
}
