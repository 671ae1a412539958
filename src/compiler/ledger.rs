//! Record of the store side effects of one compilation attempt.

use crate::model::{Volume, VolumeId};

/// Volumes created and records modified while compiling a request, kept so
/// the orchestrator can compensate when a later step fails.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionLedger {
    created: Vec<VolumeId>,
    originals: Vec<Volume>,
}

impl ProvisionLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            created: Vec::new(),
            originals: Vec::new(),
        }
    }

    /// Records a volume created by this attempt.
    pub fn record_created(&mut self, volume: VolumeId) {
        if !self.created.contains(&volume) {
            self.created.push(volume);
        }
    }

    /// Records the state of a pre-existing volume before its first update.
    /// Later updates of the same volume, and updates of volumes created by
    /// this attempt, are ignored.
    pub fn record_update(&mut self, original: &Volume) {
        if self.created.contains(&original.id)
            || self.originals.iter().any(|volume| volume.id == original.id)
        {
            return;
        }
        self.originals.push(original.clone());
    }

    /// Volumes created by this attempt, in creation order.
    #[must_use]
    pub fn created(&self) -> &[VolumeId] {
        &self.created
    }

    /// Pre-request records of every pre-existing volume that was updated.
    #[must_use]
    pub fn originals(&self) -> &[Volume] {
        &self.originals
    }

    /// Whether the attempt had no store side effects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.originals.is_empty()
    }
}
