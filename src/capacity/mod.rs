//! Capacity reconciliation across storage families.
//!
//! Replication needs source and target volumes that allocate the same
//! number of bytes, but each array family rounds requests differently. The
//! reconciler finds one capacity every participating family allocates
//! exactly, or, when the families can never agree, an unmatched pair whose
//! target is never smaller than its source.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{Personality, StorageFamily, VolumeId};
use crate::store::{StoreError, VolumeStore};

pub mod calculator;

pub use calculator::{AllocationCalculator, CalculatorSet, FamilyCalculator};

/// Outcome of a reconciliation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPlan {
    /// Every participant allocates exactly this capacity.
    Matched(u64),
    /// Families cannot allocate identically; `source <= target` always.
    Unmatched {
        /// Capacity for source-side volumes.
        source: u64,
        /// Capacity for target-side volumes.
        target: u64,
    },
}

impl CapacityPlan {
    /// Returns the capacity a volume of `personality` receives under this plan.
    #[must_use]
    pub const fn capacity_for(self, personality: Personality) -> u64 {
        match self {
            Self::Matched(capacity) => capacity,
            Self::Unmatched { target, .. } if matches!(personality, Personality::Target) => {
                target
            }
            Self::Unmatched { source, .. } => source,
        }
    }
}

/// Errors raised while reconciling capacities.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CapacityError {
    /// Raised when no participant's allocation is reproduced by every other family.
    #[error("no matching allocation capacity found for {candidate} bytes across {families}")]
    Mismatch {
        /// Candidate capacity that was tried.
        candidate: u64,
        /// Families involved, comma separated.
        families: String,
    },
    /// Raised when a participant has no storage system.
    #[error("volume {volume} has no storage system to size against")]
    UnplacedVolume {
        /// Volume without placement.
        volume: VolumeId,
    },
    /// Raised when the store cannot be read.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Input of [`CapacityReconciler::reconcile`].
#[derive(Clone, Copy, Debug)]
pub struct ReconcileRequest<'a> {
    volumes: &'a [VolumeId],
    requested_size: u64,
    is_expand: bool,
    is_tier_change: bool,
}

impl<'a> ReconcileRequest<'a> {
    /// Reconciles `volumes` for a creation of `requested_size` bytes.
    #[must_use]
    pub const fn new(volumes: &'a [VolumeId], requested_size: u64) -> Self {
        Self {
            volumes,
            requested_size,
            is_expand: false,
            is_tier_change: false,
        }
    }

    /// Marks the request as an expansion to `requested_size`.
    #[must_use]
    pub const fn expand(mut self) -> Self {
        self.is_expand = true;
        self
    }

    /// Marks the request as a tier change.
    #[must_use]
    pub const fn tier_change(mut self, is_tier_change: bool) -> Self {
        self.is_tier_change = is_tier_change;
        self
    }
}

/// Physical volume taking part in a reconciliation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Participant {
    /// Physical volume.
    pub volume: VolumeId,
    /// Role, inherited from the composed parent for backing volumes.
    pub personality: Personality,
    /// Family of the volume's storage system.
    pub family: StorageFamily,
    /// Current allocated size in bytes.
    pub current_size: u64,
}

/// Result of a reconciliation, ready to be applied.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Reconciliation {
    plan: CapacityPlan,
    participants: Vec<Participant>,
    updates: Vec<(VolumeId, Personality)>,
    is_expand: bool,
    is_tier_change: bool,
}

impl Reconciliation {
    /// Returns the computed plan.
    #[must_use]
    pub const fn plan(&self) -> CapacityPlan {
        self.plan
    }

    /// Returns the physical participants that were compared.
    #[must_use]
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Returns the capacity every affected record should carry. The
    /// production volume of a tier change keeps its authoritative capacity
    /// and is left out.
    #[must_use]
    pub fn assignments(&self) -> Vec<(VolumeId, u64)> {
        self.updates
            .iter()
            .filter(|(_, personality)| {
                !(self.is_tier_change && matches!(personality, Personality::Source))
            })
            .map(|(volume, personality)| (volume.clone(), self.plan.capacity_for(*personality)))
            .collect()
    }
}

/// Computes matching capacities for replicated volumes.
#[derive(Debug)]
pub struct CapacityReconciler<'a, S> {
    store: &'a S,
    calculators: &'a CalculatorSet,
    target_skew_bytes: u64,
}

impl<'a, S> CapacityReconciler<'a, S>
where
    S: VolumeStore,
{
    /// Creates a reconciler reading volumes from `store`.
    #[must_use]
    pub const fn new(store: &'a S, calculators: &'a CalculatorSet, target_skew_bytes: u64) -> Self {
        Self {
            store,
            calculators,
            target_skew_bytes,
        }
    }

    /// Computes the capacity plan for the volumes in `request`.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError::Mismatch`] when families that should be able
    /// to agree find no common allocation, and [`CapacityError::Store`] or
    /// [`CapacityError::UnplacedVolume`] when participants cannot be read.
    pub fn reconcile(&self, request: &ReconcileRequest<'_>) -> Result<Reconciliation, CapacityError> {
        let (participants, updates) = self.collect_participants(request.volumes)?;
        let finish = |plan: CapacityPlan, updates: Vec<(VolumeId, Personality)>| Reconciliation {
            plan,
            participants: participants.clone(),
            updates,
            is_expand: request.is_expand,
            is_tier_change: request.is_tier_change,
        };

        let Some(first) = participants.first() else {
            warn!("no volumes found to compare capacities");
            return Ok(finish(CapacityPlan::Matched(request.requested_size), Vec::new()));
        };
        if participants.len() < 2 {
            warn!(volume = %first.volume, "no volumes found to compare capacities");
            return Ok(finish(CapacityPlan::Matched(request.requested_size), Vec::new()));
        }

        let same_family = participants
            .iter()
            .all(|participant| participant.family == first.family);
        if same_family
            && request.is_tier_change
            && self
                .calculators
                .calculator(first.family)
                .requires_exact_tier_change_match()
        {
            let source_capacity = participants
                .iter()
                .find(|participant| participant.personality == Personality::Source)
                .map_or(first.current_size, |participant| participant.current_size);
            info!(
                family = first.family.name(),
                capacity = source_capacity,
                "tier change keeps the source's provisioned capacity"
            );
            return Ok(finish(CapacityPlan::Matched(source_capacity), updates));
        }

        let all_equal = participants
            .iter()
            .all(|participant| participant.current_size == first.current_size);
        if same_family && all_equal {
            debug!(
                capacity = request.requested_size,
                "participants already share family and size"
            );
            return Ok(finish(CapacityPlan::Matched(request.requested_size), updates));
        }

        let candidate = if request.is_expand {
            request.requested_size
        } else {
            participants
                .iter()
                .map(|participant| participant.current_size)
                .max()
                .unwrap_or(request.requested_size)
        };

        let plan = if self.families_can_match(&participants) {
            CapacityPlan::Matched(self.anchor_capacity(&participants, candidate)?)
        } else {
            self.unmatched(&participants, candidate)
        };
        info!(?plan, candidate, "reconciled capacities across families");
        Ok(finish(plan, updates))
    }

    /// Writes the assignments of `reconciliation` to the store. Expansions
    /// are never persisted here: their capacity is final only once the
    /// physical expand succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a record cannot be read or written.
    pub fn persist(&self, reconciliation: &Reconciliation) -> Result<usize, StoreError> {
        if reconciliation.is_expand {
            return Ok(0);
        }
        let mut written = 0;
        for (id, capacity) in reconciliation.assignments() {
            let mut volume = self.store.require_volume(&id)?;
            if volume.capacity == capacity {
                debug!(volume = %id, capacity, "capacity already current");
                continue;
            }
            volume.capacity = capacity;
            self.store.update_volume(&volume)?;
            written += 1;
        }
        Ok(written)
    }

    fn collect_participants(
        &self,
        volumes: &[VolumeId],
    ) -> Result<(Vec<Participant>, Vec<(VolumeId, Personality)>), CapacityError> {
        let mut participants = Vec::new();
        let mut updates = Vec::new();
        for id in volumes {
            let volume = self.store.require_volume(id)?;
            match volume.personality {
                Personality::Source | Personality::Target => {}
                Personality::Plain => {
                    warn!(volume = %id, "volume has no personality; skipped for capacity comparison");
                    continue;
                }
                Personality::Metadata => continue,
            }
            updates.push((volume.id.clone(), volume.personality));
            if volume.is_composed() {
                for backing_id in &volume.backing_volumes {
                    let backing = self.store.require_volume(backing_id)?;
                    participants.push(self.participant(&backing, volume.personality)?);
                    updates.push((backing.id.clone(), volume.personality));
                }
            } else {
                participants.push(self.participant(&volume, volume.personality)?);
            }
        }
        Ok((participants, updates))
    }

    fn participant(
        &self,
        volume: &crate::model::Volume,
        personality: Personality,
    ) -> Result<Participant, CapacityError> {
        let system_id = volume
            .storage_system
            .as_ref()
            .ok_or_else(|| CapacityError::UnplacedVolume {
                volume: volume.id.clone(),
            })?;
        let system = self.store.require_storage_system(system_id)?;
        Ok(Participant {
            volume: volume.id.clone(),
            personality,
            family: system.family,
            current_size: volume.allocated_size(),
        })
    }

    fn families_can_match(&self, participants: &[Participant]) -> bool {
        let Some(base) = participants.first() else {
            return true;
        };
        participants
            .iter()
            .all(|other| self.calculators.capacities_can_match(base.family, other.family))
    }

    fn anchor_capacity(
        &self,
        participants: &[Participant],
        candidate: u64,
    ) -> Result<u64, CapacityError> {
        for anchor in participants {
            let anchored = self
                .calculators
                .calculator(anchor.family)
                .allocated_capacity(candidate);
            let reproduced = participants
                .iter()
                .filter(|other| other.family != anchor.family)
                .all(|other| {
                    self.calculators
                        .calculator(other.family)
                        .allocated_capacity(anchored)
                        == anchored
                });
            if reproduced {
                debug!(anchor = %anchor.volume, capacity = anchored, "anchor reconciles every family");
                return Ok(anchored);
            }
        }
        let mut families: Vec<&str> = participants
            .iter()
            .map(|participant| participant.family.name())
            .collect();
        families.sort_unstable();
        families.dedup();
        Err(CapacityError::Mismatch {
            candidate,
            families: families.join(", "),
        })
    }

    fn unmatched(&self, participants: &[Participant], candidate: u64) -> CapacityPlan {
        let source_family = participants
            .iter()
            .find(|participant| participant.personality == Personality::Source)
            .or_else(|| participants.first())
            .map_or(StorageFamily::Generic, |participant| participant.family);
        let source = self
            .calculators
            .calculator(source_family)
            .allocated_capacity(candidate);
        let skewed = candidate.saturating_add(self.target_skew_bytes);
        let target = participants
            .iter()
            .filter(|participant| participant.personality == Personality::Target)
            .map(|participant| {
                self.calculators
                    .calculator(participant.family)
                    .allocated_capacity(skewed)
            })
            .max()
            .unwrap_or(skewed)
            .max(source);
        CapacityPlan::Unmatched { source, target }
    }
}
