//! Translation from scheduler proposals to normalized recommendations.

use tracing::debug;

use super::{
    ArrayProposal, CopyProposal, JournalRecommendation, JournalRole, Leaf, PlacementError,
    ProtectedProposal, ProtectedRecommendation, Proposal, Recommendation, StandbyRecommendation,
};
use crate::model::{VirtualArrayId, VirtualPool, VirtualPoolId};
use crate::store::VolumeStore;

/// Whether the protected side of a distributed source is its
/// high-availability leg rather than its primary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SwapPolicy {
    /// Placements are used as proposed.
    Keep,
    /// The source takes the high-availability virtual array and pool, and
    /// its legs are reordered so the protected leg comes first.
    ProtectHaSide {
        /// Virtual array of the high-availability leg.
        virtual_array: VirtualArrayId,
        /// Virtual pool of the high-availability leg.
        virtual_pool: VirtualPoolId,
    },
}

impl SwapPolicy {
    /// Derives the swap policy of `pool`. Dual-active pools protect both
    /// legs and are never swapped.
    #[must_use]
    pub fn from_pool(pool: &VirtualPool) -> Self {
        let dual_active = pool
            .protection
            .as_ref()
            .is_some_and(|protection| protection.dual_active);
        match &pool.high_availability {
            Some(ha) if ha.protect_ha_side && !dual_active => Self::ProtectHaSide {
                virtual_array: ha.virtual_array.clone(),
                virtual_pool: ha
                    .virtual_pool
                    .clone()
                    .unwrap_or_else(|| pool.id.clone()),
            },
            _ => Self::Keep,
        }
    }

    fn apply(&self, leaf: &mut Leaf) {
        if let Self::ProtectHaSide {
            virtual_array,
            virtual_pool,
        } = self
        {
            debug!(
                from = %leaf.placement.virtual_array,
                to = %virtual_array,
                "protecting the high-availability side of the source"
            );
            leaf.placement.virtual_array = virtual_array.clone();
            leaf.placement.virtual_pool = virtual_pool.clone();
            leaf.backing.reverse();
        }
    }
}

/// Normalizes scheduler proposals for the compiler.
#[derive(Debug)]
pub struct PlacementAdapter<'a, S> {
    store: &'a S,
}

impl<'a, S> PlacementAdapter<'a, S>
where
    S: VolumeStore,
{
    /// Creates an adapter reading pools from `store`.
    #[must_use]
    pub const fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Normalizes `proposals` placed for volumes of `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError::Exhausted`] when `proposals` is empty,
    /// [`PlacementError::InvalidShape`] when a copy wraps another protected
    /// proposal, and [`PlacementError::Store`] when the pool cannot be read.
    pub fn normalize(
        &self,
        proposals: &[Proposal],
        pool: &VirtualPoolId,
    ) -> Result<Vec<Recommendation>, PlacementError> {
        if proposals.is_empty() {
            return Err(PlacementError::Exhausted);
        }
        let swap = SwapPolicy::from_pool(&self.store.require_virtual_pool(pool)?);
        proposals
            .iter()
            .map(|proposal| {
                let mut recommendation = match proposal {
                    Proposal::Protected(protected) => {
                        Recommendation::Protected(protected_recommendation(protected)?)
                    }
                    unprotected => Recommendation::Unprotected(walk(unprotected, None, None)?),
                };
                match &mut recommendation {
                    Recommendation::Unprotected(leaf) => swap.apply(leaf),
                    Recommendation::Protected(protected) => swap.apply(&mut protected.source),
                }
                Ok(recommendation)
            })
            .collect()
    }
}

fn protected_recommendation(
    proposal: &ProtectedProposal,
) -> Result<ProtectedRecommendation, PlacementError> {
    let mut journals = Vec::new();
    let roles = proposal
        .source_journal
        .iter()
        .map(|copy| (JournalRole::Source, copy))
        .chain(proposal.standby_journal.iter().map(|copy| (JournalRole::Standby, copy)))
        .chain(proposal.target_journals.iter().map(|copy| (JournalRole::Target, copy)));
    for (role, copy) in roles {
        journals.push(JournalRecommendation {
            role,
            leaf: walk_copy(copy)?,
        });
    }
    let standby = proposal
        .standby
        .as_ref()
        .map(|standby| {
            Ok::<_, PlacementError>(StandbyRecommendation {
                leaf: walk_copy(&standby.copy)?,
                targets: walk_copies(&standby.targets)?,
            })
        })
        .transpose()?;
    Ok(ProtectedRecommendation {
        protection_system: proposal.protection_system.clone(),
        source: walk_copy(&proposal.source)?,
        targets: walk_copies(&proposal.targets)?,
        journals,
        standby,
    })
}

fn walk_copies(copies: &[CopyProposal]) -> Result<Vec<Leaf>, PlacementError> {
    copies.iter().map(walk_copy).collect()
}

fn walk_copy(copy: &CopyProposal) -> Result<Leaf, PlacementError> {
    walk(
        &copy.child,
        Some(copy.internal_site.clone()),
        copy.copy_name.clone(),
    )
}

fn walk(
    proposal: &Proposal,
    internal_site: Option<String>,
    copy_name: Option<String>,
) -> Result<Leaf, PlacementError> {
    match proposal {
        Proposal::Array(ArrayProposal {
            placement,
            resource_count,
            size_bytes,
        }) => Ok(Leaf {
            placement: placement.clone(),
            resource_count: *resource_count,
            size_bytes: *size_bytes,
            internal_site,
            copy_name,
            backing: Vec::new(),
        }),
        Proposal::Virtual(virtual_proposal) => {
            if virtual_proposal.legs.is_empty() {
                return Err(PlacementError::InvalidShape {
                    reason: format!(
                        "virtual placement on {} has no backing legs",
                        virtual_proposal.placement.storage_system
                    ),
                });
            }
            Ok(Leaf {
                placement: virtual_proposal.placement.clone(),
                resource_count: virtual_proposal.resource_count,
                size_bytes: virtual_proposal.size_bytes,
                internal_site,
                copy_name,
                backing: virtual_proposal
                    .legs
                    .iter()
                    .map(|leg| leg.placement.clone())
                    .collect(),
            })
        }
        Proposal::Protected(nested) => Err(PlacementError::InvalidShape {
            reason: format!(
                "copy wraps a nested protected proposal for {}",
                nested.protection_system
            ),
        }),
    }
}
