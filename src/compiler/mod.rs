//! Expansion of recommendations into ordered volume descriptors.
//!
//! Compilation walks each recommendation journal first, then sources, then
//! targets. Every record it creates is persisted immediately and noted in a
//! [`ProvisionLedger`] so the orchestrator can compensate; nothing here
//! ever rolls back on its own. A second pass types the prepared records
//! into [`VolumeDescriptor`] values ordered journal, source, target.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::PlannerSettings;
use crate::descriptor::{DescriptorAction, VolumeDescriptor};
use crate::lock::{LockError, NamedLockService};
use crate::model::{
    AccessState, ConsistencyGroup, Personality, VirtualArrayId, VirtualPool, Volume, VolumeId,
};
use crate::recommendation::{Leaf, Placement, ProtectedRecommendation, Recommendation};
use crate::request::{ChangeContext, RequestCapabilities, VolumeRequest};
use crate::store::{StoreError, VolumeStore};

mod journal;
mod ledger;
pub mod naming;
mod policy;
mod typing;

pub use ledger::ProvisionLedger;
pub use policy::{JournalSizePolicy, PolicyError};

use journal::JournalRefs;
use naming::CopyRole;

/// Errors raised while compiling recommendations.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CompileError {
    /// Raised when the recommendations cannot produce a valid topology.
    #[error("invalid topology: {reason}")]
    InvalidTopology {
        /// Description of what is missing or inconsistent.
        reason: String,
    },
    /// Raised when the journal naming lock is not acquired in time.
    #[error("timed out after {waited_ms} ms waiting for journal naming lock {key}")]
    LockTimeout {
        /// Lock key.
        key: String,
        /// Time waited in milliseconds.
        waited_ms: u128,
    },
    /// Raised when the lock service cannot be used.
    #[error("journal naming lock unavailable: {0}")]
    Lock(String),
    /// Raised when a record cannot be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised when a pool carries an unparsable journal policy.
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl CompileError {
    fn topology(reason: impl Into<String>) -> Self {
        Self::InvalidTopology {
            reason: reason.into(),
        }
    }
}

impl From<LockError> for CompileError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Timeout { key, waited_ms } => Self::LockTimeout { key, waited_ms },
            LockError::Unavailable(message) => Self::Lock(message),
        }
    }
}

/// Output of a successful compilation.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Compilation {
    /// Descriptors ordered journal, source, target.
    pub descriptors: Vec<VolumeDescriptor>,
    /// Every volume prepared for the request, backing legs included.
    pub volumes: Vec<VolumeId>,
    /// Volumes that receive a task: sources, or journals for journal-only
    /// requests.
    pub task_volumes: Vec<VolumeId>,
    /// Each source followed by its targets, the unit of capacity
    /// reconciliation.
    pub replication_sets: Vec<Vec<VolumeId>>,
    /// Existing journals reused instead of created.
    pub reused_journals: Vec<VolumeId>,
}

impl Compilation {
    /// Refreshes descriptor capacities from the store, after reconciliation
    /// has persisted the final sizes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a described volume cannot be read.
    pub fn apply_capacities<S>(&mut self, store: &S) -> Result<(), StoreError>
    where
        S: VolumeStore,
    {
        for descriptor in &mut self.descriptors {
            if matches!(
                descriptor.action,
                DescriptorAction::Create | DescriptorAction::ExistingReuse
            ) {
                descriptor.capacity = store.require_volume(&descriptor.volume)?.capacity;
            }
        }
        Ok(())
    }
}

/// Record prepared for the second pass.
#[derive(Clone, Debug)]
struct Entry {
    record: Volume,
    legs: Vec<Volume>,
    reuse: Option<ChangeContext>,
}

#[derive(Debug, Default)]
struct Batch {
    entries: Vec<Entry>,
    tasks: Vec<VolumeId>,
    replication_sets: Vec<Vec<VolumeId>>,
    reused_journals: Vec<VolumeId>,
    next_index: u32,
}

impl Batch {
    fn next_label(&mut self, ctx: &CompileContext<'_>) -> String {
        let label = naming::volume_label(
            &ctx.request.name,
            self.next_index,
            ctx.capabilities.resource_count(),
        );
        self.next_index = self.next_index.saturating_add(1);
        label
    }
}

/// Immutable per-request inputs shared by every compilation step.
struct CompileContext<'r> {
    request: &'r VolumeRequest,
    capabilities: &'r RequestCapabilities,
    pool: VirtualPool,
    group: Option<ConsistencyGroup>,
}

impl CompileContext<'_> {
    fn dual_active(&self) -> bool {
        self.pool
            .protection
            .as_ref()
            .is_some_and(|protection| protection.dual_active)
    }

    fn new_source_capacity(&self) -> u64 {
        self.capabilities
            .size_bytes()
            .saturating_mul(u64::from(self.capabilities.resource_count()))
    }
}

/// Copy names of the production copies of one protected recommendation.
#[derive(Clone, Debug)]
struct CopyNames {
    active: String,
    standby: Option<String>,
}

/// Protected recommendation with the group state it is compiled against.
struct ProtectedScope<'s> {
    group: &'s ConsistencyGroup,
    rec: &'s ProtectedRecommendation,
    members: Vec<Volume>,
    copies: CopyNames,
}

/// Compiles recommendations into descriptors.
#[derive(Debug)]
pub struct VolumeDescriptorCompiler<'a, S, L> {
    store: &'a S,
    locks: &'a L,
    settings: PlannerSettings,
}

impl<'a, S, L> VolumeDescriptorCompiler<'a, S, L>
where
    S: VolumeStore,
    L: NamedLockService,
{
    /// Creates a compiler persisting through `store` and naming journals
    /// under `locks`.
    #[must_use]
    pub const fn new(store: &'a S, locks: &'a L, settings: PlannerSettings) -> Self {
        Self {
            store,
            locks,
            settings,
        }
    }

    /// Compiles `recommendations` for `request`.
    ///
    /// Records are persisted as they are prepared and noted in `ledger`,
    /// including when compilation later fails.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::InvalidTopology`] when a required
    /// recommendation is missing, [`CompileError::LockTimeout`] when journal
    /// naming cannot be serialised in time, and [`CompileError::Store`] or
    /// [`CompileError::Policy`] when inputs cannot be read.
    pub async fn compile(
        &self,
        recommendations: &[Recommendation],
        request: &VolumeRequest,
        capabilities: &RequestCapabilities,
        ledger: &mut ProvisionLedger,
    ) -> Result<Compilation, CompileError> {
        if recommendations.is_empty() {
            return Err(CompileError::topology("no recommendations to compile"));
        }
        let ctx = CompileContext {
            request,
            capabilities,
            pool: self.store.require_virtual_pool(&request.virtual_pool)?,
            group: capabilities
                .consistency_group()
                .map(|id| self.store.require_consistency_group(id))
                .transpose()?,
        };
        let mut batch = Batch::default();
        for recommendation in recommendations {
            match recommendation {
                Recommendation::Unprotected(leaf) => {
                    self.compile_unprotected(&ctx, leaf, &mut batch, ledger)?;
                }
                Recommendation::Protected(protected) => {
                    self.compile_protected(&ctx, protected, &mut batch, ledger)
                        .await?;
                }
            }
        }

        let descriptors = typing::descriptors(&batch.entries, &ctx)?;
        let volumes = batch
            .entries
            .iter()
            .flat_map(|entry| {
                std::iter::once(entry.record.id.clone())
                    .chain(entry.legs.iter().map(|leg| leg.id.clone()))
            })
            .collect();
        info!(
            request = %request.name,
            descriptors = descriptors.len(),
            reused_journals = batch.reused_journals.len(),
            "compiled recommendations"
        );
        Ok(Compilation {
            descriptors,
            volumes,
            task_volumes: batch.tasks,
            replication_sets: batch.replication_sets,
            reused_journals: batch.reused_journals,
        })
    }

    fn compile_unprotected(
        &self,
        ctx: &CompileContext<'_>,
        leaf: &Leaf,
        batch: &mut Batch,
        ledger: &mut ProvisionLedger,
    ) -> Result<(), CompileError> {
        if ctx.capabilities.journal_only() {
            return Err(CompileError::topology(
                "journal capacity can only be added to protected volumes",
            ));
        }
        for _ in 0..leaf.resource_count {
            let label = batch.next_label(ctx);
            let record = new_record(
                ctx,
                label,
                &leaf.placement,
                Personality::Plain,
                ctx.capabilities.size_bytes(),
            );
            let entry = self.persist(ctx, record, leaf, &[], ledger)?;
            batch.tasks.push(entry.record.id.clone());
            batch.entries.push(entry);
        }
        Ok(())
    }

    async fn compile_protected(
        &self,
        ctx: &CompileContext<'_>,
        rec: &ProtectedRecommendation,
        batch: &mut Batch,
        ledger: &mut ProvisionLedger,
    ) -> Result<(), CompileError> {
        let group = ctx.group.as_ref().ok_or_else(|| {
            CompileError::topology("protected volumes require a consistency group")
        })?;
        if ctx.capabilities.upgrades_protected_volume() && !ctx.dual_active() {
            return Err(CompileError::topology(format!(
                "pool {} is not dual-active; an already protected volume cannot be upgraded to it",
                ctx.pool.label
            )));
        }
        let members = self.store.volumes_in_consistency_group(&group.id)?;
        let scope = ProtectedScope {
            copies: self.copy_names(ctx, rec, &members)?,
            group,
            rec,
            members,
        };

        let journals = self.prepare_journals(ctx, &scope, batch, ledger).await?;
        if ctx.capabilities.journal_only() {
            return Ok(());
        }

        let sources = if let Some(change) = ctx.capabilities.change() {
            vec![self.reuse_change_volume(ctx, &scope, change, &journals, ledger)?]
        } else {
            self.create_sources(ctx, &scope, &journals, batch, ledger)?
        };
        for mut source in sources {
            let targets = self.compile_targets(ctx, &scope, &mut source.record, &journals, ledger)?;
            if !targets.is_empty() {
                self.store.update_volume(&source.record)?;
            }
            let mut set = vec![source.record.id.clone()];
            set.extend(targets.iter().map(|target| target.record.id.clone()));
            batch.replication_sets.push(set);
            batch.tasks.push(source.record.id.clone());
            batch.entries.push(source);
            batch.entries.extend(targets);
        }
        Ok(())
    }

    fn copy_names(
        &self,
        ctx: &CompileContext<'_>,
        rec: &ProtectedRecommendation,
        members: &[Volume],
    ) -> Result<CopyNames, CompileError> {
        let source_varray = self.store.require_virtual_array(rec.source.virtual_array())?;
        if !ctx.dual_active() {
            return Ok(CopyNames {
                active: naming::copy_name(
                    members,
                    &source_varray,
                    CopyRole::Production,
                    rec.source.copy_name.as_deref(),
                ),
                standby: None,
            });
        }
        let standby = rec.standby.as_ref().ok_or_else(|| {
            CompileError::topology(format!(
                "dual-active pool {} has no standby copy recommendation",
                ctx.pool.label
            ))
        })?;
        let standby_varray = self
            .store
            .require_virtual_array(standby.leaf.virtual_array())?;
        Ok(CopyNames {
            active: naming::copy_name(
                members,
                &source_varray,
                CopyRole::ActiveProduction,
                rec.source.copy_name.as_deref(),
            ),
            standby: Some(naming::copy_name(
                members,
                &standby_varray,
                CopyRole::StandbyProduction,
                standby.leaf.copy_name.as_deref(),
            )),
        })
    }

    fn create_sources(
        &self,
        ctx: &CompileContext<'_>,
        scope: &ProtectedScope<'_>,
        journals: &JournalRefs,
        batch: &mut Batch,
        ledger: &mut ProvisionLedger,
    ) -> Result<Vec<Entry>, CompileError> {
        let rec = scope.rec;
        let mut sites = vec![(
            rec.source.virtual_array().clone(),
            rec.source.internal_site.clone(),
        )];
        if let Some(standby) = &rec.standby {
            sites.push((
                standby.leaf.virtual_array().clone(),
                standby.leaf.internal_site.clone(),
            ));
        }
        let mut created = Vec::new();
        for _ in 0..rec.source.resource_count {
            let label = batch.next_label(ctx);
            let mut record = new_record(
                ctx,
                label,
                &rec.source.placement,
                Personality::Source,
                ctx.capabilities.size_bytes(),
            );
            record.copy_name = Some(scope.copies.active.clone());
            record.internal_site.clone_from(&rec.source.internal_site);
            record.replication_set = Some(naming::replication_set(&record.label));
            record.journal.clone_from(&journals.active);
            record.standby_journal.clone_from(&journals.standby);
            record.protection_system = Some(rec.protection_system.clone());
            created.push(self.persist(ctx, record, &rec.source, &sites, ledger)?);
        }
        Ok(created)
    }

    fn reuse_change_volume(
        &self,
        ctx: &CompileContext<'_>,
        scope: &ProtectedScope<'_>,
        change: &ChangeContext,
        journals: &JournalRefs,
        ledger: &mut ProvisionLedger,
    ) -> Result<Entry, CompileError> {
        let original = self.store.require_volume(&change.volume)?;
        ledger.record_update(&original);
        let mut record = original;
        record.personality = Personality::Source;
        record.consistency_group = Some(scope.group.id.clone());
        record.protection_system = Some(scope.rec.protection_system.clone());
        record.copy_name = Some(scope.copies.active.clone());
        record.access = AccessState::ReadWrite;
        if record.internal_site.is_none() {
            record.internal_site.clone_from(&scope.rec.source.internal_site);
        }
        if record.replication_set.is_none() {
            record.replication_set = Some(naming::replication_set(&record.label));
        }
        if journals.active.is_some() {
            record.journal.clone_from(&journals.active);
        }
        if journals.standby.is_some() {
            record.standby_journal.clone_from(&journals.standby);
        }
        self.store.update_volume(&record)?;
        debug!(volume = %record.id, "reusing the tier-change volume as the source");

        if ctx.capabilities.upgrades_protected_volume() {
            for member in scope
                .members
                .iter()
                .filter(|member| member.personality == Personality::Source && member.id != record.id)
            {
                ledger.record_update(member);
                let mut annotated = member.clone();
                annotated.standby_journal.clone_from(&journals.standby);
                self.store.update_volume(&annotated)?;
            }
        }
        Ok(Entry {
            record,
            legs: Vec::new(),
            reuse: Some(change.clone()),
        })
    }

    fn compile_targets(
        &self,
        ctx: &CompileContext<'_>,
        scope: &ProtectedScope<'_>,
        source: &mut Volume,
        journals: &JournalRefs,
        ledger: &mut ProvisionLedger,
    ) -> Result<Vec<Entry>, CompileError> {
        let mut seen: Vec<&VirtualArrayId> = Vec::new();
        let mut entries = Vec::new();
        for leaf in target_leaves(scope.rec) {
            if seen.contains(&leaf.virtual_array()) {
                debug!(varray = %leaf.virtual_array(), "target copy already provisioned by the active side");
                continue;
            }
            seen.push(leaf.virtual_array());
            if ctx.capabilities.upgrades_protected_volume()
                && scope.members.iter().any(|member| {
                    member.personality == Personality::Target
                        && &member.virtual_array == leaf.virtual_array()
                        && member.replication_set == source.replication_set
                })
            {
                debug!(varray = %leaf.virtual_array(), "target already exists for the protected volume");
                continue;
            }
            let varray = self.store.require_virtual_array(leaf.virtual_array())?;
            let mut record = new_record(
                ctx,
                naming::target_label(&source.label, &varray),
                &leaf.placement,
                Personality::Target,
                source.capacity,
            );
            record.copy_name = Some(naming::copy_name(
                &scope.members,
                &varray,
                CopyRole::Target,
                leaf.copy_name.as_deref(),
            ));
            record.internal_site.clone_from(&leaf.internal_site);
            record.replication_set.clone_from(&source.replication_set);
            record.journal = journals.target(leaf.virtual_array()).cloned();
            record.protection_system = Some(scope.rec.protection_system.clone());
            record.access = AccessState::NotReady;
            let sites = [(leaf.virtual_array().clone(), leaf.internal_site.clone())];
            let entry = self.persist(ctx, record, leaf, &sites, ledger)?;
            source.protection_targets.push(entry.record.id.clone());
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Creates the backing legs of a composed `record`, then the record
    /// itself. Legs take the internal site of their virtual array from
    /// `sites`.
    fn persist(
        &self,
        ctx: &CompileContext<'_>,
        mut record: Volume,
        leaf: &Leaf,
        sites: &[(VirtualArrayId, Option<String>)],
        ledger: &mut ProvisionLedger,
    ) -> Result<Entry, CompileError> {
        let mut legs = Vec::with_capacity(leaf.backing.len());
        for (index, placement) in leaf.backing.iter().enumerate() {
            let mut leg = new_record(
                ctx,
                naming::backing_label(&record.label, index),
                placement,
                Personality::Plain,
                record.capacity,
            );
            leg.consistency_group = None;
            leg.internal_object = true;
            leg.internal_site = sites
                .iter()
                .find(|(varray, _)| *varray == placement.virtual_array)
                .and_then(|(_, site)| site.clone());
            self.store.create_volume(leg.clone())?;
            ledger.record_created(leg.id.clone());
            legs.push(leg);
        }
        record.backing_volumes = legs.iter().map(|leg| leg.id.clone()).collect();
        self.store.create_volume(record.clone())?;
        ledger.record_created(record.id.clone());
        Ok(Entry {
            record,
            legs,
            reuse: None,
        })
    }
}

/// Targets of the active side followed by those of the standby side.
fn target_leaves(rec: &ProtectedRecommendation) -> impl Iterator<Item = &Leaf> {
    rec.targets.iter().chain(
        rec.standby
            .iter()
            .flat_map(|standby| standby.targets.iter()),
    )
}

fn new_record(
    ctx: &CompileContext<'_>,
    label: String,
    placement: &Placement,
    personality: Personality,
    capacity: u64,
) -> Volume {
    let mut record = Volume::new(
        VolumeId::generate(),
        label,
        placement.virtual_array.clone(),
        placement.virtual_pool.clone(),
        ctx.request.project.clone(),
    );
    record.personality = personality;
    record.capacity = capacity;
    record.storage_system = Some(placement.storage_system.clone());
    record.storage_pool.clone_from(&placement.storage_pool);
    record.consistency_group = ctx.group.as_ref().map(|group| group.id.clone());
    record
}
