//! Journal preparation: reuse of sufficient journals and lock-serialised
//! creation of new ones.

use tracing::{debug, info};

use super::naming::{self, CopyRole};
use super::{
    Batch, CompileContext, CompileError, JournalSizePolicy, ProtectedScope, ProvisionLedger,
    VolumeDescriptorCompiler, new_record, target_leaves,
};
use crate::lock::NamedLockService;
use crate::model::{AccessState, Personality, VirtualArrayId, VolumeId};
use crate::recommendation::{JournalRole, Leaf};
use crate::store::VolumeStore;

/// Journals serving the copies of one protected recommendation.
#[derive(Clone, Debug, Default)]
pub(super) struct JournalRefs {
    pub(super) active: Option<VolumeId>,
    pub(super) standby: Option<VolumeId>,
    targets: Vec<(VirtualArrayId, VolumeId)>,
}

impl JournalRefs {
    pub(super) fn target(&self, virtual_array: &VirtualArrayId) -> Option<&VolumeId> {
        self.targets
            .iter()
            .find(|(varray, _)| varray == virtual_array)
            .map(|(_, journal)| journal)
    }
}

/// How an existing journal of the copy may satisfy the request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Demand {
    /// Reuse the copy's journals when they cover the grown copy under policy.
    ReuseIfSufficient,
    /// Reuse any existing journal of the copy as is.
    ReuseExisting,
}

struct JournalNeed<'s> {
    role: JournalRole,
    copy: String,
    recommended: Option<&'s Leaf>,
    demand: Demand,
}

struct JournalSpec<'s> {
    leaf: &'s Leaf,
    copy: String,
    capacity: u64,
    label: Option<String>,
}

impl<S, L> VolumeDescriptorCompiler<'_, S, L>
where
    S: VolumeStore,
    L: NamedLockService,
{
    pub(super) async fn prepare_journals(
        &self,
        ctx: &CompileContext<'_>,
        scope: &ProtectedScope<'_>,
        batch: &mut Batch,
        ledger: &mut ProvisionLedger,
    ) -> Result<JournalRefs, CompileError> {
        if ctx.capabilities.journal_only() {
            return self.add_journals(ctx, scope, batch, ledger).await;
        }
        let rec = scope.rec;
        let demand = if ctx.capabilities.upgrades_protected_volume() {
            Demand::ReuseExisting
        } else {
            Demand::ReuseIfSufficient
        };
        let mut refs = JournalRefs {
            active: Some(
                self.resolve_journal(
                    ctx,
                    scope,
                    JournalNeed {
                        role: JournalRole::Source,
                        copy: scope.copies.active.clone(),
                        recommended: rec.journal(JournalRole::Source),
                        demand,
                    },
                    batch,
                    ledger,
                )
                .await?,
            ),
            ..JournalRefs::default()
        };
        if let Some(standby_copy) = &scope.copies.standby {
            refs.standby = Some(
                self.resolve_journal(
                    ctx,
                    scope,
                    JournalNeed {
                        role: JournalRole::Standby,
                        copy: standby_copy.clone(),
                        recommended: rec.journal(JournalRole::Standby),
                        demand: Demand::ReuseIfSufficient,
                    },
                    batch,
                    ledger,
                )
                .await?,
            );
        }
        for leaf in target_leaves(rec) {
            if refs.target(leaf.virtual_array()).is_some() {
                continue;
            }
            let varray = self.store.require_virtual_array(leaf.virtual_array())?;
            let journal = self
                .resolve_journal(
                    ctx,
                    scope,
                    JournalNeed {
                        role: JournalRole::Target,
                        copy: naming::copy_name(
                            &scope.members,
                            &varray,
                            CopyRole::Target,
                            leaf.copy_name.as_deref(),
                        ),
                        recommended: rec.target_journal(leaf.virtual_array()),
                        demand,
                    },
                    batch,
                    ledger,
                )
                .await?;
            refs.targets.push((varray.id, journal));
        }
        Ok(refs)
    }

    /// Creates every recommended journal, `resource_count` times each, for
    /// a journal-only request. The journals are the request's task volumes.
    async fn add_journals(
        &self,
        ctx: &CompileContext<'_>,
        scope: &ProtectedScope<'_>,
        batch: &mut Batch,
        ledger: &mut ProvisionLedger,
    ) -> Result<JournalRefs, CompileError> {
        if scope.rec.journals.is_empty() {
            return Err(CompileError::topology(
                "journal capacity request carries no journal recommendation",
            ));
        }
        let mut refs = JournalRefs::default();
        for journal in &scope.rec.journals {
            let copy = match journal.role {
                JournalRole::Source => scope.copies.active.clone(),
                JournalRole::Standby => scope.copies.standby.clone().ok_or_else(|| {
                    CompileError::topology("standby journal requested for a pool without a standby copy")
                })?,
                JournalRole::Target => {
                    let varray = self.store.require_virtual_array(journal.leaf.virtual_array())?;
                    naming::copy_name(
                        &scope.members,
                        &varray,
                        CopyRole::Target,
                        journal.leaf.copy_name.as_deref(),
                    )
                }
            };
            let count = journal.leaf.resource_count;
            for index in 0..count {
                let id = self
                    .create_journal(
                        ctx,
                        scope,
                        JournalSpec {
                            leaf: &journal.leaf,
                            copy: copy.clone(),
                            capacity: ctx.capabilities.size_bytes(),
                            label: Some(naming::volume_label(&ctx.request.name, index, count)),
                        },
                        batch,
                        ledger,
                    )
                    .await?;
                batch.tasks.push(id.clone());
                match journal.role {
                    JournalRole::Source if refs.active.is_none() => refs.active = Some(id),
                    JournalRole::Standby if refs.standby.is_none() => refs.standby = Some(id),
                    JournalRole::Source | JournalRole::Standby => {}
                    JournalRole::Target => {
                        refs.targets.push((journal.leaf.virtual_array().clone(), id));
                    }
                }
            }
        }
        Ok(refs)
    }

    async fn resolve_journal(
        &self,
        ctx: &CompileContext<'_>,
        scope: &ProtectedScope<'_>,
        need: JournalNeed<'_>,
        batch: &mut Batch,
        ledger: &mut ProvisionLedger,
    ) -> Result<VolumeId, CompileError> {
        let existing: Vec<_> = scope
            .members
            .iter()
            .filter(|member| member.personality == Personality::Metadata && member.in_copy(&need.copy))
            .collect();
        if let Some(first) = existing.first() {
            let reusable = match need.demand {
                Demand::ReuseExisting => true,
                Demand::ReuseIfSufficient => {
                    let policy = self.journal_policy(ctx, need.role, need.recommended)?;
                    let journal_capacity = existing
                        .iter()
                        .fold(0_u64, |total, journal| total.saturating_add(journal.capacity));
                    let protected_capacity = scope
                        .members
                        .iter()
                        .filter(|member| member.personality == Personality::Source)
                        .fold(ctx.new_source_capacity(), |total, source| {
                            total.saturating_add(source.capacity)
                        });
                    let required =
                        policy.journal_size(protected_capacity, self.settings.journal_minimum_bytes);
                    debug!(copy = %need.copy, journal_capacity, required, "checked journal sizing policy");
                    journal_capacity >= required
                }
            };
            if reusable {
                info!(journal = %first.id, copy = %need.copy, "reusing existing journal");
                batch.reused_journals.push(first.id.clone());
                return Ok(first.id.clone());
            }
            info!(copy = %need.copy, "existing journals are too small, adding a journal");
        }

        let leaf = need.recommended.ok_or_else(|| {
            CompileError::topology(format!(
                "no {} journal recommendation for copy {}",
                need.role.name(),
                need.copy
            ))
        })?;
        let policy = self.journal_policy(ctx, need.role, Some(leaf))?;
        let capacity =
            policy.journal_size(ctx.new_source_capacity(), self.settings.journal_minimum_bytes);
        self.create_journal(
            ctx,
            scope,
            JournalSpec {
                leaf,
                copy: need.copy,
                capacity,
                label: None,
            },
            batch,
            ledger,
        )
        .await
    }

    /// Names and persists one journal while holding the lock for its group
    /// and virtual array.
    async fn create_journal(
        &self,
        ctx: &CompileContext<'_>,
        scope: &ProtectedScope<'_>,
        spec: JournalSpec<'_>,
        batch: &mut Batch,
        ledger: &mut ProvisionLedger,
    ) -> Result<VolumeId, CompileError> {
        let varray = self.store.require_virtual_array(spec.leaf.virtual_array())?;
        let key = naming::journal_lock_key(&scope.group.label, &varray);
        let guard = self.locks.acquire(&key, self.settings.lock_timeout).await?;

        let members = self.store.volumes_in_consistency_group(&scope.group.id)?;
        let label = spec
            .label
            .unwrap_or_else(|| naming::next_journal_label(&members, &scope.group.label, &varray));
        let mut record = new_record(
            ctx,
            label,
            &spec.leaf.placement,
            Personality::Metadata,
            spec.capacity,
        );
        record.copy_name = Some(spec.copy);
        record.internal_site.clone_from(&spec.leaf.internal_site);
        record.protection_system = Some(scope.rec.protection_system.clone());
        record.access = AccessState::NotReady;
        record.internal_object = true;
        record.supports_force = true;
        let sites = [(
            spec.leaf.virtual_array().clone(),
            spec.leaf.internal_site.clone(),
        )];
        let entry = self.persist(ctx, record, spec.leaf, &sites, ledger)?;
        drop(guard);

        info!(journal = %entry.record.id, label = %entry.record.label, lock = %key, "created journal");
        let id = entry.record.id.clone();
        batch.entries.push(entry);
        Ok(id)
    }

    /// Journal policy for `role`: target copies use their own pool's policy
    /// when it has one; every copy falls back to the configured default.
    fn journal_policy(
        &self,
        ctx: &CompileContext<'_>,
        role: JournalRole,
        leaf: Option<&Leaf>,
    ) -> Result<JournalSizePolicy, CompileError> {
        let protection = ctx.pool.protection.as_ref();
        let configured = match role {
            JournalRole::Source => protection.and_then(|policy| policy.journal_policy.clone()),
            JournalRole::Standby => protection.and_then(|policy| {
                policy
                    .standby_journal_policy
                    .clone()
                    .or_else(|| policy.journal_policy.clone())
            }),
            JournalRole::Target => {
                let target_pool = match leaf {
                    Some(target) if target.placement.virtual_pool != ctx.pool.id => {
                        self.store.virtual_pool(&target.placement.virtual_pool)?
                    }
                    _ => None,
                };
                target_pool
                    .and_then(|pool| pool.protection)
                    .and_then(|policy| policy.journal_policy)
                    .or_else(|| protection.and_then(|policy| policy.journal_policy.clone()))
            }
        };
        configured.map_or(Ok(self.settings.default_journal_policy), |text| {
            text.parse::<JournalSizePolicy>().map_err(CompileError::from)
        })
    }
}
