//! Second pass: typing prepared records into descriptors.

use super::{CompileContext, CompileError, Entry};
use crate::descriptor::{
    DescriptorAction, DescriptorKind, DescriptorParam, VolumeDescriptor, creation_rank,
    verify_creation_order,
};
use crate::model::{Personality, Volume};
use crate::request::ChangeContext;

/// Converts `entries` into the ordered descriptor batch. Backing legs follow
/// their composed parent and travel at the parent's rank.
pub(super) fn descriptors(
    entries: &[Entry],
    ctx: &CompileContext<'_>,
) -> Result<Vec<VolumeDescriptor>, CompileError> {
    let mut batch = Vec::new();
    for entry in entries {
        batch.push(primary(entry, ctx));
        for leg in &entry.legs {
            batch.push(
                located(
                    VolumeDescriptor::new(
                        DescriptorAction::Create,
                        DescriptorKind::ArrayVolume,
                        leg.id.clone(),
                        entry.record.personality,
                        leg.capacity,
                    ),
                    leg,
                )
                .with_param(DescriptorParam::ParentVolume, entry.record.id.as_str()),
            );
        }
    }
    batch.sort_by_key(|descriptor| creation_rank(descriptor.personality));
    verify_creation_order(&batch).map_err(|err| CompileError::topology(err.to_string()))?;
    Ok(batch)
}

const fn classify(
    personality: Personality,
    composed: bool,
    reuse: Option<&ChangeContext>,
) -> (DescriptorAction, DescriptorKind) {
    match (personality, composed, reuse) {
        (Personality::Source, _, Some(change)) => (
            DescriptorAction::ExistingReuse,
            if change.already_protected {
                DescriptorKind::ExistingProtectedSource
            } else {
                DescriptorKind::ExistingSource
            },
        ),
        (Personality::Source, true, _) => (DescriptorAction::Create, DescriptorKind::VirtualSource),
        (Personality::Source, false, _) => {
            (DescriptorAction::Create, DescriptorKind::ProtectedSource)
        }
        (Personality::Target, true, _) => (DescriptorAction::Create, DescriptorKind::VirtualTarget),
        (Personality::Target, false, _) => {
            (DescriptorAction::Create, DescriptorKind::ProtectedTarget)
        }
        (Personality::Metadata, true, _) => {
            (DescriptorAction::Create, DescriptorKind::VirtualJournal)
        }
        (Personality::Metadata, false, _) => (DescriptorAction::Create, DescriptorKind::Journal),
        (Personality::Plain, true, _) => (DescriptorAction::Create, DescriptorKind::VirtualVolume),
        (Personality::Plain, false, _) => (DescriptorAction::Create, DescriptorKind::ArrayVolume),
    }
}

fn primary(entry: &Entry, ctx: &CompileContext<'_>) -> VolumeDescriptor {
    let record = &entry.record;
    let (action, kind) = classify(
        record.personality,
        record.is_composed(),
        entry.reuse.as_ref(),
    );
    let mut descriptor = located(
        VolumeDescriptor::new(
            action,
            kind,
            record.id.clone(),
            record.personality,
            record.capacity,
        ),
        record,
    );
    if let Some(change) = &entry.reuse {
        descriptor = descriptor
            .with_param(DescriptorParam::ExistingVolume, change.volume.as_str())
            .with_param(DescriptorParam::OldVirtualPool, change.old_virtual_pool.as_str())
            .with_param(DescriptorParam::NewVirtualPool, ctx.request.virtual_pool.as_str());
    }
    if record.personality == Personality::Source {
        if let Some(journal) = &record.journal {
            descriptor = descriptor.with_param(DescriptorParam::Journal, journal.as_str());
        }
        if let Some(standby) = &record.standby_journal {
            descriptor = descriptor.with_param(DescriptorParam::StandbyJournal, standby.as_str());
        }
        if let Some(protection) = &ctx.pool.protection {
            descriptor = descriptor.with_param(DescriptorParam::CopyMode, protection.copy_mode.name());
        }
    }
    let sites: Vec<String> = entry
        .legs
        .iter()
        .filter_map(|leg| {
            leg.internal_site
                .as_ref()
                .map(|site| format!("{}={site}", leg.id))
        })
        .collect();
    if !sites.is_empty() {
        descriptor = descriptor.with_param(DescriptorParam::BackingSites, sites.join(","));
    }
    descriptor
}

fn located(mut descriptor: VolumeDescriptor, record: &Volume) -> VolumeDescriptor {
    descriptor.storage_system.clone_from(&record.storage_system);
    descriptor.storage_pool.clone_from(&record.storage_pool);
    descriptor.consistency_group.clone_from(&record.consistency_group);
    descriptor
}
