//! Label and copy-name derivation.

use crate::model::{Personality, VirtualArray, Volume};

/// Role of a replication copy, used to derive its name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopyRole {
    /// Only production copy.
    Production,
    /// Active production copy of a dual-active topology.
    ActiveProduction,
    /// Standby production copy of a dual-active topology.
    StandbyProduction,
    /// Remote or local target copy.
    Target,
}

impl CopyRole {
    const fn is_production(self) -> bool {
        !matches!(self, Self::Target)
    }
}

/// Returns the copy name for `virtual_array`. A copy already recorded in the
/// consistency group for that array wins, then the name `proposed` by the
/// scheduler, then a name derived from the array label.
#[must_use]
pub fn copy_name(
    group_volumes: &[Volume],
    virtual_array: &VirtualArray,
    role: CopyRole,
    proposed: Option<&str>,
) -> String {
    existing_copy_name(group_volumes, virtual_array, role)
        .or_else(|| proposed.map(str::to_owned))
        .unwrap_or_else(|| match role {
            CopyRole::Production => format!("{}_SRC", virtual_array.label),
            CopyRole::ActiveProduction => format!("{}_MP_ACTIVE", virtual_array.label),
            CopyRole::StandbyProduction => format!("{}_MP_STANDBY", virtual_array.label),
            CopyRole::Target => virtual_array.label.clone(),
        })
}

/// Returns the copy name already used in the group for `virtual_array`.
#[must_use]
pub fn existing_copy_name(
    group_volumes: &[Volume],
    virtual_array: &VirtualArray,
    role: CopyRole,
) -> Option<String> {
    let wanted = if role.is_production() {
        Personality::Source
    } else {
        Personality::Target
    };
    group_volumes
        .iter()
        .filter(|volume| volume.personality == wanted && volume.virtual_array == virtual_array.id)
        .find_map(|volume| volume.copy_name.clone())
}

/// Label of the `index`-th (zero based) volume of a request for `count`.
#[must_use]
pub fn volume_label(name: &str, index: u32, count: u32) -> String {
    if count > 1 {
        format!("{name}-{}", index.saturating_add(1))
    } else {
        name.to_owned()
    }
}

/// Replication set shared by a source and its targets.
#[must_use]
pub fn replication_set(label: &str) -> String {
    format!("RSet-{label}")
}

/// Label of the target of `source_label` in `virtual_array`.
#[must_use]
pub fn target_label(source_label: &str, virtual_array: &VirtualArray) -> String {
    format!("{source_label}-target-{}", virtual_array.label)
}

/// Label of the `index`-th backing leg of `parent_label`.
#[must_use]
pub fn backing_label(parent_label: &str, index: usize) -> String {
    format!("{parent_label}-{index}")
}

/// Key of the lock serialising journal naming for one group and array.
#[must_use]
pub fn journal_lock_key(group_label: &str, virtual_array: &VirtualArray) -> String {
    format!("{group_label}-{}", virtual_array.label)
}

/// Returns the first `<group>_<array>_journal_<n>` label, counting from one,
/// not already used by `group_volumes`.
#[must_use]
pub fn next_journal_label(
    group_volumes: &[Volume],
    group_label: &str,
    virtual_array: &VirtualArray,
) -> String {
    let prefix = format!("{group_label}_{}_journal_", virtual_array.label);
    let mut candidate: u32 = 1;
    loop {
        let label = format!("{prefix}{candidate}");
        if !group_volumes.iter().any(|volume| volume.label == label) {
            return label;
        }
        candidate = candidate.saturating_add(1);
    }
}
