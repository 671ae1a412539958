//! Test support utilities shared across unit and integration tests.
//!
//! [`topology`] seeds a store with two sites (`east`, `west`) and a
//! high-availability site (`ha`), three pools, and one protected
//! consistency group. The proposal builders place volumes on that topology
//! the way the scheduler would.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::controller::{ControllerFuture, OrchestrationController, Submission, SubmissionKind};
use crate::descriptor::VolumeDescriptor;
use crate::model::{
    ConsistencyGroup, ConsistencyGroupId, HighAvailability, Personality, ProjectId,
    ProtectionPolicy, ProtectionSystemId, StorageFamily, StoragePoolId, StorageSystem,
    StorageSystemId, TaskId, VirtualArray, VirtualArrayId, VirtualPool, VirtualPoolId, Volume,
    VolumeId,
};
use crate::recommendation::{
    ArrayProposal, CopyProposal, Placement, ProtectedProposal, Proposal, StandbyProposal,
    VirtualProposal,
};
use crate::request::VolumeRequest;
use crate::store::{InMemoryStore, StoreError, VolumeStore};

/// Bytes in one gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;
/// Project owning every fixture volume.
pub const PROJECT: &str = "project-1";
/// Protection appliance replicating the fixture group.
pub const PROTECTION_SYSTEM: &str = "rp-1";
/// Protected consistency group, labelled `cg1`.
pub const GROUP: &str = "cg-1";
/// Production virtual array, labelled `east`.
pub const EAST: &str = "varray-east";
/// Remote virtual array, labelled `west`.
pub const WEST: &str = "varray-west";
/// High-availability virtual array, labelled `ha`.
pub const HA: &str = "varray-ha";
/// Array in [`EAST`].
pub const EAST_ARRAY: &str = "array-east";
/// Array in [`WEST`].
pub const WEST_ARRAY: &str = "array-west";
/// Array in [`HA`].
pub const HA_ARRAY: &str = "array-ha";
/// Virtualization cluster spanning [`EAST`] and [`HA`].
pub const CLUSTER: &str = "cluster-1";
/// Protected pool with `0.25x` journals.
pub const GOLD: &str = "vpool-gold";
/// Dual-active pool with its second leg in [`HA`].
pub const METRO: &str = "vpool-metro";
/// Unprotected pool.
pub const BRONZE: &str = "vpool-bronze";

fn seeded<T>(result: Result<T, StoreError>, what: &str) -> T {
    result.unwrap_or_else(|err| panic!("seed {what}: {err}"))
}

/// Returns a store seeded with the fixture topology.
///
/// # Panics
///
/// Panics when the in-memory store rejects a fixture record.
#[must_use]
pub fn topology() -> InMemoryStore {
    let store = InMemoryStore::new();
    for (id, family) in [
        (EAST_ARRAY, StorageFamily::Vmax3),
        (WEST_ARRAY, StorageFamily::Vmax3),
        (HA_ARRAY, StorageFamily::Vmax3),
        (CLUSTER, StorageFamily::Vplex),
    ] {
        seeded(
            store.put_storage_system(StorageSystem {
                id: StorageSystemId::new(id),
                label: id.to_owned(),
                family,
            }),
            "storage system",
        );
    }
    for (id, label) in [(EAST, "east"), (WEST, "west"), (HA, "ha")] {
        seeded(
            store.put_virtual_array(VirtualArray {
                id: VirtualArrayId::new(id),
                label: label.to_owned(),
            }),
            "virtual array",
        );
    }
    let pools = [
        VirtualPool {
            id: VirtualPoolId::new(GOLD),
            label: "gold".to_owned(),
            protection: Some(ProtectionPolicy {
                journal_policy: Some("0.25x".to_owned()),
                ..ProtectionPolicy::default()
            }),
            high_availability: None,
        },
        VirtualPool {
            id: VirtualPoolId::new(METRO),
            label: "metro".to_owned(),
            protection: Some(ProtectionPolicy {
                journal_policy: Some("0.25x".to_owned()),
                dual_active: true,
                ..ProtectionPolicy::default()
            }),
            high_availability: Some(HighAvailability {
                virtual_array: VirtualArrayId::new(HA),
                virtual_pool: None,
                protect_ha_side: false,
            }),
        },
        VirtualPool {
            id: VirtualPoolId::new(BRONZE),
            label: "bronze".to_owned(),
            protection: None,
            high_availability: None,
        },
    ];
    for pool in pools {
        seeded(store.put_virtual_pool(pool), "virtual pool");
    }
    seeded(
        store.put_consistency_group(ConsistencyGroup {
            id: ConsistencyGroupId::new(GROUP),
            label: "cg1".to_owned(),
            protection_system: Some(ProtectionSystemId::new(PROTECTION_SYSTEM)),
        }),
        "consistency group",
    );
    store
}

/// Placement on `system` in `varray`, using the system's only pool.
#[must_use]
pub fn placement(varray: &str, pool: &str, system: &str) -> Placement {
    Placement {
        virtual_array: VirtualArrayId::new(varray),
        virtual_pool: VirtualPoolId::new(pool),
        storage_pool: Some(StoragePoolId::new(format!("{system}-pool"))),
        storage_system: StorageSystemId::new(system),
    }
}

/// Array proposal of `count` volumes of `size_bytes`.
#[must_use]
pub fn array_proposal(
    varray: &str,
    pool: &str,
    system: &str,
    count: u32,
    size_bytes: u64,
) -> ArrayProposal {
    ArrayProposal {
        placement: placement(varray, pool, system),
        resource_count: count,
        size_bytes,
    }
}

/// Unprotected proposal on the east array.
#[must_use]
pub fn plain_proposal(count: u32, size_bytes: u64) -> Proposal {
    Proposal::Array(array_proposal(EAST, BRONZE, EAST_ARRAY, count, size_bytes))
}

fn copy(site: &str, child: Proposal) -> CopyProposal {
    CopyProposal {
        internal_site: site.to_owned(),
        copy_name: None,
        child: Box::new(child),
    }
}

fn journal(varray: &str, pool: &str, system: &str, site: &str) -> CopyProposal {
    copy(
        site,
        Proposal::Array(array_proposal(varray, pool, system, 1, GIB)),
    )
}

/// Protected proposal: `count` sources on the east array, one target copy
/// on the west array, and a journal per copy.
#[must_use]
pub fn protected_proposal(count: u32, size_bytes: u64) -> Proposal {
    Proposal::Protected(ProtectedProposal {
        protection_system: ProtectionSystemId::new(PROTECTION_SYSTEM),
        source: copy(
            "site-east",
            Proposal::Array(array_proposal(EAST, GOLD, EAST_ARRAY, count, size_bytes)),
        ),
        targets: vec![copy(
            "site-west",
            Proposal::Array(array_proposal(WEST, GOLD, WEST_ARRAY, count, size_bytes)),
        )],
        source_journal: Some(journal(EAST, GOLD, EAST_ARRAY, "site-east")),
        standby_journal: None,
        target_journals: vec![journal(WEST, GOLD, WEST_ARRAY, "site-west")],
        standby: None,
    })
}

/// Dual-active proposal: composed sources on the cluster with legs in east
/// and ha, a standby copy in ha, and the west target proposed for both
/// production copies.
#[must_use]
pub fn dual_active_proposal(count: u32, size_bytes: u64) -> Proposal {
    let west_target = || {
        copy(
            "site-west",
            Proposal::Array(array_proposal(WEST, METRO, WEST_ARRAY, count, size_bytes)),
        )
    };
    Proposal::Protected(ProtectedProposal {
        protection_system: ProtectionSystemId::new(PROTECTION_SYSTEM),
        source: copy(
            "site-east",
            Proposal::Virtual(VirtualProposal {
                placement: Placement {
                    storage_pool: None,
                    ..placement(EAST, METRO, CLUSTER)
                },
                resource_count: count,
                size_bytes,
                legs: vec![
                    array_proposal(EAST, METRO, EAST_ARRAY, 1, size_bytes),
                    array_proposal(HA, METRO, HA_ARRAY, 1, size_bytes),
                ],
            }),
        ),
        targets: vec![west_target()],
        source_journal: Some(journal(EAST, METRO, EAST_ARRAY, "site-east")),
        standby_journal: Some(journal(HA, METRO, HA_ARRAY, "site-ha")),
        target_journals: vec![journal(WEST, METRO, WEST_ARRAY, "site-west")],
        standby: Some(StandbyProposal {
            copy: copy(
                "site-ha",
                Proposal::Array(array_proposal(HA, METRO, HA_ARRAY, count, size_bytes)),
            ),
            targets: vec![west_target()],
        }),
    })
}

/// Request for `count` volumes named `db` in the east array.
///
/// Volumes join the fixture group unless `pool` is [`BRONZE`].
///
/// # Panics
///
/// Panics when the request fails validation.
#[must_use]
pub fn request(pool: &str, count: u32, size_bytes: u64) -> VolumeRequest {
    VolumeRequest::builder()
        .name("db")
        .size_bytes(size_bytes)
        .count(count)
        .virtual_pool(pool)
        .virtual_array(EAST)
        .project(PROJECT)
        .consistency_group((pool != BRONZE).then(|| GROUP.to_owned()))
        .build()
        .unwrap_or_else(|err| panic!("fixture request should build: {err}"))
}

/// Existing protected replication set seeded by [`seed_protected_set`].
#[derive(Clone, Debug)]
pub struct ProtectedSet {
    /// Production volume in east.
    pub source: VolumeId,
    /// Target in west.
    pub target: VolumeId,
    /// Journal of the `east_SRC` copy.
    pub source_journal: VolumeId,
    /// Journal of the `west` copy.
    pub target_journal: VolumeId,
}

fn member(id: &str, personality: Personality, varray: &str, system: &str, copy: &str) -> Volume {
    let mut volume = Volume::new(
        VolumeId::new(id),
        id,
        VirtualArrayId::new(varray),
        VirtualPoolId::new(GOLD),
        ProjectId::new(PROJECT),
    );
    volume.personality = personality;
    volume.storage_system = Some(StorageSystemId::new(system));
    volume.storage_pool = Some(StoragePoolId::new(format!("{system}-pool")));
    volume.consistency_group = Some(ConsistencyGroupId::new(GROUP));
    volume.protection_system = Some(ProtectionSystemId::new(PROTECTION_SYSTEM));
    volume.copy_name = Some(copy.to_owned());
    volume
}

/// Seeds a protected source `prod` of `capacity` bytes, its west target,
/// and one `journal_capacity` journal per copy into the fixture group.
///
/// # Panics
///
/// Panics when the store rejects a record.
pub fn seed_protected_set(store: &InMemoryStore, capacity: u64, journal_capacity: u64) -> ProtectedSet {
    let set = ProtectedSet {
        source: VolumeId::new("prod"),
        target: VolumeId::new("prod-target-west"),
        source_journal: VolumeId::new("cg1_east_journal_1"),
        target_journal: VolumeId::new("cg1_west_journal_1"),
    };
    let mut source = member(set.source.as_str(), Personality::Source, EAST, EAST_ARRAY, "east_SRC");
    source.capacity = capacity;
    source.replication_set = Some("RSet-prod".to_owned());
    source.journal = Some(set.source_journal.clone());
    source.protection_targets = vec![set.target.clone()];

    let mut target = member(set.target.as_str(), Personality::Target, WEST, WEST_ARRAY, "west");
    target.capacity = capacity;
    target.replication_set = Some("RSet-prod".to_owned());
    target.journal = Some(set.target_journal.clone());

    let journals = [
        (&set.source_journal, EAST, EAST_ARRAY, "east_SRC"),
        (&set.target_journal, WEST, WEST_ARRAY, "west"),
    ];
    for (id, varray, system, copy_name) in journals {
        let mut journal = member(id.as_str(), Personality::Metadata, varray, system, copy_name);
        journal.capacity = journal_capacity;
        journal.internal_object = true;
        seeded(store.put_volume(journal), "journal");
    }
    seeded(store.put_volume(source), "source");
    seeded(store.put_volume(target), "target");
    set
}

/// Seeds an unprotected volume `legacy` of `capacity` bytes in east.
///
/// # Panics
///
/// Panics when the store rejects the record.
pub fn seed_plain_volume(store: &InMemoryStore, capacity: u64) -> VolumeId {
    let mut volume = Volume::new(
        VolumeId::new("legacy"),
        "legacy",
        VirtualArrayId::new(EAST),
        VirtualPoolId::new(BRONZE),
        ProjectId::new(PROJECT),
    );
    volume.capacity = capacity;
    volume.storage_system = Some(StorageSystemId::new(EAST_ARRAY));
    volume.storage_pool = Some(StoragePoolId::new(format!("{EAST_ARRAY}-pool")));
    let id = volume.id.clone();
    seeded(store.put_volume(volume), "plain volume");
    id
}

/// Controller entry point a [`ScriptedController`] can be told to fail.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerFailure {
    /// Fail creation batches.
    Create,
    /// Fail expansion batches.
    Expand,
    /// Fail deletion batches.
    Delete,
    /// Fail tier change batches.
    ChangeVirtualPool,
    /// Fail capacity queries.
    ObservedCapacity,
}

impl ControllerFailure {
    const fn flag(self) -> u8 {
        match self {
            Self::Create => 1 << 0,
            Self::Expand => 1 << 1,
            Self::Delete => 1 << 2,
            Self::ChangeVirtualPool => 1 << 3,
            Self::ObservedCapacity => 1 << 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Failures(u8);

impl Failures {
    const fn set(&mut self, failure: ControllerFailure) {
        self.0 |= failure.flag();
    }

    const fn contains(self, failure: ControllerFailure) -> bool {
        self.0 & failure.flag() != 0
    }
}

/// Error returned by [`ScriptedController`] for scripted failures.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("scripted controller failure: {0}")]
pub struct ScriptedFailure(pub String);

#[derive(Debug, Default)]
struct ControllerState {
    failures: Failures,
    submissions: Vec<Submission>,
    observed: BTreeMap<VolumeId, u64>,
    watched: Option<(InMemoryStore, Vec<VolumeId>)>,
    witnessed: Vec<(VolumeId, u64)>,
}

/// Controller double recording every submission, with scripted failures
/// and scripted observed capacities.
#[derive(Clone, Debug, Default)]
pub struct ScriptedController {
    state: Arc<StdMutex<ControllerState>>,
}

impl ScriptedController {
    /// Creates a controller accepting every batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `failure` reject every later call.
    ///
    /// # Panics
    ///
    /// Panics when the state lock is poisoned.
    #[must_use]
    pub fn failing(self, failure: ControllerFailure) -> Self {
        self.lock("failing").failures.set(failure);
        self
    }

    /// Scripts the capacity reported for `volume`.
    ///
    /// # Panics
    ///
    /// Panics when the state lock is poisoned.
    pub fn observe(&self, volume: &VolumeId, capacity: u64) {
        self.lock("observe").observed.insert(volume.clone(), capacity);
    }

    /// Records the stored capacity of each of `volumes` whenever a batch
    /// arrives, so tests can see what the store held at submission time.
    ///
    /// # Panics
    ///
    /// Panics when the state lock is poisoned.
    pub fn watch_capacities(&self, store: &InMemoryStore, volumes: &[VolumeId]) {
        self.lock("watch_capacities").watched = Some((store.clone(), volumes.to_vec()));
    }

    /// Returns the capacities recorded by [`Self::watch_capacities`], in
    /// submission order.
    ///
    /// # Panics
    ///
    /// Panics when the state lock is poisoned.
    #[must_use]
    pub fn witnessed_capacities(&self) -> Vec<(VolumeId, u64)> {
        self.lock("witnessed_capacities").witnessed.clone()
    }

    /// Returns every batch received, rejected ones included.
    ///
    /// # Panics
    ///
    /// Panics when the state lock is poisoned.
    #[must_use]
    pub fn submissions(&self) -> Vec<Submission> {
        self.lock("submissions").submissions.clone()
    }

    fn lock(&self, caller: &str) -> StdMutexGuard<'_, ControllerState> {
        self.state
            .lock()
            .unwrap_or_else(|err| panic!("lock poisoned: {caller}: {err}"))
    }

    fn submit(
        &self,
        kind: SubmissionKind,
        failure: ControllerFailure,
        descriptors: &[VolumeDescriptor],
        task: &TaskId,
    ) -> Result<(), ScriptedFailure> {
        let mut state = self.lock("submit");
        let witnessed: Vec<(VolumeId, u64)> = state
            .watched
            .iter()
            .flat_map(|(store, volumes)| {
                volumes.iter().filter_map(|id| {
                    store
                        .volume(id)
                        .ok()
                        .flatten()
                        .map(|volume| (volume.id, volume.capacity))
                })
            })
            .collect();
        state.witnessed.extend(witnessed);
        state.submissions.push(Submission {
            kind,
            task: task.clone(),
            descriptors: descriptors.to_vec(),
        });
        if state.failures.contains(failure) {
            return Err(ScriptedFailure(format!("{kind:?} rejected")));
        }
        Ok(())
    }
}

impl OrchestrationController for ScriptedController {
    type Error = ScriptedFailure;

    fn create_volumes<'a>(
        &'a self,
        descriptors: &'a [VolumeDescriptor],
        task: &'a TaskId,
    ) -> ControllerFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.submit(SubmissionKind::Create, ControllerFailure::Create, descriptors, task)
        })
    }

    fn expand_volume<'a>(
        &'a self,
        descriptors: &'a [VolumeDescriptor],
        _new_size: u64,
        task: &'a TaskId,
    ) -> ControllerFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.submit(SubmissionKind::Expand, ControllerFailure::Expand, descriptors, task)
        })
    }

    fn delete_volumes<'a>(
        &'a self,
        descriptors: &'a [VolumeDescriptor],
        task: &'a TaskId,
    ) -> ControllerFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.submit(SubmissionKind::Delete, ControllerFailure::Delete, descriptors, task)
        })
    }

    fn change_virtual_pool<'a>(
        &'a self,
        descriptors: &'a [VolumeDescriptor],
        task: &'a TaskId,
    ) -> ControllerFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.submit(
                SubmissionKind::ChangeVirtualPool,
                ControllerFailure::ChangeVirtualPool,
                descriptors,
                task,
            )
        })
    }

    fn observed_capacity<'a>(
        &'a self,
        volume: &'a VolumeId,
    ) -> ControllerFuture<'a, Option<u64>, Self::Error> {
        Box::pin(async move {
            let state = self.lock("observed_capacity");
            if state.failures.contains(ControllerFailure::ObservedCapacity) {
                return Err(ScriptedFailure(format!("capacity of {volume} unknown")));
            }
            Ok(state.observed.get(volume).copied())
        })
    }
}

#[derive(Debug, Default)]
struct StoreFaults {
    updates: BTreeSet<VolumeId>,
    deletions: bool,
}

/// Store wrapper failing selected writes, for compensation tests.
#[derive(Debug, Default)]
pub struct FaultyStore<S> {
    inner: S,
    faults: StdMutex<StoreFaults>,
}

impl<S> FaultyStore<S> {
    /// Wraps `inner` with no faults armed.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: StdMutex::default(),
        }
    }

    /// Returns the wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// Makes every later update of `volume` fail.
    ///
    /// # Panics
    ///
    /// Panics when the fault lock is poisoned.
    pub fn fail_updates_of(&self, volume: &VolumeId) {
        self.faults().updates.insert(volume.clone());
    }

    /// Makes every later deletion mark fail.
    ///
    /// # Panics
    ///
    /// Panics when the fault lock is poisoned.
    pub fn fail_deletions(&self) {
        self.faults().deletions = true;
    }

    fn faults(&self) -> StdMutexGuard<'_, StoreFaults> {
        self.faults
            .lock()
            .unwrap_or_else(|err| panic!("lock poisoned: faults: {err}"))
    }
}

impl<S> VolumeStore for FaultyStore<S>
where
    S: VolumeStore,
{
    fn volume(&self, id: &VolumeId) -> Result<Option<Volume>, StoreError> {
        self.inner.volume(id)
    }

    fn create_volume(&self, volume: Volume) -> Result<(), StoreError> {
        self.inner.create_volume(volume)
    }

    fn update_volume(&self, volume: &Volume) -> Result<(), StoreError> {
        if self.faults().updates.contains(&volume.id) {
            return Err(StoreError::Unavailable(format!("update of {} refused", volume.id)));
        }
        self.inner.update_volume(volume)
    }

    fn mark_for_deletion(&self, id: &VolumeId) -> Result<(), StoreError> {
        if self.faults().deletions {
            return Err(StoreError::Unavailable(format!("deletion of {id} refused")));
        }
        self.inner.mark_for_deletion(id)
    }

    fn storage_system(&self, id: &StorageSystemId) -> Result<Option<StorageSystem>, StoreError> {
        self.inner.storage_system(id)
    }

    fn virtual_array(&self, id: &VirtualArrayId) -> Result<Option<VirtualArray>, StoreError> {
        self.inner.virtual_array(id)
    }

    fn virtual_pool(&self, id: &VirtualPoolId) -> Result<Option<VirtualPool>, StoreError> {
        self.inner.virtual_pool(id)
    }

    fn consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<Option<ConsistencyGroup>, StoreError> {
        self.inner.consistency_group(id)
    }

    fn volumes_in_consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<Vec<Volume>, StoreError> {
        self.inner.volumes_in_consistency_group(id)
    }

    fn volumes_in_replication_group(
        &self,
        system: &StorageSystemId,
        group: &str,
    ) -> Result<Vec<Volume>, StoreError> {
        self.inner.volumes_in_replication_group(system, group)
    }

    fn snapshot_count(&self, volume: &VolumeId) -> Result<usize, StoreError> {
        self.inner.snapshot_count(volume)
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets `set` and removes `unset` while holding the global mutex.
    pub async fn apply(set: &[(&str, &str)], unset: &[&str]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                set.iter()
                    .map(|(key, _)| *key)
                    .chain(unset.iter().copied())
                    .all(|key| seen.insert(key))
            },
            "duplicate environment variable keys passed to EnvGuard::apply"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(set.len().saturating_add(unset.len()));
        for (key, value) in set {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
        }
        for key in unset {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Sets multiple environment variables while holding the global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        Self::apply(pairs, &[]).await
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in self.previous.iter().rev() {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
