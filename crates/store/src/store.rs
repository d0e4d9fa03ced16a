use crate::config::{RetryPolicy, StoreConfig};
use crate::error::{Result, StoreError};
use crate::hasher::{is_hex_prefix, Fingerprint};
use crate::index::QueryIndex;
use crate::payload::{MemoryPayloadStore, PayloadStore};
use crate::types::{
    Atom, AtomKind, AtomOwner, EvictedAtom, FileId, GcReport, InvariantReport, PrefixScan,
    ReleaseOutcome, UnlinkOutcome,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

type Shard = HashMap<Fingerprint, Entry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Payload write in flight; only the creator may touch the entry
    Pending,
    Ready,
    /// Payload delete in flight
    Evicting,
}

#[derive(Debug)]
struct Entry {
    atom: Atom,
    /// References acquired by `get_or_create` and not yet linked to a file
    unclaimed: u64,
    state: EntryState,
    /// Closes when the pending write or eviction settles; `true` was sent
    /// if it completed
    settled: Option<watch::Receiver<bool>>,
}

impl Entry {
    fn ready(atom: Atom, unclaimed: u64) -> Self {
        Self {
            atom,
            unclaimed,
            state: EntryState::Ready,
            settled: None,
        }
    }

    /// Placeholder that keeps creators away while a stray payload is deleted
    fn sweeping(fingerprint: Fingerprint, settled: watch::Receiver<bool>) -> Self {
        Self {
            atom: Atom {
                fingerprint,
                size: 0,
                kind: AtomKind::Binary,
                created_at: Utc::now(),
                creation_seq: 0,
                usage_count: 0,
                owners: Vec::new(),
            },
            unclaimed: 0,
            state: EntryState::Evicting,
            settled: Some(settled),
        }
    }

    fn is_visible(&self) -> bool {
        self.state == EntryState::Ready && self.atom.usage_count > 0
    }
}

/// Outcome of one acquisition attempt
enum Acquired {
    Atom(Atom, bool),
    /// Another caller is writing or evicting the payload
    Busy(watch::Receiver<bool>),
}

/// Content-addressed atom store with reference counting.
///
/// Metadata is split across shards picked by the fingerprint's first byte.
/// Every critical section is synchronous; payload I/O happens with no lock
/// held, guarded by the `Pending` and `Evicting` entry states. Callers that
/// meet such an entry wait for it to settle instead of polling. The query
/// index holds exactly the visible atoms (ready, `usage_count > 0`) and is
/// only mutated while the owning shard is locked.
pub struct AtomStore {
    shards: Vec<RwLock<Shard>>,
    index: QueryIndex,
    payloads: Arc<dyn PayloadStore>,
    retry: RetryPolicy,
    next_seq: AtomicU64,
}

impl AtomStore {
    pub fn new(config: StoreConfig, payloads: Arc<dyn PayloadStore>) -> Result<Self> {
        config.validate().map_err(StoreError::invalid_input)?;
        log::debug!(
            "AtomStore configured: shards={} retry={:?}",
            config.shards,
            config.retry
        );

        Ok(Self {
            shards: (0..config.shards).map(|_| RwLock::default()).collect(),
            index: QueryIndex::new(),
            payloads,
            retry: config.retry,
            next_seq: AtomicU64::new(0),
        })
    }

    /// Store with default configuration and in-memory payloads
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            shards: (0..StoreConfig::default().shards)
                .map(|_| RwLock::default())
                .collect(),
            index: QueryIndex::new(),
            payloads: Arc::new(MemoryPayloadStore::new()),
            retry: RetryPolicy::default(),
            next_seq: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn payloads(&self) -> &Arc<dyn PayloadStore> {
        &self.payloads
    }

    fn shard_of(&self, fingerprint: &Fingerprint) -> &RwLock<Shard> {
        &self.shards[fingerprint.leading_byte() as usize % self.shards.len()]
    }

    fn read_shard(&self, fingerprint: &Fingerprint) -> RwLockReadGuard<'_, Shard> {
        self.shard_of(fingerprint)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shard(&self, fingerprint: &Fingerprint) -> RwLockWriteGuard<'_, Shard> {
        self.shard_of(fingerprint)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire one reference to the atom holding `data`, creating it if
    /// needed. Returns the atom and whether this call moved its usage from
    /// zero to one (a fresh atom or a resurrected orphan).
    ///
    /// The reference stays unclaimed until [`AtomStore::link_file`]
    /// attributes it to a file or [`AtomStore::release`] drops it.
    ///
    /// A caller that finds the atom mid-write or mid-eviction waits for
    /// that operation however long it takes. Only operations that were
    /// abandoned (failed or cancelled) count against the retry policy.
    pub async fn get_or_create(
        &self,
        fingerprint: &Fingerprint,
        data: &[u8],
        kind: AtomKind,
    ) -> Result<(Atom, bool)> {
        if data.is_empty() {
            return Err(StoreError::invalid_input("atom payload must not be empty"));
        }

        let mut attempt = 0;
        while attempt < self.retry.max_attempts {
            let settled = match self.try_get_or_create(fingerprint, data, kind).await? {
                Acquired::Atom(atom, is_new) => return Ok((atom, is_new)),
                Acquired::Busy(settled) => settled,
            };
            match wait_settled(fingerprint, settled).await {
                Err(StoreError::ConcurrencyConflict(reason)) => {
                    let delay = self.retry.delay(attempt);
                    log::trace!("Retrying {fingerprint} in {delay:?}: {reason}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => other?,
            }
        }

        log::warn!(
            "Gave up on atom {fingerprint} after {} abandoned writes or evictions",
            self.retry.max_attempts
        );
        Err(StoreError::unavailable(format!(
            "atom {fingerprint} is busy, gave up after {} attempts",
            self.retry.max_attempts
        )))
    }

    async fn try_get_or_create(
        &self,
        fingerprint: &Fingerprint,
        data: &[u8],
        kind: AtomKind,
    ) -> Result<Acquired> {
        let (created, settled) = watch::channel(false);
        {
            let mut shard = self.write_shard(fingerprint);
            if let Some(entry) = shard.get_mut(fingerprint) {
                if entry.state != EntryState::Ready {
                    return entry.settled.clone().map(Acquired::Busy).ok_or_else(|| {
                        StoreError::unavailable(format!(
                            "atom {fingerprint} is {:?} with nothing to wait on",
                            entry.state
                        ))
                    });
                }
                let resurrected = entry.atom.usage_count == 0;
                entry.atom.usage_count += 1;
                entry.unclaimed += 1;
                if resurrected {
                    self.index.insert(fingerprint.clone());
                    log::debug!("Resurrected orphan atom {fingerprint}");
                }
                return Ok(Acquired::Atom(entry.atom.clone(), resurrected));
            }

            let atom = Atom {
                fingerprint: fingerprint.clone(),
                size: data.len() as u64,
                kind,
                created_at: Utc::now(),
                creation_seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                usage_count: 1,
                owners: Vec::new(),
            };
            shard.insert(
                fingerprint.clone(),
                Entry {
                    atom,
                    unclaimed: 1,
                    state: EntryState::Pending,
                    settled: Some(settled),
                },
            );
        }

        let mut pending = PendingGuard {
            store: self,
            fingerprint,
            armed: true,
            created,
        };

        if let Err(err) = self.payloads.put(fingerprint, data).await {
            log::warn!("Failed to write payload for {fingerprint}: {err}");
            return Err(StoreError::unavailable(format!(
                "failed to write payload for {fingerprint}: {err}"
            )));
        }

        pending.armed = false;
        let atom = {
            let mut shard = self.write_shard(fingerprint);
            let entry = shard.get_mut(fingerprint).ok_or_else(|| {
                StoreError::unavailable(format!("pending atom {fingerprint} disappeared"))
            })?;
            entry.state = EntryState::Ready;
            entry.settled = None;
            self.index.insert(fingerprint.clone());
            entry.atom.clone()
        };
        pending.created.send_replace(true);
        log::debug!("Created atom {fingerprint} ({} bytes, {kind})", data.len());
        Ok(Acquired::Atom(atom, true))
    }

    /// Attribute `references` unclaimed references to `file_id`.
    ///
    /// Returns `false` without changing anything when the file already owns
    /// the atom.
    pub fn link_file(
        &self,
        fingerprint: &Fingerprint,
        file_id: &FileId,
        references: u64,
    ) -> Result<bool> {
        if references == 0 {
            return Err(StoreError::invalid_input("cannot link zero references"));
        }

        let mut shard = self.write_shard(fingerprint);
        let entry = ready_entry(&mut shard, fingerprint)?;
        if entry.atom.owners.iter().any(|owner| &owner.file_id == file_id) {
            return Ok(false);
        }
        if entry.unclaimed < references {
            return Err(StoreError::invalid_input(format!(
                "atom {fingerprint} has {} unclaimed references, cannot link {references} to {file_id}",
                entry.unclaimed
            )));
        }

        entry.unclaimed -= references;
        entry.atom.owners.push(AtomOwner {
            file_id: file_id.clone(),
            references,
        });
        Ok(true)
    }

    /// Remove `file_id` and all of its references from the atom
    pub fn unlink_file(&self, fingerprint: &Fingerprint, file_id: &FileId) -> Result<UnlinkOutcome> {
        let mut shard = self.write_shard(fingerprint);
        let entry = ready_entry(&mut shard, fingerprint)?;
        let position = entry
            .atom
            .owners
            .iter()
            .position(|owner| &owner.file_id == file_id)
            .ok_or_else(|| {
                StoreError::not_found(format!("file {file_id} is not linked to atom {fingerprint}"))
            })?;

        let owner = entry.atom.owners.remove(position);
        entry.atom.usage_count = entry.atom.usage_count.saturating_sub(owner.references);
        let orphaned = entry.atom.usage_count == 0;
        if orphaned {
            self.index.remove(fingerprint);
            log::debug!("Atom {fingerprint} orphaned by unlinking {file_id}");
        }

        Ok(UnlinkOutcome {
            size: entry.atom.size,
            references_removed: owner.references,
            remaining_usage: entry.atom.usage_count,
            orphaned,
        })
    }

    /// Drop one unclaimed reference, undoing a `get_or_create`
    pub fn release(&self, fingerprint: &Fingerprint) -> Result<ReleaseOutcome> {
        let mut shard = self.write_shard(fingerprint);
        let entry = ready_entry(&mut shard, fingerprint)?;
        if entry.unclaimed == 0 {
            return Err(StoreError::invalid_input(format!(
                "atom {fingerprint} has no unclaimed reference to release"
            )));
        }

        entry.unclaimed -= 1;
        entry.atom.usage_count -= 1;
        let orphaned = entry.atom.usage_count == 0;
        if orphaned {
            self.index.remove(fingerprint);
        }

        Ok(ReleaseOutcome {
            size: entry.atom.size,
            remaining_usage: entry.atom.usage_count,
            orphaned,
        })
    }

    /// Visible atom by fingerprint; orphans are reported as not found
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Atom> {
        self.read_shard(fingerprint)
            .get(fingerprint)
            .filter(|entry| entry.is_visible())
            .map(|entry| entry.atom.clone())
            .ok_or_else(|| StoreError::not_found(format!("atom {fingerprint}")))
    }

    /// Visible atoms whose fingerprint starts with `prefix`, in
    /// lexicographic order, at most `limit` of them.
    ///
    /// The prefix is case-insensitive and must be hex.
    pub fn search_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<Atom>> {
        Ok(self.scan_prefix(prefix, limit)?.atoms)
    }

    /// Like [`AtomStore::search_by_prefix`], plus the number of visible
    /// atoms matching `prefix` taken from the same index read.
    pub fn scan_prefix(&self, prefix: &str, limit: usize) -> Result<PrefixScan> {
        let prefix = normalize_prefix(prefix)?;
        let (keys, mut total) = self.index.prefix_scan(&prefix, limit);
        let mut atoms = Vec::with_capacity(keys.len());
        for key in keys {
            // The atom may have been orphaned since the index was read.
            match self.get(&key) {
                Ok(atom) => atoms.push(atom),
                Err(_) => total = total.saturating_sub(1),
            }
        }
        Ok(PrefixScan { atoms, total })
    }

    /// Number of visible atoms matching `prefix`
    pub fn count_by_prefix(&self, prefix: &str) -> Result<usize> {
        let prefix = normalize_prefix(prefix)?;
        Ok(self.index.prefix_scan(&prefix, 0).1)
    }

    /// Bytes of a visible atom
    pub async fn read_payload(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        let atom = self.get(fingerprint)?;
        let data = match self.payloads.get(fingerprint).await {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => {
                return Err(StoreError::unavailable(format!(
                    "payload for live atom {fingerprint} is missing"
                )));
            }
            Err(err) => return Err(err),
        };
        if data.len() as u64 != atom.size {
            return Err(StoreError::unavailable(format!(
                "payload for atom {fingerprint} has {} bytes, expected {}",
                data.len(),
                atom.size
            )));
        }
        Ok(data)
    }

    /// Number of visible atoms
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Every visible atom, ordered by fingerprint
    #[must_use]
    pub fn atoms(&self) -> Vec<Atom> {
        let mut atoms: Vec<Atom> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .filter(|entry| entry.is_visible())
                    .map(|entry| entry.atom.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        atoms.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        atoms
    }

    /// Evict every orphan: delete its payload, then its metadata.
    ///
    /// Orphans whose payload cannot be deleted stay in place and are
    /// counted as deferred; a later pass retries them.
    pub async fn collect_garbage(&self) -> Result<GcReport> {
        let mut candidates = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.write().unwrap_or_else(PoisonError::into_inner);
            for entry in shard.values_mut() {
                if entry.state == EntryState::Ready && entry.atom.usage_count == 0 {
                    let (evicted, settled) = watch::channel(false);
                    entry.state = EntryState::Evicting;
                    entry.settled = Some(settled);
                    candidates.push((entry.atom.fingerprint.clone(), entry.atom.size, evicted));
                }
            }
        }

        let mut report = GcReport::default();
        for (fingerprint, size, evicted) in candidates {
            let mut eviction = EvictionGuard {
                store: self,
                fingerprint: fingerprint.clone(),
                armed: true,
                evicted,
            };

            if let Err(err) = self.payloads.delete(&fingerprint).await {
                log::warn!("Deferring eviction of {fingerprint}: {err}");
                report.deferred += 1;
                continue;
            }

            eviction.armed = false;
            self.write_shard(&fingerprint).remove(&fingerprint);
            eviction.evicted.send_replace(true);
            drop(eviction);
            report.bytes_freed += size;
            report.evicted.push(EvictedAtom { fingerprint, size });
        }

        self.sweep_stray_payloads(&mut report).await;

        if !report.evicted.is_empty() || report.deferred > 0 || report.stray_payloads > 0 {
            log::info!(
                "Garbage collection evicted {} atoms ({} bytes), removed {} stray payloads, deferred {}",
                report.evicted.len(),
                report.bytes_freed,
                report.stray_payloads,
                report.deferred
            );
        }
        Ok(report)
    }

    /// Delete payloads no atom refers to, such as those written by an
    /// ingestion whose process died before its catalog was saved
    async fn sweep_stray_payloads(&self, report: &mut GcReport) {
        let stored = match self.payloads.list().await {
            Ok(stored) => stored,
            Err(err) => {
                log::warn!("Skipping stray payload sweep: {err}");
                return;
            }
        };

        for fingerprint in stored {
            let (swept, settled) = watch::channel(false);
            {
                let mut shard = self.write_shard(&fingerprint);
                if shard.contains_key(&fingerprint) {
                    continue;
                }
                shard.insert(
                    fingerprint.clone(),
                    Entry::sweeping(fingerprint.clone(), settled),
                );
            }
            let _sweep = SweepGuard {
                store: self,
                fingerprint: fingerprint.clone(),
                _swept: swept,
            };

            match self.payloads.delete(&fingerprint).await {
                Ok(()) => {
                    log::debug!("Removed stray payload {fingerprint}");
                    report.stray_payloads += 1;
                }
                Err(err) => {
                    log::warn!("Could not remove stray payload {fingerprint}: {err}");
                    report.deferred += 1;
                }
            }
        }
    }

    /// Check reference-count invariants, index agreement and that every
    /// ready atom still has its payload.
    ///
    /// Meaningful on a quiescent store; concurrent mutations can show up as
    /// transient violations.
    pub async fn verify(&self) -> InvariantReport {
        let (mut report, ready) = self.check_metadata();
        for (fingerprint, size) in ready {
            match self.payloads.contains(&fingerprint).await {
                Ok(true) => {}
                Ok(false) => report.violations.push(format!(
                    "payload for atom {fingerprint} ({size} bytes) is missing"
                )),
                Err(err) => report.violations.push(format!(
                    "cannot check payload for atom {fingerprint}: {err}"
                )),
            }
        }
        report
    }

    /// Metadata half of [`AtomStore::verify`]; also returns the ready atoms
    /// whose payloads need checking
    fn check_metadata(&self) -> (InvariantReport, Vec<(Fingerprint, u64)>) {
        let mut report = InvariantReport::default();
        let mut ready = Vec::new();
        let mut visible = 0usize;

        for shard in &self.shards {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            for (key, entry) in shard.iter() {
                report.unclaimed_references += entry.unclaimed;
                if entry.state != EntryState::Ready {
                    continue;
                }

                let atom = &entry.atom;
                let fp = &atom.fingerprint;
                report.atoms_checked += 1;
                ready.push((fp.clone(), atom.size));

                if key != fp {
                    report
                        .violations
                        .push(format!("atom {fp} is stored under key {key}"));
                }
                if atom.size == 0 {
                    report.violations.push(format!("atom {fp} has size 0"));
                }
                let accounted = atom.linked_references() + entry.unclaimed;
                if atom.usage_count != accounted {
                    report.violations.push(format!(
                        "atom {fp} has usage_count {} but {} linked + {} unclaimed references",
                        atom.usage_count,
                        atom.linked_references(),
                        entry.unclaimed
                    ));
                }
                let mut owners = HashSet::new();
                for owner in &atom.owners {
                    if !owners.insert(&owner.file_id) {
                        report
                            .violations
                            .push(format!("atom {fp} lists owner {} twice", owner.file_id));
                    }
                    if owner.references == 0 {
                        report.violations.push(format!(
                            "atom {fp} lists owner {} with zero references",
                            owner.file_id
                        ));
                    }
                }

                if atom.usage_count == 0 {
                    report.orphans += 1;
                }
                if entry.is_visible() {
                    visible += 1;
                }
                if entry.is_visible() != self.index.contains(fp) {
                    report.violations.push(format!(
                        "index disagrees with atom {fp} (usage_count {})",
                        atom.usage_count
                    ));
                }
            }
        }

        if self.index.len() != visible {
            report.violations.push(format!(
                "index holds {} keys for {visible} visible atoms",
                self.index.len()
            ));
        }
        (report, ready)
    }

    /// Every ready atom with only its linked references counted. Atoms held
    /// solely by in-flight acquisitions come out as orphans, so their
    /// payloads stay reachable for a later `collect_garbage`. Used to
    /// persist the catalog.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Atom> {
        let mut atoms = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            for entry in shard.values() {
                if entry.state == EntryState::Ready {
                    let mut atom = entry.atom.clone();
                    atom.usage_count = atom.linked_references();
                    atoms.push(atom);
                }
            }
        }
        atoms.sort_by_key(|atom| atom.creation_seq);
        atoms
    }

    /// Load atoms produced by [`AtomStore::snapshot`] into an empty store
    pub fn restore(&self, atoms: Vec<Atom>) -> Result<()> {
        if self.shards.iter().any(|shard| {
            !shard
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
        }) {
            return Err(StoreError::invalid_input(
                "restore requires an empty store",
            ));
        }

        let mut seen = HashSet::new();
        for atom in &atoms {
            validate_restored(atom)?;
            if !seen.insert(&atom.fingerprint) {
                return Err(StoreError::invalid_input(format!(
                    "atom {} appears twice in the snapshot",
                    atom.fingerprint
                )));
            }
        }

        let next_seq = atoms
            .iter()
            .map(|atom| atom.creation_seq + 1)
            .max()
            .unwrap_or(0);
        let count = atoms.len();
        for atom in atoms {
            let fingerprint = atom.fingerprint.clone();
            let visible = atom.usage_count > 0;
            let mut shard = self.write_shard(&fingerprint);
            shard.insert(fingerprint.clone(), Entry::ready(atom, 0));
            if visible {
                self.index.insert(fingerprint);
            }
        }
        self.next_seq.fetch_max(next_seq, Ordering::Relaxed);

        log::debug!("Restored {count} atoms");
        Ok(())
    }
}

fn ready_entry<'a>(shard: &'a mut Shard, fingerprint: &Fingerprint) -> Result<&'a mut Entry> {
    shard
        .get_mut(fingerprint)
        .filter(|entry| entry.state == EntryState::Ready)
        .ok_or_else(|| StoreError::not_found(format!("atom {fingerprint}")))
}

fn normalize_prefix(prefix: &str) -> Result<String> {
    let prefix = prefix.trim().to_ascii_lowercase();
    if !is_hex_prefix(&prefix) {
        return Err(StoreError::invalid_input(format!(
            "search prefix must be hex: {prefix}"
        )));
    }
    Ok(prefix)
}

fn validate_restored(atom: &Atom) -> Result<()> {
    let fp = &atom.fingerprint;
    if atom.size == 0 {
        return Err(StoreError::invalid_input(format!("atom {fp} has size 0")));
    }
    if atom.usage_count != atom.linked_references() {
        return Err(StoreError::invalid_input(format!(
            "atom {fp} has usage_count {} but {} linked references",
            atom.usage_count,
            atom.linked_references()
        )));
    }
    let mut owners = HashSet::new();
    if atom
        .owners
        .iter()
        .any(|owner| owner.references == 0 || !owners.insert(&owner.file_id))
    {
        return Err(StoreError::invalid_input(format!(
            "atom {fp} has duplicate or empty owners"
        )));
    }
    Ok(())
}

/// Removes a pending entry if its creator fails or is cancelled before
/// the payload is written. Waiters wake when `created` drops, after the
/// entry is gone.
struct PendingGuard<'a> {
    store: &'a AtomStore,
    fingerprint: &'a Fingerprint,
    armed: bool,
    created: watch::Sender<bool>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut shard = self.store.write_shard(self.fingerprint);
        if shard
            .get(self.fingerprint)
            .is_some_and(|entry| entry.state == EntryState::Pending)
        {
            shard.remove(self.fingerprint);
            log::debug!("Rolled back pending atom {}", self.fingerprint);
        }
    }
}

/// Returns an evicting entry to the orphan state if its payload delete
/// fails or is cancelled
struct EvictionGuard<'a> {
    store: &'a AtomStore,
    fingerprint: Fingerprint,
    armed: bool,
    evicted: watch::Sender<bool>,
}

impl Drop for EvictionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut shard = self.store.write_shard(&self.fingerprint);
        if let Some(entry) = shard.get_mut(&self.fingerprint) {
            if entry.state == EntryState::Evicting {
                entry.state = EntryState::Ready;
                entry.settled = None;
            }
        }
    }
}

/// Removes a sweep placeholder once its delete finishes, fails or is
/// cancelled; waiters retry when `_swept` drops
struct SweepGuard<'a> {
    store: &'a AtomStore,
    fingerprint: Fingerprint,
    _swept: watch::Sender<bool>,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        let mut shard = self.store.write_shard(&self.fingerprint);
        if shard
            .get(&self.fingerprint)
            .is_some_and(|entry| entry.state == EntryState::Evicting)
        {
            shard.remove(&self.fingerprint);
        }
    }
}

/// Wait until an in-flight write or eviction settles.
///
/// `ConcurrencyConflict` means it was abandoned without completing.
async fn wait_settled(fingerprint: &Fingerprint, mut settled: watch::Receiver<bool>) -> Result<()> {
    if *settled.borrow_and_update() {
        return Ok(());
    }
    match settled.changed().await {
        Ok(()) => Ok(()),
        Err(_) if *settled.borrow() => Ok(()),
        Err(_) => Err(StoreError::ConcurrencyConflict(format!(
            "operation on atom {fingerprint} was abandoned"
        ))),
    }
}
