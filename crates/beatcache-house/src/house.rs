//! Cache registry
//!
//! The [`House`] owns every [`CachedEntry`], decides which caller downloads
//! an archive, and runs the cleanup passes that keep the cache under its
//! disk budget. State is persisted as a side effect of cleanup: each pass
//! rewrites the state file with every downloaded entry.
//!
//! Locking has two tiers. The entry map sits behind a coarse `RwLock` held
//! only for lookups, inserts and removals; each entry guards its own fields.
//! The map lock is always taken before an entry lock, never the reverse.
//!
//! Archives dropped from the map are marked as being deleted until their
//! file is gone. `acquire` of such a fingerprint waits for the deletion, so
//! a fresh download is never removed by the pass that evicted the old one.

use crate::codec::{self, EntryRecord};
use crate::entry::{CachedEntry, EntrySnapshot};
use crate::eviction::{self, EvictionReason};
use crate::scheduler::{Cleaner, CleanupTrigger, cleanup_signal};
use crate::stats::HouseStats;
use crate::store::FileStore;
use beatcache_common::config::HouseConfig;
use beatcache_common::{Error, Fingerprint, Result, Timestamp};
use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::collections::hash_map::Entry;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Default disk budget: 10 GiB
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Result of one cleanup pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub reason: EvictionReason,
    /// Entries dropped from the registry
    pub removed: Vec<Fingerprint>,
    pub freed_bytes: u64,
    /// Downloaded bytes before the pass
    pub total_size: u64,
    /// Entries left in the registry
    pub remaining: usize,
    /// Set when no disk mutation happened
    pub dry_run: bool,
}

/// Registry of cached archives
pub struct House {
    entries: RwLock<HashMap<Fingerprint, Arc<CachedEntry>>>,
    max_size: AtomicU64,
    store: Arc<dyn FileStore>,
    state_path: PathBuf,
    trigger: CleanupTrigger,
    signal: Receiver<()>,
    /// Serializes passes that rewrite the state file
    pass_lock: Mutex<()>,
    /// When set, removals are recorded here instead of touching the disk
    dry_run: Mutex<Option<Vec<EntryRecord>>>,
    /// Fingerprints removed from the map whose archive is not deleted yet
    deleting: Mutex<HashSet<Fingerprint>>,
    deleted: Condvar,
    stats: HouseStats,
}

/// Deletion marks of one pass, cleared when dropped
pub(crate) struct PendingDeletes<'a> {
    house: &'a House,
    fingerprints: Vec<Fingerprint>,
}

impl PendingDeletes<'_> {
    pub(crate) fn fingerprints(&self) -> &[Fingerprint] {
        &self.fingerprints
    }
}

impl Drop for PendingDeletes<'_> {
    fn drop(&mut self) {
        if self.fingerprints.is_empty() {
            return;
        }
        let mut deleting = self.house.deleting.lock();
        for fingerprint in &self.fingerprints {
            deleting.remove(fingerprint);
        }
        self.house.deleted.notify_all();
    }
}

impl House {
    /// Create an empty registry persisting to `state_path`
    pub fn new(state_path: impl Into<PathBuf>, store: Arc<dyn FileStore>) -> Self {
        let (trigger, signal) = cleanup_signal();
        Self {
            entries: RwLock::new(HashMap::new()),
            max_size: AtomicU64::new(DEFAULT_MAX_SIZE),
            store,
            state_path: state_path.into(),
            trigger,
            signal,
            pass_lock: Mutex::new(()),
            dry_run: Mutex::new(None),
            deleting: Mutex::new(HashSet::new()),
            deleted: Condvar::new(),
            stats: HouseStats::default(),
        }
    }

    /// Create a registry from configuration
    pub fn from_config(config: &HouseConfig, store: Arc<dyn FileStore>) -> Self {
        let house = Self::new(config.state_file.clone(), store);
        house.set_max_size(config.max_size_bytes());
        house
    }

    /// Look up `fingerprint`, deciding whether the caller must download it.
    ///
    /// Returns `(entry, true)` when the caller holds the download grant and
    /// must call [`CachedEntry::mark_download_complete`] exactly once. Any
    /// other caller gets `false` and must call
    /// [`CachedEntry::wait_until_downloaded`] before reading the archive.
    ///
    /// If a cleanup pass is still deleting the archive of `fingerprint`,
    /// this blocks until the file is gone.
    pub fn acquire(
        &self,
        fingerprint: Fingerprint,
        source_version: Timestamp,
    ) -> (Arc<CachedEntry>, bool) {
        self.stats.acquires.fetch_add(1, Ordering::Relaxed);

        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&fingerprint) {
                return self.reuse(entry, source_version);
            }
        }

        loop {
            let mut entries = self.entries.write();
            if self.deleting.lock().contains(&fingerprint) {
                drop(entries);
                self.wait_for_deletion(fingerprint);
                continue;
            }
            return self.insert_or_reuse(&mut entries, fingerprint, source_version);
        }
    }

    fn insert_or_reuse(
        &self,
        entries: &mut HashMap<Fingerprint, Arc<CachedEntry>>,
        fingerprint: Fingerprint,
        source_version: Timestamp,
    ) -> (Arc<CachedEntry>, bool) {
        match entries.entry(fingerprint) {
            Entry::Occupied(slot) => self.reuse(slot.get(), source_version),
            Entry::Vacant(slot) => {
                let entry = Arc::new(CachedEntry::pending(
                    fingerprint,
                    source_version,
                    beatcache_common::now(),
                    self.trigger.clone(),
                ));
                slot.insert(Arc::clone(&entry));
                self.stats.grants.fetch_add(1, Ordering::Relaxed);
                debug!(%fingerprint, %source_version, "new entry, download granted");
                (entry, true)
            }
        }
    }

    fn wait_for_deletion(&self, fingerprint: Fingerprint) {
        debug!(%fingerprint, "waiting for archive deletion");
        let mut deleting = self.deleting.lock();
        while deleting.contains(&fingerprint) {
            self.deleted.wait(&mut deleting);
        }
    }

    /// Mark `fingerprints` as being deleted; must be called with the map
    /// write lock held, right after removing them from the map.
    pub(crate) fn begin_deletes(&self, fingerprints: Vec<Fingerprint>) -> PendingDeletes<'_> {
        self.deleting.lock().extend(fingerprints.iter().copied());
        PendingDeletes {
            house: self,
            fingerprints,
        }
    }

    /// Existing entry; must be called with the map lock held
    fn reuse(&self, entry: &Arc<CachedEntry>, source_version: Timestamp) -> (Arc<CachedEntry>, bool) {
        let must_download = entry.refresh(source_version);
        if must_download {
            self.stats.grants.fetch_add(1, Ordering::Relaxed);
            self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %entry.fingerprint(), %source_version, "newer source version, download granted");
        }
        (Arc::clone(entry), must_download)
    }

    /// Look up an entry without creating it
    pub fn get(&self, fingerprint: Fingerprint) -> Option<Arc<CachedEntry>> {
        self.entries.read().get(&fingerprint).cloned()
    }

    /// Number of entries, pending ones included
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshots of all entries, ordered by fingerprint
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let mut snapshots: Vec<EntrySnapshot> =
            self.entries.read().values().map(|e| e.snapshot()).collect();
        snapshots.sort_by_key(|s| s.fingerprint);
        snapshots
    }

    /// Bytes held by downloaded archives
    pub fn total_size(&self) -> u64 {
        self.entries
            .read()
            .values()
            .filter_map(|e| e.record())
            .map(|r| r.file_size)
            .sum()
    }

    /// Disk budget in bytes
    pub fn max_size(&self) -> u64 {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Change the disk budget. Takes effect on the next cleanup pass.
    pub fn set_max_size(&self, bytes: u64) {
        self.max_size.store(bytes, Ordering::Relaxed);
        info!(max_size = bytes, "disk budget updated");
    }

    /// Backing archive store
    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// Open the archive of `fingerprint` for reading
    pub fn open(&self, fingerprint: Fingerprint) -> Result<Box<dyn Read + Send>> {
        self.store.open(fingerprint).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::ArchiveNotFound(fingerprint.to_string()),
            _ => Error::DiskIo(e),
        })
    }

    /// Location of the persisted state
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn stats(&self) -> &HouseStats {
        &self.stats
    }

    /// Handle that queues a cleanup pass
    pub fn cleanup_trigger(&self) -> CleanupTrigger {
        self.trigger.clone()
    }

    pub(crate) fn cleanup_receiver(&self) -> Receiver<()> {
        self.signal.clone()
    }

    /// Queue a cleanup pass unless one is already queued
    pub fn schedule_cleanup(&self) -> bool {
        self.trigger.request()
    }

    /// Start the background worker that serves cleanup requests
    pub fn start_cleaner(self: &Arc<Self>) -> Result<Cleaner> {
        Cleaner::start(self)
    }

    /// Switch to dry-run mode: later passes record their removals instead
    /// of deleting files or rewriting the state file.
    ///
    /// The log accumulates: [`Self::dry_run_removals`] returns the removals
    /// of every pass since dry-run mode was enabled, oldest first.
    pub fn enable_dry_run(&self) {
        let mut dry_run = self.dry_run.lock();
        if dry_run.is_none() {
            *dry_run = Some(Vec::new());
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.lock().is_some()
    }

    /// Records removed since dry-run mode was enabled
    pub fn dry_run_removals(&self) -> Option<Vec<EntryRecord>> {
        self.dry_run.lock().clone()
    }

    /// Replace the registry contents with the persisted state.
    ///
    /// A missing state file leaves the registry empty. Any other read or
    /// decode failure is returned and should abort startup.
    pub fn load_state(&self) -> Result<usize> {
        let file = match File::open(&self.state_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.state_path.display(), "no persisted state, starting empty");
                self.entries.write().clear();
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let records = codec::read_records(BufReader::new(file))?;
        let restored: HashMap<_, _> = records
            .iter()
            .map(|r| {
                let entry = CachedEntry::restored(r, self.trigger.clone());
                (r.fingerprint, Arc::new(entry))
            })
            .collect();
        let count = restored.len();
        *self.entries.write() = restored;

        info!(path = %self.state_path.display(), entries = count, "persisted state loaded");
        Ok(count)
    }

    /// Write every downloaded entry to the state file
    pub fn persist_state(&self) -> Result<()> {
        let _pass = self.pass_lock.lock();
        let records = Self::records(&self.entries.read());
        self.persist(&records)
    }

    /// Run one cleanup pass now, on the calling thread.
    ///
    /// Passes are serialized; a call made while another pass is running
    /// waits for it.
    pub fn run_cleanup(&self) -> Result<CleanupReport> {
        let _pass = self.pass_lock.lock();
        match self.cleanup_pass() {
            Ok(report) => {
                self.stats.cleanup_runs.fetch_add(1, Ordering::Relaxed);
                Ok(report)
            }
            Err(e) => {
                self.stats.cleanup_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn cleanup_pass(&self) -> Result<CleanupReport> {
        let max_size = self.max_size();
        let (plan, records, remaining, pending) = {
            let mut entries = self.entries.write();
            let plan = eviction::plan(entries.values(), max_size);
            for victim in &plan.victims {
                entries.remove(&victim.fingerprint());
            }
            let pending = self.begin_deletes(plan.victims.iter().map(|e| e.fingerprint()).collect());
            (plan, Self::records(&entries), entries.len(), pending)
        };

        let removed: Vec<EntryRecord> = plan.victims.iter().filter_map(|e| e.record()).collect();
        let freed_bytes = plan.victim_bytes();
        self.stats
            .evicted_entries
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        self.stats
            .evicted_bytes
            .fetch_add(freed_bytes, Ordering::Relaxed);

        let mut report = CleanupReport {
            reason: plan.reason,
            removed: removed.iter().map(|r| r.fingerprint).collect(),
            freed_bytes,
            total_size: plan.total_size,
            remaining,
            dry_run: false,
        };

        match plan.reason {
            EvictionReason::None => debug!(total_size = plan.total_size, max_size, "cleanup: within budget"),
            EvictionReason::Truncated => warn!(count = removed.len(), "cleanup: removing truncated archives"),
            EvictionReason::OverBudget => info!(
                count = removed.len(),
                freed_bytes,
                total_size = plan.total_size,
                max_size,
                "cleanup: evicting least recently requested archives"
            ),
        }

        if self.record_dry_run(&removed) {
            report.dry_run = true;
            return Ok(report);
        }

        self.persist(&records)?;
        self.delete_archives(&pending);
        Ok(report)
    }

    /// Append to the dry-run log. Returns false when not in dry-run mode.
    pub(crate) fn record_dry_run(&self, removed: &[EntryRecord]) -> bool {
        match self.dry_run.lock().as_mut() {
            Some(log) => {
                log.extend_from_slice(removed);
                true
            }
            None => false,
        }
    }

    /// Take the lock serializing state file rewrites
    pub(crate) fn lock_pass(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.pass_lock.lock()
    }

    /// Remove entries whose current value is still `expected`.
    ///
    /// Returns the records of the removed entries, the records left to
    /// persist and the deletion marks of the removed entries.
    pub(crate) fn remove_if_unchanged(
        &self,
        expected: &[Arc<CachedEntry>],
    ) -> (Vec<EntryRecord>, Vec<EntryRecord>, PendingDeletes<'_>) {
        let mut entries = self.entries.write();
        let mut removed = Vec::new();
        for victim in expected {
            let fp = victim.fingerprint();
            let unchanged = entries
                .get(&fp)
                .is_some_and(|current| Arc::ptr_eq(current, victim) && !current.has_pending_download());
            if !unchanged {
                continue;
            }
            if let Some(entry) = entries.remove(&fp) {
                removed.extend(entry.record());
            }
        }
        let pending = self.begin_deletes(removed.iter().map(|r| r.fingerprint).collect());
        (removed, Self::records(&entries), pending)
    }

    /// Entries with a completed download
    pub(crate) fn downloaded(&self) -> Vec<Arc<CachedEntry>> {
        self.entries
            .read()
            .values()
            .filter(|e| e.is_downloaded())
            .cloned()
            .collect()
    }

    fn records(entries: &HashMap<Fingerprint, Arc<CachedEntry>>) -> Vec<EntryRecord> {
        let mut records: Vec<EntryRecord> = entries.values().filter_map(|e| e.record()).collect();
        records.sort_by_key(|r| r.fingerprint);
        records
    }

    /// Atomically replace the state file with `records`
    pub(crate) fn persist(&self, records: &[EntryRecord]) -> Result<()> {
        let dir = match self.state_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            codec::write_records(&mut writer, records)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.state_path).map_err(|e| {
            Error::storage(format!("replacing {}: {}", self.state_path.display(), e.error))
        })?;

        debug!(path = %self.state_path.display(), entries = records.len(), "state persisted");
        Ok(())
    }

    /// Delete the archives marked in `pending`. Missing files are ignored;
    /// other failures are logged and do not stop the loop.
    pub(crate) fn delete_archives(&self, pending: &PendingDeletes<'_>) {
        for &fingerprint in pending.fingerprints() {
            match self.store.remove(fingerprint) {
                Ok(()) => debug!(%fingerprint, "archive deleted"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => error!(%fingerprint, error = %e, "failed to delete archive"),
            }
        }
    }
}

impl std::fmt::Debug for House {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("House")
            .field("entries", &self.len())
            .field("max_size", &self.max_size())
            .field("state_path", &self.state_path)
            .field("dry_run", &self.is_dry_run())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsStore;
    use chrono::{TimeZone, Utc};
    use crossbeam_channel::{Sender, bounded};
    use std::sync::Barrier;
    use std::thread;
    use tempfile::{TempDir, tempdir};

    fn ts(day: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2017, 4, day, 15, 5, 3)
            .unwrap()
            .fixed_offset()
    }

    fn test_house() -> (TempDir, House) {
        let dir = tempdir().unwrap();
        let house = House::new(
            dir.path().join("house.db"),
            Arc::new(FsStore::new(dir.path().join("data"))),
        );
        (dir, house)
    }

    /// Acquire, complete and stamp an entry
    fn cached(house: &House, id: u64, size: u64, requested_day: u32) -> Arc<CachedEntry> {
        let (entry, must_download) = house.acquire(Fingerprint::full(id), ts(1));
        assert!(must_download);
        entry.mark_download_complete(size);
        // Pin last_requested to a known day
        let record = EntryRecord {
            fingerprint: entry.fingerprint(),
            source_version: ts(1),
            last_requested: ts(requested_day),
            file_size: size,
        };
        let pinned = Arc::new(CachedEntry::restored(&record, house.cleanup_trigger()));
        house.entries.write().insert(entry.fingerprint(), Arc::clone(&pinned));
        pinned
    }

    fn write_archive(house: &House, id: u64, bytes: &[u8]) {
        let mut w = house.store().create(Fingerprint::full(id)).unwrap();
        w.write_all(bytes).unwrap();
    }

    fn removed_ids(house: &House) -> Vec<u64> {
        let mut ids: Vec<u64> = house
            .dry_run_removals()
            .unwrap()
            .iter()
            .map(|r| r.fingerprint.id)
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_acquire_new_entry_grants_download() {
        let (_dir, house) = test_house();
        let (entry, must_download) = house.acquire(Fingerprint::full(1), ts(1));
        assert!(must_download);
        assert!(!entry.is_downloaded());
        assert_eq!(house.len(), 1);

        let (same, must_download) = house.acquire(Fingerprint::full(1), ts(1));
        assert!(!must_download);
        assert!(Arc::ptr_eq(&entry, &same));
        assert_eq!(house.stats().snapshot().grants, 1);
    }

    #[test]
    fn test_variants_are_distinct() {
        let (_dir, house) = test_house();
        let (_, a) = house.acquire(Fingerprint::full(7), ts(1));
        let (_, b) = house.acquire(Fingerprint::stripped(7), ts(1));
        assert!(a && b);
        assert_eq!(house.len(), 2);
    }

    #[test]
    fn test_freshness_bump() {
        let (_dir, house) = test_house();
        let (entry, _) = house.acquire(Fingerprint::full(1), ts(5));
        entry.mark_download_complete(20000);

        let (_, must_download) = house.acquire(Fingerprint::full(1), ts(4));
        assert!(!must_download);
        let (_, must_download) = house.acquire(Fingerprint::full(1), ts(5));
        assert!(!must_download);
        assert_eq!(entry.source_version(), ts(5));

        let (_, must_download) = house.acquire(Fingerprint::full(1), ts(6));
        assert!(must_download);
        assert_eq!(entry.source_version(), ts(6));
        assert!(!entry.is_downloaded());

        let snap = house.stats().snapshot();
        assert_eq!(snap.acquires, 4);
        assert_eq!(snap.grants, 2);
        assert_eq!(snap.refreshes, 1);
    }

    #[test]
    fn test_concurrent_acquire_single_grant() {
        let (_dir, house) = test_house();
        let house = Arc::new(house);
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let house = Arc::clone(&house);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    house.acquire(Fingerprint::stripped(42), ts(1)).1
                })
            })
            .collect();

        let grants = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(grants, 1);
        assert_eq!(house.len(), 1);
    }

    #[test]
    fn test_concurrent_acquire_unique_fingerprints() {
        let (_dir, house) = test_house();
        let house = Arc::new(house);
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let house = Arc::clone(&house);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..50u64 {
                        let fp = Fingerprint::new(i % 10, (i + t as u64) % 2 == 0);
                        let (entry, must_download) = house.acquire(fp, ts(1));
                        if must_download {
                            entry.mark_download_complete(20000);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let fingerprints: Vec<_> = house.entries().iter().map(|s| s.fingerprint).collect();
        let unique: HashSet<_> = fingerprints.iter().collect();
        assert_eq!(fingerprints.len(), unique.len());
        assert_eq!(fingerprints.len(), 20);
    }

    #[test]
    fn test_waiter_sees_fresh_download() {
        let (_dir, house) = test_house();
        let house = Arc::new(house);
        let (entry, _) = house.acquire(Fingerprint::full(3), ts(1));
        entry.mark_download_complete(15000);

        let (entry, must_download) = house.acquire(Fingerprint::full(3), ts(2));
        assert!(must_download);

        let waiter = {
            let house = Arc::clone(&house);
            thread::spawn(move || {
                let (entry, must_download) = house.acquire(Fingerprint::full(3), ts(2));
                assert!(!must_download);
                entry.wait_until_downloaded();
                entry.file_size()
            })
        };

        thread::sleep(std::time::Duration::from_millis(20));
        entry.mark_download_complete(25000);
        assert_eq!(waiter.join().unwrap(), 25000);
    }

    #[test]
    fn test_cleanup_evicts_oldest_requested() {
        let (_dir, house) = test_house();
        house.enable_dry_run();
        cached(&house, 1, 15000, 10);
        cached(&house, 2, 15000, 5);
        cached(&house, 3, 15000, 20);

        house.set_max_size(50000);
        let report = house.run_cleanup().unwrap();
        assert_eq!(report.reason, EvictionReason::None);
        assert!(report.removed.is_empty());

        house.set_max_size(40000);
        let report = house.run_cleanup().unwrap();
        assert_eq!(report.reason, EvictionReason::OverBudget);
        assert_eq!(report.removed, vec![Fingerprint::full(2)]);
        assert_eq!(report.freed_bytes, 15000);
        assert!(report.dry_run);
        assert_eq!(removed_ids(&house), vec![2]);
        assert_eq!(house.len(), 2);
    }

    #[test]
    fn test_cleanup_small_budget_skips_zero_size() {
        let (_dir, house) = test_house();
        house.enable_dry_run();
        cached(&house, 1, 15000, 10);
        cached(&house, 2, 15000, 5);
        cached(&house, 3, 15000, 20);
        cached(&house, 4, 0, 1);
        cached(&house, 5, 0, 2);

        house.set_max_size(5);
        house.run_cleanup().unwrap();
        assert_eq!(removed_ids(&house), vec![1, 2, 3]);

        let left: Vec<u64> = house.entries().iter().map(|s| s.fingerprint.id).collect();
        assert_eq!(left, vec![4, 5]);
    }

    #[test]
    fn test_cleanup_truncated_first() {
        let (_dir, house) = test_house();
        house.enable_dry_run();
        cached(&house, 1, 10, 20);
        cached(&house, 2, 50000, 1);
        cached(&house, 3, 0, 2);

        house.set_max_size(5);
        let report = house.run_cleanup().unwrap();
        assert_eq!(report.reason, EvictionReason::Truncated);
        assert_eq!(removed_ids(&house), vec![1]);
        assert_eq!(house.len(), 2);

        // Next pass falls through to the size budget
        let report = house.run_cleanup().unwrap();
        assert_eq!(report.reason, EvictionReason::OverBudget);
        assert_eq!(removed_ids(&house), vec![1, 2]);
    }

    #[test]
    fn test_dry_run_leaves_disk_untouched() {
        let (dir, house) = test_house();
        cached(&house, 1, 15000, 1);
        cached(&house, 2, 15000, 2);
        write_archive(&house, 1, b"PK\x03\x04old");
        write_archive(&house, 2, b"PK\x03\x04new");

        house.enable_dry_run();
        house.set_max_size(20000);
        let report = house.run_cleanup().unwrap();
        assert!(report.dry_run);
        assert_eq!(removed_ids(&house), vec![1]);
        assert_eq!(house.len(), 1);

        assert!(house.store().resolve(Fingerprint::full(1)).exists());
        assert!(house.store().resolve(Fingerprint::full(2)).exists());
        assert!(!dir.path().join("house.db").exists());
    }

    /// Store whose `remove` announces itself and waits to be released
    struct GatedStore {
        inner: FsStore,
        started: Sender<Fingerprint>,
        release: Receiver<()>,
    }

    impl FileStore for GatedStore {
        fn resolve(&self, fp: Fingerprint) -> PathBuf {
            self.inner.resolve(fp)
        }

        fn create(&self, fp: Fingerprint) -> io::Result<Box<dyn Write + Send>> {
            self.inner.create(fp)
        }

        fn open(&self, fp: Fingerprint) -> io::Result<Box<dyn Read + Send>> {
            self.inner.open(fp)
        }

        fn remove(&self, fp: Fingerprint) -> io::Result<()> {
            let _ = self.started.send(fp);
            let _ = self.release.recv();
            self.inner.remove(fp)
        }
    }

    /// Store refusing to delete one archive
    struct StubbornStore {
        inner: FsStore,
        refuse: Fingerprint,
    }

    impl FileStore for StubbornStore {
        fn resolve(&self, fp: Fingerprint) -> PathBuf {
            self.inner.resolve(fp)
        }

        fn create(&self, fp: Fingerprint) -> io::Result<Box<dyn Write + Send>> {
            self.inner.create(fp)
        }

        fn open(&self, fp: Fingerprint) -> io::Result<Box<dyn Read + Send>> {
            self.inner.open(fp)
        }

        fn remove(&self, fp: Fingerprint) -> io::Result<()> {
            if fp == self.refuse {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
            }
            self.inner.remove(fp)
        }
    }

    #[test]
    fn test_redownload_waits_for_eviction() {
        let dir = tempdir().unwrap();
        let (started_tx, started_rx) = bounded(4);
        let (release_tx, release_rx) = bounded(4);
        let house = Arc::new(House::new(
            dir.path().join("house.db"),
            Arc::new(GatedStore {
                inner: FsStore::new(dir.path().join("data")),
                started: started_tx,
                release: release_rx,
            }),
        ));
        let fp = Fingerprint::full(1);
        cached(&house, 1, 15000, 1);
        write_archive(&house, 1, &[0x50; 15000]);
        house.set_max_size(10000);

        let cleaner = {
            let house = Arc::clone(&house);
            thread::spawn(move || house.run_cleanup().unwrap())
        };
        assert_eq!(started_rx.recv().unwrap(), fp);

        // A new request for the evicted archive arrives mid-deletion
        let downloader = {
            let house = Arc::clone(&house);
            thread::spawn(move || {
                let (entry, must_download) = house.acquire(fp, ts(2));
                assert!(must_download);
                let mut w = house.store().create(fp).unwrap();
                w.write_all(&[0x4b; 20000]).unwrap();
                drop(w);
                entry.mark_download_complete(20000);
            })
        };
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!downloader.is_finished());

        release_tx.send(()).unwrap();
        let report = cleaner.join().unwrap();
        assert_eq!(report.removed, vec![fp]);
        downloader.join().unwrap();

        let entry = house.get(fp).unwrap();
        assert!(entry.is_downloaded());
        assert_eq!(entry.file_size(), 20000);
        assert_eq!(
            fs::metadata(house.store().resolve(fp)).unwrap().len(),
            20000
        );
    }

    #[test]
    fn test_delete_failure_does_not_stop_pass() {
        let dir = tempdir().unwrap();
        let house = House::new(
            dir.path().join("house.db"),
            Arc::new(StubbornStore {
                inner: FsStore::new(dir.path().join("data")),
                refuse: Fingerprint::full(1),
            }),
        );
        cached(&house, 1, 15000, 1);
        cached(&house, 2, 15000, 2);
        cached(&house, 3, 15000, 3);
        write_archive(&house, 1, b"PK\x03\x04one");
        write_archive(&house, 2, b"PK\x03\x04two");
        write_archive(&house, 3, b"PK\x03\x04three");

        house.set_max_size(20000);
        let report = house.run_cleanup().unwrap();
        assert_eq!(report.removed, vec![Fingerprint::full(1), Fingerprint::full(2)]);

        assert!(house.store().resolve(Fingerprint::full(1)).exists());
        assert!(!house.store().resolve(Fingerprint::full(2)).exists());
        assert!(house.store().resolve(Fingerprint::full(3)).exists());
        assert_eq!(house.stats().snapshot().cleanup_failures, 0);

        let restored = House::new(dir.path().join("house.db"), Arc::clone(house.store()));
        assert_eq!(restored.load_state().unwrap(), 1);
        assert!(restored.get(Fingerprint::full(3)).is_some());
    }

    #[test]
    fn test_cleanup_deletes_files_and_persists() {
        let (dir, house) = test_house();
        cached(&house, 1, 15000, 1);
        cached(&house, 2, 15000, 2);
        cached(&house, 3, 15000, 3);
        write_archive(&house, 1, b"PK\x03\x04one");
        write_archive(&house, 2, b"PK\x03\x04two");
        // 3 has no file on disk; deletion of a missing file is benign

        house.set_max_size(20000);
        let report = house.run_cleanup().unwrap();
        assert_eq!(report.removed.len(), 2);
        assert!(!house.store().resolve(Fingerprint::full(1)).exists());
        assert!(!house.store().resolve(Fingerprint::full(2)).exists());
        assert_eq!(house.len(), 1);

        let restored = House::new(
            dir.path().join("house.db"),
            Arc::new(FsStore::new(dir.path().join("data"))),
        );
        assert_eq!(restored.load_state().unwrap(), 1);
        let snap = &restored.entries()[0];
        assert_eq!(snap.fingerprint, Fingerprint::full(3));
        assert_eq!(snap.last_requested, ts(3));
        assert!(snap.is_downloaded);

        let stats = house.stats().snapshot();
        assert_eq!(stats.cleanup_runs, 1);
        assert_eq!(stats.evicted_entries, 2);
        assert_eq!(stats.evicted_bytes, 30000);
    }

    #[test]
    fn test_pending_entries_not_persisted() {
        let (dir, house) = test_house();
        cached(&house, 1, 20000, 1);
        let (_pending, must_download) = house.acquire(Fingerprint::full(2), ts(1));
        assert!(must_download);

        house.persist_state().unwrap();
        let restored = House::new(dir.path().join("house.db"), Arc::clone(house.store()));
        assert_eq!(restored.load_state().unwrap(), 1);
        assert!(restored.get(Fingerprint::full(2)).is_none());
    }

    #[test]
    fn test_load_state_missing_file() {
        let (_dir, house) = test_house();
        assert_eq!(house.load_state().unwrap(), 0);
        assert!(house.is_empty());
    }

    #[test]
    fn test_load_state_bad_magic() {
        let (dir, house) = test_house();
        fs::write(dir.path().join("house.db"), b"NOTCGBIN\x2f").unwrap();
        assert!(matches!(
            house.load_state(),
            Err(Error::UnknownStateVersion { .. })
        ));
    }

    #[test]
    fn test_load_state_truncated_header() {
        let (dir, house) = test_house();
        fs::write(dir.path().join("house.db"), b"CGB").unwrap();
        assert!(house.load_state().is_err());
    }

    #[test]
    fn test_restored_entry_needs_no_download() {
        let (dir, house) = test_house();
        cached(&house, 9, 30000, 3);
        house.persist_state().unwrap();

        let restored = House::new(dir.path().join("house.db"), Arc::clone(house.store()));
        restored.load_state().unwrap();
        let (entry, must_download) = restored.acquire(Fingerprint::full(9), ts(1));
        assert!(!must_download);
        assert!(entry.is_downloaded());
        assert_eq!(entry.file_size(), 30000);

        let (_, must_download) = restored.acquire(Fingerprint::full(9), ts(2));
        assert!(must_download);
    }

    #[test]
    fn test_open_missing_archive() {
        let (_dir, house) = test_house();
        let err = house.open(Fingerprint::stripped(5)).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_from_config() {
        let dir = tempdir().unwrap();
        let config = HouseConfig {
            max_disk_gb: 0.5,
            state_file: dir.path().join("state.db"),
        };
        let house = House::from_config(&config, Arc::new(FsStore::new(dir.path())));
        assert_eq!(house.max_size(), 512 * 1024 * 1024);
        assert_eq!(house.state_path(), dir.path().join("state.db"));
    }
}
