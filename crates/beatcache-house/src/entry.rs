//! Cached archive entries
//!
//! A [`CachedEntry`] tracks one `(set id, variant)` archive. Besides the
//! bookkeeping fields it carries the primitive that lets any number of
//! requests wait on the single download in flight for that archive.
//!
//! Every download grant handed out by the registry increments a pending
//! counter; every completion decrements it. Waiters block until no grant is
//! outstanding, so a request arriving while a newer version is being fetched
//! always waits for the fresh bytes instead of reading the stale file.

use crate::codec::EntryRecord;
use crate::scheduler::CleanupTrigger;
use beatcache_common::{Fingerprint, Timestamp};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Mutable part of an entry, guarded by the entry lock
#[derive(Debug, Clone)]
struct EntryState {
    source_version: Timestamp,
    last_requested: Timestamp,
    /// Archive size; 0 means the last download produced nothing
    file_size: u64,
    is_downloaded: bool,
    /// Download grants not yet completed
    pending: u32,
}

/// One cached archive variant
pub struct CachedEntry {
    fingerprint: Fingerprint,
    state: Mutex<EntryState>,
    downloaded: Condvar,
    cleanup: CleanupTrigger,
}

/// Point-in-time view of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    pub fingerprint: Fingerprint,
    pub source_version: Timestamp,
    pub last_requested: Timestamp,
    pub file_size: u64,
    pub is_downloaded: bool,
    pub pending_downloads: u32,
}

impl CachedEntry {
    /// Entry seen for the first time; the creator holds the download grant
    pub(crate) fn pending(
        fingerprint: Fingerprint,
        source_version: Timestamp,
        requested_at: Timestamp,
        cleanup: CleanupTrigger,
    ) -> Self {
        Self {
            fingerprint,
            state: Mutex::new(EntryState {
                source_version,
                last_requested: requested_at,
                file_size: 0,
                is_downloaded: false,
                pending: 1,
            }),
            downloaded: Condvar::new(),
            cleanup,
        }
    }

    /// Entry restored from persisted state
    pub(crate) fn restored(record: &EntryRecord, cleanup: CleanupTrigger) -> Self {
        Self {
            fingerprint: record.fingerprint,
            state: Mutex::new(EntryState {
                source_version: record.source_version,
                last_requested: record.last_requested,
                file_size: record.file_size,
                is_downloaded: true,
                pending: 0,
            }),
            downloaded: Condvar::new(),
            cleanup,
        }
    }

    /// Identity of the archive
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Source version of the cached (or in-flight) archive
    pub fn source_version(&self) -> Timestamp {
        self.state.lock().source_version
    }

    /// When a client last asked for this archive
    pub fn last_requested(&self) -> Timestamp {
        self.state.lock().last_requested
    }

    /// Archive size in bytes. Only meaningful once downloaded; 0 means the
    /// archive could not be fetched.
    pub fn file_size(&self) -> u64 {
        self.state.lock().file_size
    }

    /// Whether a download has completed and none is outstanding
    pub fn is_downloaded(&self) -> bool {
        self.state.lock().is_downloaded
    }

    /// Whether a download grant is outstanding
    pub fn has_pending_download(&self) -> bool {
        self.state.lock().pending > 0
    }

    /// Consistent view of all fields
    pub fn snapshot(&self) -> EntrySnapshot {
        let state = self.state.lock();
        EntrySnapshot {
            fingerprint: self.fingerprint,
            source_version: state.source_version,
            last_requested: state.last_requested,
            file_size: state.file_size,
            is_downloaded: state.is_downloaded,
            pending_downloads: state.pending,
        }
    }

    /// Persistable record, if the entry is downloaded
    pub fn record(&self) -> Option<EntryRecord> {
        let state = self.state.lock();
        state.is_downloaded.then(|| EntryRecord {
            fingerprint: self.fingerprint,
            source_version: state.source_version,
            last_requested: state.last_requested,
            file_size: state.file_size,
        })
    }

    /// Block until no download of this archive is outstanding.
    ///
    /// There is no timeout: a grant holder that never reports completion
    /// blocks waiters forever. Use [`Self::wait_until_downloaded_timeout`]
    /// to bound the wait.
    pub fn wait_until_downloaded(&self) {
        let mut state = self.state.lock();
        while state.pending > 0 {
            self.downloaded.wait(&mut state);
        }
    }

    /// Like [`Self::wait_until_downloaded`], giving up after `timeout`.
    ///
    /// Returns false if a download was still outstanding when time ran out.
    pub fn wait_until_downloaded_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.pending > 0 {
            if self.downloaded.wait_until(&mut state, deadline).timed_out() {
                return state.pending == 0;
            }
        }
        true
    }

    /// Report that the download for one grant finished.
    ///
    /// `file_size` is the number of bytes stored, 0 when the archive was
    /// unavailable or the transfer failed. Wakes waiters once the last
    /// outstanding grant completes, and asks the registry for a cleanup pass.
    pub fn mark_download_complete(&self, file_size: u64) {
        {
            let mut state = self.state.lock();
            if state.pending == 0 {
                warn!(fingerprint = %self.fingerprint, "download completion reported without an outstanding grant");
            }
            state.pending = state.pending.saturating_sub(1);
            state.file_size = file_size;
            if state.pending == 0 {
                state.is_downloaded = true;
                self.downloaded.notify_all();
            }
        }
        debug!(fingerprint = %self.fingerprint, file_size, "download complete");
        self.cleanup.request();
    }

    /// Record a client request at `now`. Never moves the time backwards.
    pub fn bump_last_requested(&self, now: Timestamp) {
        let mut state = self.state.lock();
        if now > state.last_requested {
            state.last_requested = now;
        }
    }

    /// Apply a request carrying `source_version` to an existing entry.
    ///
    /// Returns true, and arms one more grant, when the source is newer than
    /// what is cached. The archive is then treated as not downloaded until
    /// the new transfer completes.
    pub(crate) fn refresh(&self, source_version: Timestamp) -> bool {
        let mut state = self.state.lock();
        if state.source_version >= source_version {
            return false;
        }
        state.source_version = source_version;
        state.is_downloaded = false;
        state.pending += 1;
        true
    }
}

impl std::fmt::Debug for CachedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CachedEntry")
            .field("fingerprint", &self.fingerprint)
            .field("source_version", &state.source_version)
            .field("last_requested", &state.last_requested)
            .field("file_size", &state.file_size)
            .field("is_downloaded", &state.is_downloaded)
            .field("pending", &state.pending)
            .finish()
    }
}
