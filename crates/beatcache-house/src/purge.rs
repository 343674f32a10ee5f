//! Non-archive purge
//!
//! One-shot maintenance that drops entries whose backing file is missing or
//! is not a ZIP archive, then runs a regular cleanup pass.

use crate::entry::CachedEntry;
use crate::house::{CleanupReport, House};
use beatcache_common::Result;
use serde::Serialize;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// ZIP local file header signature
pub const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Outcome of [`House::purge_non_archives`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Downloaded entries inspected
    pub checked: usize,
    /// Entries dropped because their file was missing or not an archive
    pub removed: usize,
    /// Entries kept because their file could not be read
    pub unreadable: usize,
    /// The cleanup pass run afterwards
    pub cleanup: CleanupReport,
}

enum Verdict {
    Archive,
    NotArchive,
    Missing,
    Unreadable(io::Error),
}

impl House {
    /// Drop every downloaded entry whose file is missing or is not a ZIP
    /// archive, persist the state and run one cleanup pass.
    ///
    /// Entries with a download in flight are skipped. Entries whose file
    /// exists but cannot be read are kept.
    pub fn purge_non_archives(&self) -> Result<PurgeReport> {
        let candidates = self.downloaded();
        info!(entries = candidates.len(), "checking cached archives");

        let mut bad = Vec::new();
        let mut unreadable = 0;
        for entry in &candidates {
            match self.inspect(entry) {
                Verdict::Archive => {}
                Verdict::NotArchive | Verdict::Missing => bad.push(Arc::clone(entry)),
                Verdict::Unreadable(e) => {
                    unreadable += 1;
                    warn!(fingerprint = %entry.fingerprint(), error = %e, "cannot read archive, keeping entry");
                }
            }
        }

        let removed = {
            let _pass = self.lock_pass();
            let (removed, remaining, pending) = self.remove_if_unchanged(&bad);
            for record in &removed {
                info!(fingerprint = %record.fingerprint, "dropping non-archive entry");
            }
            self.stats()
                .purged_entries
                .fetch_add(removed.len() as u64, Ordering::Relaxed);

            if !self.record_dry_run(&removed) {
                self.persist(&remaining)?;
                self.delete_archives(&pending);
            }
            removed.len()
        };
        info!(checked = candidates.len(), removed, "non-archive purge done");

        let cleanup = self.run_cleanup()?;
        Ok(PurgeReport {
            checked: candidates.len(),
            removed,
            unreadable,
            cleanup,
        })
    }

    fn inspect(&self, entry: &CachedEntry) -> Verdict {
        let mut file = match self.store().open(entry.fingerprint()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Verdict::Missing,
            Err(e) => return Verdict::Unreadable(e),
        };

        let mut header = [0u8; ZIP_MAGIC.len()];
        match file.read_exact(&mut header) {
            Ok(()) if header == ZIP_MAGIC => Verdict::Archive,
            Ok(()) => Verdict::NotArchive,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Verdict::NotArchive,
            Err(e) => Verdict::Unreadable(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsStore;
    use beatcache_common::Fingerprint;
    use std::io::Write;
    use tempfile::{TempDir, tempdir};

    fn test_house() -> (TempDir, House) {
        let dir = tempdir().unwrap();
        let house = House::new(
            dir.path().join("house.db"),
            Arc::new(FsStore::new(dir.path().join("data"))),
        );
        (dir, house)
    }

    fn cache(house: &House, id: u64, contents: Option<&[u8]>) {
        let fp = Fingerprint::full(id);
        let (entry, must_download) = house.acquire(fp, beatcache_common::now());
        assert!(must_download);
        if let Some(bytes) = contents {
            let mut w = house.store().create(fp).unwrap();
            w.write_all(bytes).unwrap();
        }
        entry.mark_download_complete(20000);
    }

    #[test]
    fn test_purge_removes_non_archives() {
        let (dir, house) = test_house();
        cache(&house, 1, Some(b"PK\x03\x04rest of archive"));
        cache(&house, 2, Some(b"<html>not found</html>"));
        cache(&house, 3, Some(b"PK"));
        cache(&house, 4, None);

        let report = house.purge_non_archives().unwrap();
        assert_eq!(report.checked, 4);
        assert_eq!(report.removed, 3);
        assert_eq!(report.unreadable, 0);

        let left: Vec<u64> = house.entries().iter().map(|s| s.fingerprint.id).collect();
        assert_eq!(left, vec![1]);
        assert!(house.store().resolve(Fingerprint::full(1)).exists());
        assert!(!house.store().resolve(Fingerprint::full(2)).exists());
        assert!(!house.store().resolve(Fingerprint::full(3)).exists());
        assert_eq!(house.stats().snapshot().purged_entries, 3);

        let restored = House::new(dir.path().join("house.db"), Arc::clone(house.store()));
        assert_eq!(restored.load_state().unwrap(), 1);
    }

    #[test]
    fn test_purge_skips_pending_downloads() {
        let (_dir, house) = test_house();
        let (_entry, must_download) = house.acquire(Fingerprint::full(5), beatcache_common::now());
        assert!(must_download);

        let report = house.purge_non_archives().unwrap();
        assert_eq!(report.checked, 0);
        assert_eq!(house.len(), 1);
    }

    #[test]
    fn test_purge_dry_run() {
        let (dir, house) = test_house();
        cache(&house, 1, Some(b"garbage!"));
        house.enable_dry_run();

        let report = house.purge_non_archives().unwrap();
        assert_eq!(report.removed, 1);
        assert!(report.cleanup.dry_run);
        assert!(house.is_empty());
        assert!(house.store().resolve(Fingerprint::full(1)).exists());
        assert!(!dir.path().join("house.db").exists());
        assert_eq!(house.dry_run_removals().unwrap().len(), 1);
    }
}
