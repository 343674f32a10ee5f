//! Download flow
//!
//! [`fetch`] is what a request handler runs for one archive: acquire the
//! entry, download it if granted, otherwise wait for whoever is downloading
//! it, then record the request time. The grant holder always reports
//! completion, with size 0 when the archive could not be stored, so waiters
//! are never left blocked.
//!
//! This flow never deletes archive files. A stale or partial file left by a
//! failed transfer is recorded with size 0 and is cleaned up by the cleanup
//! pass or the non-archive purge.

use crate::entry::CachedEntry;
use crate::house::House;
use crate::store::FileStore;
use beatcache_common::{Error, Fingerprint, Result, Timestamp};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of asking the origin for an archive
pub enum Download {
    /// Archive bytes
    Available(Box<dyn Read + Send>),
    /// The origin does not have this archive
    Unavailable,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available(_) => f.write_str("Available"),
            Self::Unavailable => f.write_str("Unavailable"),
        }
    }
}

/// Source of archive bytes
pub trait Downloader: Send + Sync {
    fn download(&self, fingerprint: Fingerprint) -> Result<Download>;
}

impl<D: Downloader + ?Sized> Downloader for &D {
    fn download(&self, fingerprint: Fingerprint) -> Result<Download> {
        (**self).download(fingerprint)
    }
}

impl<D: Downloader + ?Sized> Downloader for Arc<D> {
    fn download(&self, fingerprint: Fingerprint) -> Result<Download> {
        (**self).download(fingerprint)
    }
}

/// Retries transient download failures with a fixed backoff
#[derive(Debug, Clone)]
pub struct Retry<D> {
    inner: D,
    attempts: u32,
    backoff: Duration,
}

impl<D: Downloader> Retry<D> {
    pub const DEFAULT_ATTEMPTS: u32 = 5;
    pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(3);

    pub fn new(inner: D) -> Self {
        Self {
            inner,
            attempts: Self::DEFAULT_ATTEMPTS,
            backoff: Self::DEFAULT_BACKOFF,
        }
    }

    /// Total attempts, including the first. At least one is always made.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: Downloader> Downloader for Retry<D> {
    fn download(&self, fingerprint: Fingerprint) -> Result<Download> {
        let mut attempt = 1;
        loop {
            match self.inner.download(fingerprint) {
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!(%fingerprint, attempt, error = %e, "download failed, retrying");
                    thread::sleep(self.backoff);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// [`Downloader`] serving archives from a local directory laid out like
/// [`crate::FsStore`]
#[derive(Debug, Clone)]
pub struct DirDownloader {
    root: PathBuf,
}

impl DirDownloader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Downloader for DirDownloader {
    fn download(&self, fingerprint: Fingerprint) -> Result<Download> {
        let path = self
            .root
            .join(format!("{fingerprint}.{}", crate::FsStore::EXTENSION));
        match File::open(&path) {
            Ok(file) => Ok(Download::Available(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Download::Unavailable),
            Err(e) => Err(Error::download(format!("{}: {e}", path.display()))),
        }
    }
}

/// Reports completion for a grant when dropped
struct Completion<'a> {
    entry: &'a CachedEntry,
    file_size: u64,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        self.entry.mark_download_complete(self.file_size);
    }
}

/// Serve one request for `fingerprint` at `source_version`.
///
/// On return the entry is settled: its archive is on disk, or its size is 0
/// when the origin did not have it. A download error is returned to the
/// caller after completion has been reported with size 0.
pub fn fetch(
    house: &House,
    downloader: &dyn Downloader,
    fingerprint: Fingerprint,
    source_version: Timestamp,
) -> Result<Arc<CachedEntry>> {
    let (entry, must_download) = house.acquire(fingerprint, source_version);

    if must_download {
        info!(%fingerprint, %source_version, "downloading archive");
        let mut completion = Completion {
            entry: &entry,
            file_size: 0,
        };
        completion.file_size = download_into(house.store().as_ref(), downloader, fingerprint)?;
    } else {
        entry.wait_until_downloaded();
    }

    entry.bump_last_requested(beatcache_common::now());
    Ok(entry)
}

fn download_into(
    store: &dyn FileStore,
    downloader: &dyn Downloader,
    fingerprint: Fingerprint,
) -> Result<u64> {
    let reader = match downloader.download(fingerprint)? {
        Download::Available(reader) => reader,
        Download::Unavailable => {
            info!(%fingerprint, "archive unavailable at origin");
            return Ok(0);
        }
    };

    let size = write_archive(store, fingerprint, reader)?;
    debug!(%fingerprint, size, "archive stored");
    Ok(size)
}

fn write_archive(
    store: &dyn FileStore,
    fingerprint: Fingerprint,
    mut reader: Box<dyn Read + Send>,
) -> io::Result<u64> {
    let mut writer = store.create(fingerprint)?;
    let size = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    Ok(size)
}
