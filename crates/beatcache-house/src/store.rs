//! Archive file storage
//!
//! The registry never touches archive files directly; it goes through a
//! [`FileStore`], so the backing store can be swapped out.

use beatcache_common::Fingerprint;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Storage for the archive bytes of cached entries
pub trait FileStore: Send + Sync {
    /// Deterministic location of the archive for `fp`
    fn resolve(&self, fp: Fingerprint) -> PathBuf;

    /// Create (or truncate) the archive for `fp` for writing
    fn create(&self, fp: Fingerprint) -> io::Result<Box<dyn Write + Send>>;

    /// Open the archive for `fp` for reading
    fn open(&self, fp: Fingerprint) -> io::Result<Box<dyn Read + Send>>;

    /// Delete the archive for `fp`
    fn remove(&self, fp: Fingerprint) -> io::Result<()>;
}

/// [`FileStore`] keeping archives as `<root>/<id>[n].osz` on the local filesystem
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Archive file extension
    pub const EXTENSION: &'static str = "osz";

    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileStore for FsStore {
    fn resolve(&self, fp: Fingerprint) -> PathBuf {
        self.root.join(format!("{fp}.{}", Self::EXTENSION))
    }

    fn create(&self, fp: Fingerprint) -> io::Result<Box<dyn Write + Send>> {
        let path = self.resolve(fp);
        let file = match File::create(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.root)?;
                File::create(&path)?
            }
            other => other?,
        };
        Ok(Box::new(file))
    }

    fn open(&self, fp: Fingerprint) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.resolve(fp))?))
    }

    fn remove(&self, fp: Fingerprint) -> io::Result<()> {
        fs::remove_file(self.resolve(fp))
    }
}
