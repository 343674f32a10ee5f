//! beatcache House - archive cache engine
//!
//! This crate keeps track of the beatmap archives cached on local disk:
//! - Binary state codec for the persisted registry
//! - Per-archive entries coordinating a single in-flight download
//! - The registry deciding who downloads what
//! - Eviction under a disk budget, run by a debounced background cleaner
//! - Maintenance purge of files that are not ZIP archives

pub mod codec;
pub mod entry;
pub mod eviction;
pub mod fetch;
pub mod house;
pub mod purge;
pub mod scheduler;
pub mod stats;
pub mod store;

// Re-exports
pub use codec::{EntryRecord, HEADER_SIZE, MAGIC, RECORD_SIZE};
pub use entry::{CachedEntry, EntrySnapshot};
pub use eviction::{EvictionPlan, EvictionReason, TRUNCATED_SIZE_LIMIT};
pub use fetch::{DirDownloader, Download, Downloader, Retry, fetch};
pub use house::{CleanupReport, DEFAULT_MAX_SIZE, House};
pub use purge::{PurgeReport, ZIP_MAGIC};
pub use scheduler::{Cleaner, CleanupTrigger};
pub use stats::{HouseStats, HouseStatsSnapshot};
pub use store::{FileStore, FsStore};
