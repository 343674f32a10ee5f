//! Eviction policy
//!
//! Each pass first looks for truncated archives (downloaded, non-empty but
//! smaller than [`TRUNCATED_SIZE_LIMIT`]). If any exist they are the whole
//! removal set for the pass. Otherwise, if the downloaded archives exceed
//! the disk budget, the least recently requested ones are removed until the
//! excess is covered.
//!
//! Entries with a size of 0 (failed or unavailable downloads) are never
//! selected. They take no disk space and keep the registry from retrying a
//! source version that is known to be missing.

use crate::entry::CachedEntry;
use beatcache_common::{Fingerprint, Timestamp};
use serde::Serialize;
use std::sync::Arc;

/// Archives below this size are considered truncated
pub const TRUNCATED_SIZE_LIMIT: u64 = 10_000;

/// Why a pass selected its victims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Nothing to remove
    None,
    /// Truncated archives were found
    Truncated,
    /// The disk budget was exceeded
    OverBudget,
}

/// Outcome of the selection step of a cleanup pass
#[derive(Debug)]
pub struct EvictionPlan {
    pub reason: EvictionReason,
    pub victims: Vec<Arc<CachedEntry>>,
    /// Bytes held by downloaded archives before eviction
    pub total_size: u64,
}

impl EvictionPlan {
    /// Bytes the victims occupy
    pub fn victim_bytes(&self) -> u64 {
        self.victims.iter().map(|e| e.file_size()).sum()
    }
}

struct Candidate {
    entry: Arc<CachedEntry>,
    fingerprint: Fingerprint,
    size: u64,
    last_requested: Timestamp,
}

/// Select the entries to remove so the cache fits in `max_size` bytes
pub fn plan<'a, I>(entries: I, max_size: u64) -> EvictionPlan
where
    I: IntoIterator<Item = &'a Arc<CachedEntry>>,
{
    let candidates: Vec<Candidate> = entries
        .into_iter()
        .filter_map(|entry| {
            let snap = entry.snapshot();
            snap.is_downloaded.then(|| Candidate {
                entry: Arc::clone(entry),
                fingerprint: snap.fingerprint,
                size: snap.file_size,
                last_requested: snap.last_requested,
            })
        })
        .collect();
    let total_size = candidates.iter().map(|c| c.size).sum();

    let truncated: Vec<Arc<CachedEntry>> = candidates
        .iter()
        .filter(|c| c.size > 0 && c.size < TRUNCATED_SIZE_LIMIT)
        .map(|c| Arc::clone(&c.entry))
        .collect();
    if !truncated.is_empty() {
        return EvictionPlan {
            reason: EvictionReason::Truncated,
            victims: truncated,
            total_size,
        };
    }

    if total_size <= max_size {
        return EvictionPlan {
            reason: EvictionReason::None,
            victims: Vec::new(),
            total_size,
        };
    }

    let mut removable: Vec<Candidate> = candidates.into_iter().filter(|c| c.size > 0).collect();
    removable.sort_by(|a, b| {
        a.last_requested
            .cmp(&b.last_requested)
            .then(a.fingerprint.cmp(&b.fingerprint))
    });

    let excess = total_size - max_size;
    let mut freed = 0u64;
    let mut victims = Vec::new();
    for candidate in removable {
        freed += candidate.size;
        victims.push(candidate.entry);
        if freed >= excess {
            break;
        }
    }

    EvictionPlan {
        reason: EvictionReason::OverBudget,
        victims,
        total_size,
    }
}
