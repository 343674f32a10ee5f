//! Core type definitions for beatcache
//!
//! This module defines the identifiers and time representation shared by
//! the cache engine and its collaborators.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wall-clock instant with its zone offset.
///
/// Equality and ordering compare the instant only, so two timestamps taken
/// in different zones are equal when they denote the same moment.
pub type Timestamp = DateTime<FixedOffset>;

/// Current wall-clock time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now().fixed_offset()
}

/// Identity of one cached archive: the beatmap set id plus the variant.
///
/// A set may be served either with its video (`no_video == false`) or
/// stripped of it. The two renderings are distinct files and distinct
/// cache entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Beatmap set id in the upstream catalog
    pub id: u64,
    /// True for the variant without the bundled video
    pub no_video: bool,
}

impl Fingerprint {
    /// Create a new fingerprint
    #[must_use]
    pub const fn new(id: u64, no_video: bool) -> Self {
        Self { id, no_video }
    }

    /// Fingerprint of the full (with video) variant
    #[must_use]
    pub const fn full(id: u64) -> Self {
        Self::new(id, false)
    }

    /// Fingerprint of the variant without video
    #[must_use]
    pub const fn stripped(id: u64) -> Self {
        Self::new(id, true)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.no_video {
            write!(f, "{}n", self.id)
        } else {
            write!(f, "{}", self.id)
        }
    }
}
