//! beatcache common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions and configuration
//! used by the cache engine and the admin binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
