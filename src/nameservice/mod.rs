//! Parsing and merging for the identity databases (`passwd`, `group`,
//! `shadow`, `gshadow`) and `/etc/shells`.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

pub mod group;
pub mod passwd;
pub mod shadow;
pub mod shells;

/// Bounds of the reserved range for automatically assigned system ids.
/// Allocation scans downward from the high end; the direction is observable
/// in which id a colliding entry ends up with.
pub const LOWEST_SYSTEM_ID: u32 = 101;
pub const HIGHEST_SYSTEM_ID: u32 = 999;

/// Conventional catch-all group, used for merged users whose original
/// primary group cannot be mapped.
pub const NOGROUP_GID: u32 = 65534;

#[derive(Debug, thiserror::Error)]
#[error("all available system ids between {LOWEST_SYSTEM_ID} and {HIGHEST_SYSTEM_ID} are taken")]
pub struct NoIdsLeft;

/// A name present in the incoming database is missing from the merged one.
/// The merge must have added it, so hitting this is a hard error.
#[derive(Debug, thiserror::Error)]
#[error("can't find {0} in merged file")]
pub struct MissingName(pub String);

/// Collects the per-entry errors of a database merge into one report.
#[derive(Debug)]
pub struct MergeFailure {
    what: String,
    errors: Vec<anyhow::Error>,
}

impl MergeFailure {
    pub fn new(what: impl Into<String>, errors: Vec<anyhow::Error>) -> Self {
        Self {
            what: what.into(),
            errors,
        }
    }
}

impl fmt::Display for MergeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.what)?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{:#}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MergeFailure {}

/// Create (or truncate) `path` for writing. The mode only applies when the
/// file does not exist yet; an already-seeded file keeps its copied mode.
pub(crate) fn create_with_mode(path: &Path, mode: u32) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
}
