//! Pruning of overlay entries that are identical to the lower layer.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::treecopy::NodeKind;

/// Remove every node under `target` whose counterpart at the same relative
/// path under `base` has the same kind and compares identical under the
/// kind-specific comparison. Directories are never compared or removed.
///
/// Best-effort: per-path problems are logged as warnings and never fail the
/// caller; a missing base node simply means the target entry is kept.
pub fn remove_identical_files(target: &Path, base: &Path) {
    let mut to_remove: Vec<PathBuf> = Vec::new();

    for entry in WalkDir::new(target).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("can't search {} for cleanup: {}", target.display(), e);
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let target_meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("can't get info about {}: {}", entry.path().display(), e);
                continue;
            }
        };
        // node types outside the supported set are left alone
        let Some(kind) = NodeKind::of(&target_meta) else {
            continue;
        };
        let Ok(relative) = entry.path().strip_prefix(target) else {
            continue;
        };

        let base_path = base.join(relative);
        let base_meta = match fs::symlink_metadata(&base_path) {
            Ok(meta) => meta,
            // no base file, so keep target
            Err(_) => continue,
        };
        if NodeKind::of(&base_meta) != Some(kind) {
            continue;
        }

        match kind.is_identical(entry.path(), &target_meta, &base_path, &base_meta) {
            Ok(true) => to_remove.push(entry.path().to_path_buf()),
            Ok(false) => {}
            Err(e) => tracing::warn!("can't compare {}: {}", relative.display(), e),
        }
    }

    // unlink after the walk so the traversal never sees its own mutations
    for path in to_remove {
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!("can't remove unnecessary file {}: {}", path.display(), e);
        }
    }
}
