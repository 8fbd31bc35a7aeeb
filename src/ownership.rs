//! Recursive remapping of file ownership through uid/gid translation tables.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{Context, Result};
use fn_error_context::context;
use nix::unistd::{Gid, Uid};
use walkdir::WalkDir;

/// Rewrite the owner of every non-symlink node under `root`. Ids present in
/// a mapping are translated; ids absent from it are kept as they are.
/// `chown` is only invoked when at least one id actually changes. The walk
/// aborts on the first error.
#[context("Applying owner mapping under {}", root.display())]
pub fn apply_owner_mapping_recursive(
    root: &Path,
    uid_mapping: &HashMap<u32, u32>,
    gid_mapping: &HashMap<u32, u32>,
) -> Result<()> {
    apply_owner_mapping_impl(root, uid_mapping, gid_mapping, &mut |path, uid, gid| {
        nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(Into::into)
    })
}

// The chown function is injected so tests can observe calls without
// privileges.
fn apply_owner_mapping_impl(
    root: &Path,
    uid_mapping: &HashMap<u32, u32>,
    gid_mapping: &HashMap<u32, u32>,
    chown: &mut dyn FnMut(&Path, u32, u32) -> Result<()>,
) -> Result<()> {
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.context("can't search path")?;
        if entry.file_type().is_symlink() {
            continue;
        }
        let meta = entry.metadata().context("can't get info about file")?;

        let old_uid = meta.uid();
        let old_gid = meta.gid();
        let new_uid = uid_mapping.get(&old_uid).copied().unwrap_or(old_uid);
        let new_gid = gid_mapping.get(&old_gid).copied().unwrap_or(old_gid);
        if new_uid == old_uid && new_gid == old_gid {
            continue;
        }

        tracing::debug!("changing ownership of {}", entry.path().display());
        chown(entry.path(), new_uid, new_gid)
            .with_context(|| format!("can't apply ownership of {}", entry.path().display()))?;
    }
    Ok(())
}
