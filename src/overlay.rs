//! Orchestration of the overlay rebuild: seed, merge, remap, prune.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use fn_error_context::context;
use walkdir::WalkDir;

use crate::handlers::HandlerRegistry;
use crate::nameservice::group::{self, GroupFile};
use crate::nameservice::passwd::{self, PasswdFile};
use crate::nameservice::{shadow, shells, MergeFailure, NOGROUP_GID};
use crate::ownership;
use crate::prune;
use crate::treecopy;

/// The configuration files rebuilt by the structured database merges rather
/// than by verbatim copy. This is also the merge sequence: `group` must come
/// before `passwd`, because the passwd merge consumes the gid remap the
/// group merge produces.
pub static SPECIAL_FILES: &[&str] = &["group", "gshadow", "passwd", "shadow", "shells"];

/// The four directory roots of a rebuild.
#[derive(Debug, Clone)]
pub struct BuildRoots {
    /// Previous read-only /etc.
    pub lower_old: PathBuf,
    /// Previous writable overlay.
    pub upper_old: PathBuf,
    /// New read-only /etc.
    pub lower_new: PathBuf,
    /// Target overlay; rebuilt from scratch.
    pub upper_new: PathBuf,
}

/// Rebuild the writable overlay for a new lower layer.
///
/// The target is emptied and reseeded from the old overlay, the identity
/// databases ([`SPECIAL_FILES`]) are merged structurally, the new lower
/// layer's ownership is rewritten through the derived uid/gid remaps, and
/// finally every overlay entry that is identical to its lower counterpart
/// is pruned.
pub fn build_new_etc(roots: &BuildRoots, handlers: &HandlerRegistry) -> Result<()> {
    prepare_target(roots)?;

    seed_overlay(roots, handlers).context("can't create new upper etc")?;

    let (user_mapping, group_mapping) = merge_special_files(roots)?;

    // The overlay seeded from the old upper layer already carries numbering
    // consistent with its own identity files; the new lower layer is where
    // the remapped numbering must land before the union is mounted.
    ownership::apply_owner_mapping_recursive(&roots.lower_new, &user_mapping, &group_mapping)
        .context("can't apply owner mapping")?;

    prune::remove_identical_files(&roots.upper_new, &roots.lower_new);

    Ok(())
}

/// Start from an empty target; input roots are created when absent.
#[context("Preparing target directory")]
fn prepare_target(roots: &BuildRoots) -> Result<()> {
    match fs::remove_dir_all(&roots.upper_new) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("can't clear target directory"),
    }
    if let Some(parent) = roots.upper_new.parent() {
        fs::create_dir_all(parent).context("can't create target parent directory")?;
    }
    for dir in [&roots.lower_old, &roots.upper_old, &roots.lower_new] {
        fs::create_dir_all(dir)
            .with_context(|| format!("can't create directory {}", dir.display()))?;
    }
    Ok(())
}

/// Carbon-copy the old overlay into the target. Registered handlers get the
/// first shot at every node; the kind dispatch is the default.
#[context("Seeding overlay from {}", roots.upper_old.display())]
fn seed_overlay(roots: &BuildRoots, handlers: &HandlerRegistry) -> Result<()> {
    for entry in WalkDir::new(&roots.upper_old).sort_by_file_name() {
        let entry = entry.context("can't search path")?;
        let relative = entry
            .path()
            .strip_prefix(&roots.upper_old)
            .context("walked outside the overlay root")?;

        if let Some(handler) = handlers.find(entry.path()) {
            handler
                .handle(relative, roots)
                .with_context(|| format!("handler failed on \"{}\"", relative.display()))?;
            continue;
        }

        treecopy::carbon_copy(entry.path(), &roots.upper_new.join(relative))
            .with_context(|| format!("can't copy \"{}\"", relative.display()))?;
    }
    Ok(())
}

/// Run the structured merges in the [`SPECIAL_FILES`] sequence and return
/// the derived (uid, gid) remap tables.
#[context("Merging identity databases")]
fn merge_special_files(roots: &BuildRoots) -> Result<(HashMap<u32, u32>, HashMap<u32, u32>)> {
    let mut group_state: Option<(GroupFile, HashMap<u32, u32>)> = None;
    let mut user_mapping = HashMap::new();

    for name in SPECIAL_FILES {
        match *name {
            "group" => group_state = Some(merge_group_files(roots)?),
            "gshadow" => {
                shadow::merge_in_gshadow(&roots.upper_new, &roots.lower_new)
                    .context("can't merge lower gshadow file into upper")?;
            }
            "passwd" => {
                let (group_file, group_mapping) = group_state
                    .as_ref()
                    .ok_or_else(|| anyhow!("group merge must run before passwd"))?;
                user_mapping = merge_passwd_files(roots, group_file, group_mapping)?;
            }
            "shadow" => {
                shadow::merge_in_shadow(&roots.upper_new, &roots.lower_new)
                    .context("can't merge lower shadow file into upper")?;
            }
            "shells" => match shells::merge_in_shells(&roots.upper_new, &roots.lower_new) {
                Ok(_) => {}
                // a system without /etc/shells is fine
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e.context("can't merge lower shells file into upper")),
            },
            other => bail!("no structured merge for {}", other),
        }
    }

    let (_, group_mapping) =
        group_state.ok_or_else(|| anyhow!("group merge did not run"))?;
    Ok((user_mapping, group_mapping))
}

fn merge_group_files(roots: &BuildRoots) -> Result<(GroupFile, HashMap<u32, u32>)> {
    let mut merged =
        GroupFile::load(&roots.upper_old.join("group")).context("can't open current group file")?;
    let incoming = GroupFile::load(&roots.lower_new.join("group"))
        .context("can't open new lower group file")?;

    let errors = merged.merge_from(&incoming);
    if !errors.is_empty() {
        return Err(MergeFailure::new("can't merge groups", errors).into());
    }

    merged
        .write_to(&roots.upper_new.join("group"))
        .context("can't write merged group file")?;

    let mapping =
        group::create_gid_mapping(&incoming, &merged).context("can't create group mapping")?;

    Ok((merged, mapping))
}

fn merge_passwd_files(
    roots: &BuildRoots,
    group_file: &GroupFile,
    group_mapping: &HashMap<u32, u32>,
) -> Result<HashMap<u32, u32>> {
    let mut merged = PasswdFile::load(&roots.upper_old.join("passwd"))
        .context("can't open current passwd file")?;
    let incoming = PasswdFile::load(&roots.lower_new.join("passwd"))
        .context("can't open new lower passwd file")?;

    let nogroup_gid = group_file
        .entries
        .get("nogroup")
        .map(|entry| entry.gid)
        .unwrap_or(NOGROUP_GID);

    let errors = merged.merge_from(&incoming, group_mapping, nogroup_gid);
    if !errors.is_empty() {
        return Err(MergeFailure::new("can't merge users", errors).into());
    }

    merged
        .write_to(&roots.upper_new.join("passwd"))
        .context("can't write merged passwd file")?;

    let mapping = passwd::create_uid_mapping(&incoming, &merged)
        .context("can't create user mapping")?;

    Ok(mapping)
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.root_cause()
        .downcast_ref::<io::Error>()
        .map(|e| e.kind() == io::ErrorKind::NotFound)
        .unwrap_or(false)
}

/// Whether `name` is one of the files [`build_new_etc`] merges structurally.
pub fn is_special_file(name: &str) -> bool {
    SPECIAL_FILES.contains(&name)
}
