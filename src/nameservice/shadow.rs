//! Name-keyed merging for the shadowed password files (`shadow`, `gshadow`).
//!
//! Entries are opaque here: the name before the first `:` is the key and the
//! rest of the line is carried verbatim, so the two formats share one merge.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::{HashMap, HashSet};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use fn_error_context::context;

const SHADOW_MODE: u32 = 0o640;

/// Merge entries from `extra_dir/shadow` into `dest_dir/shadow`.
/// Returns the number of added entries.
pub fn merge_in_shadow(dest_dir: &Path, extra_dir: &Path) -> Result<usize> {
    merge_shadow_style(dest_dir, extra_dir, "shadow")
}

/// Merge entries from `extra_dir/gshadow` into `dest_dir/gshadow`.
/// Returns the number of added entries.
pub fn merge_in_gshadow(dest_dir: &Path, extra_dir: &Path) -> Result<usize> {
    merge_shadow_style(dest_dir, extra_dir, "gshadow")
}

/// Split each non-empty line at the first `:`; the name is the key, the
/// suffix is opaque. Empty names are skipped; a name repeated within the
/// file resolves to its last line.
fn parse_opaque_entries(content: &str) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        let (name, rest) = line.split_once(':').unwrap_or((line, ""));
        if name.is_empty() {
            continue;
        }
        match index.get(name) {
            Some(&position) => entries[position].1 = rest.to_string(),
            None => {
                index.insert(name.to_string(), entries.len());
                entries.push((name.to_string(), rest.to_string()));
            }
        }
    }
    entries
}

/// Absorb entries whose name is not present in the destination yet. When
/// nothing is absorbed the destination file is left untouched; otherwise it
/// is rewritten with the destination's entries first and the new ones
/// appended.
#[context("Merging {} entries", file_name)]
fn merge_shadow_style(dest_dir: &Path, extra_dir: &Path, file_name: &str) -> Result<usize> {
    let dest_path = dest_dir.join(file_name);
    let extra_path = extra_dir.join(file_name);

    let dest_content = std::fs::read_to_string(&dest_path)
        .with_context(|| format!("can't open {} file", file_name))?;
    let extra_content = std::fs::read_to_string(&extra_path)
        .with_context(|| format!("can't open extra {} file", file_name))?;

    let mut entries = parse_opaque_entries(&dest_content);
    let mut seen: HashSet<String> = entries.iter().map(|(name, _)| name.clone()).collect();

    let mut added = 0;
    for (name, rest) in parse_opaque_entries(&extra_content) {
        if !seen.insert(name.clone()) {
            continue;
        }
        entries.push((name, rest));
        added += 1;
    }

    if added == 0 {
        return Ok(0);
    }

    let file = super::create_with_mode(&dest_path, SHADOW_MODE)?;
    let mut writer = BufWriter::new(file);
    for (name, rest) in &entries {
        writeln!(writer, "{}:{}", name, rest)?;
    }
    writer
        .flush()
        .with_context(|| format!("can't write {} file", file_name))?;

    Ok(added)
}
