//! Merging for [`/etc/shells`](https://man7.org/linux/man-pages/man5/shells.5.html).
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use fn_error_context::context;

const SHELLS_MODE: u32 = 0o644;

/// Append shells from `extra_dir/shells` that `dest_dir/shells` does not
/// list yet. The destination's order (comments included) is preserved;
/// blank lines, comments and duplicates from the incoming side are never
/// added. Returns the number of appended shells.
#[context("Merging shells entries")]
pub fn merge_in_shells(dest_dir: &Path, extra_dir: &Path) -> Result<usize> {
    let shells_path = dest_dir.join("shells");

    let dest_content =
        std::fs::read_to_string(&shells_path).context("can't open shells file")?;
    let extra_content = std::fs::read_to_string(extra_dir.join("shells"))
        .context("can't open extra shells file")?;

    let mut lines: Vec<String> = dest_content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();

    let mut added = 0;
    for line in extra_content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if lines.iter().any(|existing| existing == line) {
            continue;
        }
        lines.push(line.to_string());
        added += 1;
    }

    let mut file = super::create_with_mode(&shells_path, SHELLS_MODE)?;
    let merged = lines.join("\n") + "\n";
    file.write_all(merged.as_bytes())
        .context("can't write shells file")?;

    Ok(added)
}
