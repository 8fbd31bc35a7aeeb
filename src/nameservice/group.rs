//! Helpers for the [group file](https://man7.org/linux/man-pages/man5/group.5.html).
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use fn_error_context::context;

use super::{MissingName, NoIdsLeft, HIGHEST_SYSTEM_ID, LOWEST_SYSTEM_ID};

const GROUP_MODE: u32 = 0o644;

// Entry from group file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub passwd: String,
    pub gid: u32,
    pub users: Vec<String>,
}

impl GroupEntry {
    /// Parse a single group entry. Lines with the wrong field count, an
    /// empty name or a non-numeric gid yield `None`.
    pub fn parse_line(s: impl AsRef<str>) -> Option<Self> {
        let fields: Vec<&str> = s.as_ref().split(':').collect();
        if fields.len() != 4 || fields[0].is_empty() {
            return None;
        }
        let gid = fields[2].parse().ok()?;
        let users = if fields[3].is_empty() {
            Vec::new()
        } else {
            fields[3].split(',').map(String::from).collect()
        };
        Some(Self {
            name: fields[0].to_string(),
            passwd: fields[1].to_string(),
            gid,
            users,
        })
    }

    /// Serialize entry to writer, as a group line.
    pub fn to_writer(&self, writer: &mut impl Write) -> Result<()> {
        writeln!(
            writer,
            "{}:{}:{}:{}",
            self.name,
            self.passwd,
            self.gid,
            self.users.join(",")
        )
        .context("failed to write group entry")
    }
}

/// The entry set of a group file, keyed uniquely by group name.
///
/// Source line order is discarded; serialization emits entries ordered by
/// gid ascending.
#[derive(Debug, Clone, Default)]
pub struct GroupFile {
    pub entries: BTreeMap<String, GroupEntry>,
}

impl GroupFile {
    #[context("Parsing group file {}", path.display())]
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("can't read group file")?;
        Ok(Self::parse(&content))
    }

    /// Reduce the file content to a name-keyed entry set, skipping
    /// malformed lines silently.
    pub fn parse(content: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(entry) = GroupEntry::parse_line(line) {
                entries.insert(entry.name.clone(), entry);
            }
        }
        Self { entries }
    }

    pub fn to_writer(&self, writer: &mut impl Write) -> Result<()> {
        let mut entries: Vec<&GroupEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.gid);
        for entry in entries {
            entry.to_writer(writer)?;
        }
        Ok(())
    }

    #[context("Writing group file {}", path.display())]
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = super::create_with_mode(path, GROUP_MODE)?;
        let mut writer = BufWriter::new(file);
        self.to_writer(&mut writer)?;
        writer.flush().context("can't write file")?;
        Ok(())
    }

    /// Insert a system group. The requested gid is kept when it is still
    /// free; otherwise the system range is scanned downward for the first
    /// free id. Returns the gid the group ended up with.
    pub fn add_system_group(&mut self, mut entry: GroupEntry) -> Result<u32, NoIdsLeft> {
        if let Some(existing) = self.entries.get(&entry.name) {
            return Ok(existing.gid);
        }

        let taken: HashSet<u32> = self.entries.values().map(|e| e.gid).collect();
        if !taken.contains(&entry.gid) {
            let gid = entry.gid;
            self.entries.insert(entry.name.clone(), entry);
            return Ok(gid);
        }

        for gid in (LOWEST_SYSTEM_ID..=HIGHEST_SYSTEM_ID).rev() {
            if taken.contains(&gid) {
                continue;
            }
            entry.gid = gid;
            self.entries.insert(entry.name.clone(), entry);
            return Ok(gid);
        }

        Err(NoIdsLeft)
    }

    /// Absorb every entry of `other` whose name is not present yet.
    /// Per-entry failures are collected instead of aborting the merge.
    pub fn merge_from(&mut self, other: &GroupFile) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        for entry in other.entries.values() {
            if self.entries.contains_key(&entry.name) {
                continue;
            }
            if let Err(e) = self.add_system_group(entry.clone()) {
                errors.push(
                    anyhow::Error::new(e).context(format!("can't add group {}", entry.name)),
                );
            }
        }
        errors
    }
}

/// Map every gid of `from` to the gid the same name holds in `to`.
pub fn create_gid_mapping(
    from: &GroupFile,
    to: &GroupFile,
) -> Result<HashMap<u32, u32>, MissingName> {
    let mut mapping = HashMap::new();
    for (name, entry) in &from.entries {
        let target = to
            .entries
            .get(name)
            .ok_or_else(|| MissingName(name.clone()))?;
        mapping.insert(entry.gid, target.gid);
    }
    Ok(mapping)
}
