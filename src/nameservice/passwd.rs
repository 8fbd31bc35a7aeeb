//! Helpers for the [password file](https://man7.org/linux/man-pages/man5/passwd.5.html).
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use fn_error_context::context;

use super::{MissingName, NoIdsLeft, HIGHEST_SYSTEM_ID, LOWEST_SYSTEM_ID};

const PASSWD_MODE: u32 = 0o644;

// Entry from passwd file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub passwd: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home_dir: String,
    pub shell: String,
}

impl PasswdEntry {
    /// Parse a single passwd entry; malformed lines yield `None`.
    pub fn parse_line(s: impl AsRef<str>) -> Option<Self> {
        let fields: Vec<&str> = s.as_ref().split(':').collect();
        if fields.len() != 7 || fields[0].is_empty() {
            return None;
        }
        let uid = fields[2].parse().ok()?;
        let gid = fields[3].parse().ok()?;
        Some(Self {
            name: fields[0].to_string(),
            passwd: fields[1].to_string(),
            uid,
            gid,
            gecos: fields[4].to_string(),
            home_dir: fields[5].to_string(),
            shell: fields[6].to_string(),
        })
    }

    /// Serialize entry to writer, as a passwd line.
    pub fn to_writer(&self, writer: &mut impl Write) -> Result<()> {
        writeln!(
            writer,
            "{}:{}:{}:{}:{}:{}:{}",
            self.name, self.passwd, self.uid, self.gid, self.gecos, self.home_dir, self.shell
        )
        .context("failed to write passwd entry")
    }
}

/// The entry set of a passwd file, keyed uniquely by user name.
/// Serialization emits entries ordered by uid ascending.
#[derive(Debug, Clone, Default)]
pub struct PasswdFile {
    pub entries: BTreeMap<String, PasswdEntry>,
}

impl PasswdFile {
    #[context("Parsing passwd file {}", path.display())]
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("can't read passwd file")?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(entry) = PasswdEntry::parse_line(line) {
                entries.insert(entry.name.clone(), entry);
            }
        }
        Self { entries }
    }

    pub fn to_writer(&self, writer: &mut impl Write) -> Result<()> {
        let mut entries: Vec<&PasswdEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.uid);
        for entry in entries {
            entry.to_writer(writer)?;
        }
        Ok(())
    }

    #[context("Writing passwd file {}", path.display())]
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = super::create_with_mode(path, PASSWD_MODE)?;
        let mut writer = BufWriter::new(file);
        self.to_writer(&mut writer)?;
        writer.flush().context("can't write file")?;
        Ok(())
    }

    /// Insert a system user, keeping the requested uid when free and
    /// scanning the system range downward otherwise.
    pub fn add_system_user(&mut self, mut entry: PasswdEntry) -> Result<u32, NoIdsLeft> {
        if let Some(existing) = self.entries.get(&entry.name) {
            return Ok(existing.uid);
        }

        let taken: HashSet<u32> = self.entries.values().map(|e| e.uid).collect();
        if !taken.contains(&entry.uid) {
            let uid = entry.uid;
            self.entries.insert(entry.name.clone(), entry);
            return Ok(uid);
        }

        for uid in (LOWEST_SYSTEM_ID..=HIGHEST_SYSTEM_ID).rev() {
            if taken.contains(&uid) {
                continue;
            }
            entry.uid = uid;
            self.entries.insert(entry.name.clone(), entry);
            return Ok(uid);
        }

        Err(NoIdsLeft)
    }

    /// Absorb every entry of `other` whose name is not present yet. Each
    /// incoming user's primary gid is rewritten through `group_mapping`
    /// before insertion; unmapped gids fall back to `nogroup_gid`.
    pub fn merge_from(
        &mut self,
        other: &PasswdFile,
        group_mapping: &HashMap<u32, u32>,
        nogroup_gid: u32,
    ) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        for entry in other.entries.values() {
            if self.entries.contains_key(&entry.name) {
                continue;
            }
            let mut entry = entry.clone();
            entry.gid = group_mapping
                .get(&entry.gid)
                .copied()
                .unwrap_or(nogroup_gid);
            let name = entry.name.clone();
            if let Err(e) = self.add_system_user(entry) {
                errors.push(anyhow::Error::new(e).context(format!("can't add user {}", name)));
            }
        }
        errors
    }
}

/// Map every uid of `from` to the uid the same name holds in `to`.
pub fn create_uid_mapping(
    from: &PasswdFile,
    to: &PasswdFile,
) -> Result<HashMap<u32, u32>, MissingName> {
    let mut mapping = HashMap::new();
    for (name, entry) in &from.entries {
        let target = to
            .entries
            .get(name)
            .ok_or_else(|| MissingName(name.clone()))?;
        mapping.insert(entry.uid, target.uid);
    }
    Ok(mapping)
}
