//! Carbon copies of filesystem nodes: content, mode, owner and mtime.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use anyhow::{Context, Result};
use filetime::FileTime;
use fn_error_context::context;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{Gid, Uid};
use walkdir::WalkDir;

/// The node kinds the engine reproduces. Anything else encountered in a
/// source tree (block devices, fifos, sockets) is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    Regular,
    Symlink,
    CharDevice,
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported file type: {}", .0.display())]
pub struct UnsupportedFiletype(pub PathBuf);

impl NodeKind {
    /// Classify from `lstat` results; symlinks are never followed.
    pub fn of(meta: &fs::Metadata) -> Option<Self> {
        let file_type = meta.file_type();
        if file_type.is_dir() {
            Some(NodeKind::Directory)
        } else if file_type.is_file() {
            Some(NodeKind::Regular)
        } else if file_type.is_symlink() {
            Some(NodeKind::Symlink)
        } else if file_type.is_char_device() {
            Some(NodeKind::CharDevice)
        } else {
            None
        }
    }

    /// Kind-specific identity of the nodes at `a` and `b`, assumed to be of
    /// this kind. Directories never compare identical: pruning them would
    /// require tracking emptiness, so they are always kept.
    pub fn is_identical(
        self,
        a: &Path,
        a_meta: &fs::Metadata,
        b: &Path,
        b_meta: &fs::Metadata,
    ) -> Result<bool> {
        match self {
            NodeKind::Directory => Ok(false),
            NodeKind::Regular => {
                if !same_attributes(a_meta, b_meta) {
                    return Ok(false);
                }
                Ok(file_checksum(a)? == file_checksum(b)?)
            }
            // only the stored target counts; mode and owner of a symlink
            // are meaningless on Linux
            NodeKind::Symlink => Ok(fs::read_link(a)? == fs::read_link(b)?),
            NodeKind::CharDevice => {
                Ok(same_attributes(a_meta, b_meta) && a_meta.rdev() == b_meta.rdev())
            }
        }
    }
}

/// Permission bits of a raw mode (the low 12 bits, POSIX layout).
pub fn perm_bits(mode: u32) -> u32 {
    mode & 0o7777
}

fn same_attributes(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    perm_bits(a.mode()) == perm_bits(b.mode()) && a.uid() == b.uid() && a.gid() == b.gid()
}

/// CRC-32/IEEE over the file contents.
pub fn file_checksum(path: &Path) -> Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

// All copied nodes share a single access time, taken once at first use, so
// that repeated runs over frozen inputs produce comparable trees.
fn copy_atime() -> FileTime {
    static ATIME: OnceLock<FileTime> = OnceLock::new();
    *ATIME.get_or_init(|| FileTime::from_system_time(SystemTime::now()))
}

/// Reproduce the single node `from` at `to`: create it, then (for
/// non-symlinks) apply owner, permission bits and mtime from the source.
pub fn carbon_copy(from: &Path, to: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(from).context("can't find information about file")?;
    let kind = NodeKind::of(&meta).ok_or_else(|| UnsupportedFiletype(from.to_path_buf()))?;

    match kind {
        NodeKind::Directory => {
            fs::create_dir(to).context("can't make directory")?;
        }
        NodeKind::Regular => {
            copy_file_contents(&meta, from, to)?;
        }
        NodeKind::Symlink => {
            let target = fs::read_link(from).context("can't read symlink")?;
            std::os::unix::fs::symlink(&target, to).context("can't create symlink")?;
            // attributes are left alone on purpose
            return Ok(());
        }
        NodeKind::CharDevice => {
            nix::sys::stat::mknod(
                to,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(meta.mode()),
                meta.rdev(),
            )
            .context("can't create character special file")?;
        }
    }

    copy_attributes(&meta, to)
}

/// Walk `from` in lexical order, parents first, and reproduce every node at
/// the corresponding position under `to`.
#[context("Copying {} to {}", from.display(), to.display())]
pub fn carbon_copy_recursive(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry.context("can't search path")?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .context("walked outside the source root")?;
        carbon_copy(entry.path(), &to.join(relative))
            .with_context(|| format!("can't copy \"{}\"", relative.display()))?;
    }
    Ok(())
}

fn copy_file_contents(meta: &fs::Metadata, from: &Path, to: &Path) -> Result<()> {
    let mut src = fs::File::open(from).context("can't open file for reading")?;
    let mut dest = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(perm_bits(meta.mode()))
        .open(to)
        .context("can't create file")?;
    io::copy(&mut src, &mut dest).context("can't copy data")?;
    Ok(())
}

fn copy_attributes(meta: &fs::Metadata, to: &Path) -> Result<()> {
    nix::unistd::chown(
        to,
        Some(Uid::from_raw(meta.uid())),
        Some(Gid::from_raw(meta.gid())),
    )
    .context("can't change owner")?;
    fs::set_permissions(to, fs::Permissions::from_mode(perm_bits(meta.mode())))
        .context("can't change permissions")?;
    filetime::set_file_times(
        to,
        copy_atime(),
        FileTime::from_last_modification_time(meta),
    )
    .context("can't change mod time")?;
    Ok(())
}
