//! End-to-end tests for the overlay rebuild pipeline.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use etcmerge::nameservice::group::GroupFile;
use etcmerge::nameservice::passwd::PasswdFile;
use etcmerge::{build_new_etc, BuildRoots, FileHandler, HandlerRegistry};

const PASSWD_LOWER_OLD: &str = "
root:x:0:0:root:/root:/bin/bash
irc:x:39:39:ircd:/run/ircd:/usr/sbin/nologin
_apt:x:42:65534::/nonexistent:/usr/sbin/nologin
nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin
";

const PASSWD_UPPER_OLD: &str = "
root:x:0:0:root:/root:/bin/bash
irc:x:39:39:ircd:/run/ircd:/usr/sbin/nologin
_apt:x:42:65534::/nonexistent:/usr/sbin/nologin
nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin
test::1000:1000:Tau:/home/test:/usr/bin/bash
";

const PASSWD_LOWER_NEW: &str = "
root:x:0:0:root:/root:/bin/bash
irc:x:39:39:ircd:/run/ircd:/usr/sbin/nologin
uucp:x:10:10:uucp:/var/spool/uucp:/usr/sbin/nologin
_apt:x:42:65534::/nonexistent:/usr/sbin/nologin
nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin
";

const PASSWD_EXPECT: &str = "
root:x:0:0:root:/root:/bin/bash
uucp:x:10:10:uucp:/var/spool/uucp:/usr/sbin/nologin
irc:x:39:39:ircd:/run/ircd:/usr/sbin/nologin
_apt:x:42:65534::/nonexistent:/usr/sbin/nologin
test::1000:1000:Tau:/home/test:/usr/bin/bash
nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin
";

const GROUP_LOWER_OLD: &str = "
root:x:0:
irc:x:39:
nogroup:x:65534:
";

const GROUP_UPPER_OLD: &str = "
root:x:0:
irc:x:39:
nogroup:x:65534:
test:x:1000:
";

const GROUP_LOWER_NEW: &str = "
root:x:0:
irc:x:39:
uucp:x:10:
nogroup:x:65534:
";

const GROUP_EXPECT: &str = "
root:x:0:
uucp:x:10:
irc:x:39:
test:x:1000:
nogroup:x:65534:
";

const GSHADOW_LOWER_OLD: &str = "
root:*::
irc:*::
nogroup:*::
";

const GSHADOW_UPPER_OLD: &str = "
root:*::
irc:*::
nogroup:*::
test:!::
";

const GSHADOW_LOWER_NEW: &str = "
root:*::
uucp:*::
irc:*::
nogroup:*::
";

const GSHADOW_EXPECT: &str = "
uucp:*::
root:*::
irc:*::
nogroup:*::
test:!::
";

const SHADOW_LOWER_OLD: &str = "
root::20248:0:99999:7:::
irc:*:20228:0:99999:7:::
nobody:*:20228:0:99999:7:::
";

const SHADOW_UPPER_OLD: &str = "
root::20248:0:99999:7:::
irc:*:20228:0:99999:7:::
nobody:*:20228:0:99999:7:::
test:$j$jjT$huf789w.$iojfw3897:20191:0:99999:7:::
";

const SHADOW_LOWER_NEW: &str = "
root::20248:0:99999:7:::
uucp:*:20228:0:99999:7:::
irc:*:20228:0:99999:7:::
nobody:*:20228:0:99999:7:::
";

const SHADOW_EXPECT: &str = "
nobody:*:20228:0:99999:7:::
test:$j$jjT$huf789w.$iojfw3897:20191:0:99999:7:::
uucp:*:20228:0:99999:7:::
root::20248:0:99999:7:::
irc:*:20228:0:99999:7:::
";

const SHELLS_LOWER_OLD: &str = "
# /etc/shells: valid login shells
/bin/sh
/usr/bin/sh
/bin/bash
";

const SHELLS_UPPER_OLD: &str = "
# /etc/shells: valid login shells
/bin/sh
/usr/bin/sh
/bin/bash
/usr/bin/fish
";

const SHELLS_LOWER_NEW: &str = "
# /etc/shells: valid login shells
/bin/sh
/usr/bin/sh
/bin/bash
/usr/bin/vso-os-shell
";

const SHELLS_EXPECT: &str = "
# /etc/shells: valid login shells
/bin/sh
/usr/bin/sh
/bin/bash
/usr/bin/fish
/usr/bin/vso-os-shell
";

fn write_identity_files(
    dir: &Path,
    passwd: &str,
    group: &str,
    gshadow: &str,
    shadow: &str,
    shells: &str,
) {
    fs::write(dir.join("passwd"), passwd).unwrap();
    fs::write(dir.join("group"), group).unwrap();
    fs::write(dir.join("gshadow"), gshadow).unwrap();
    fs::write(dir.join("shadow"), shadow).unwrap();
    fs::write(dir.join("shells"), shells).unwrap();
}

/// Four roots with the usual fixture: the old overlay carries a local user
/// `test` on top of the old base, the new base ships a new system user
/// `uucp`.
fn setup_environment(root: &Path) -> BuildRoots {
    let roots = BuildRoots {
        lower_old: root.join("lowerOld"),
        upper_old: root.join("upperOld"),
        lower_new: root.join("lowerNew"),
        upper_new: root.join("upperNew"),
    };

    for dir in [&roots.lower_old, &roots.upper_old, &roots.lower_new] {
        fs::create_dir_all(dir).unwrap();
    }

    write_identity_files(
        &roots.lower_old,
        PASSWD_LOWER_OLD,
        GROUP_LOWER_OLD,
        GSHADOW_LOWER_OLD,
        SHADOW_LOWER_OLD,
        SHELLS_LOWER_OLD,
    );
    write_identity_files(
        &roots.upper_old,
        PASSWD_UPPER_OLD,
        GROUP_UPPER_OLD,
        GSHADOW_UPPER_OLD,
        SHADOW_UPPER_OLD,
        SHELLS_UPPER_OLD,
    );
    write_identity_files(
        &roots.lower_new,
        PASSWD_LOWER_NEW,
        GROUP_LOWER_NEW,
        GSHADOW_LOWER_NEW,
        SHADOW_LOWER_NEW,
        SHELLS_LOWER_NEW,
    );

    roots
}

fn build(roots: &BuildRoots) {
    build_new_etc(roots, &HandlerRegistry::new()).unwrap();
}

fn mkdir_with_mode(path: &Path, mode: u32) {
    let mut created = PathBuf::new();
    for component in path.components() {
        created.push(component);
        if !created.exists() {
            fs::create_dir(&created).unwrap();
            fs::set_permissions(&created, fs::Permissions::from_mode(mode)).unwrap();
        }
    }
}

fn write_with_mode(path: &Path, content: &[u8], mode: u32) {
    fs::write(path, content).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

/// Line-set equality, ignoring order and surrounding whitespace.
fn assert_same_lines(actual: &str, expected: &str, what: &str) {
    let actual_set: BTreeSet<&str> = actual.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let expected_set: BTreeSet<&str> =
        expected.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    assert_eq!(actual_set, expected_set, "{what} did not get merged correctly");
}

#[test]
fn test_empty() {
    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());
    build(&roots);
}

#[test]
fn test_stale_target_is_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());

    let stale = roots.upper_new.join("some/path to/file/my file.abc");
    mkdir_with_mode(stale.parent().unwrap(), 0o777);
    fs::write(&stale, b"Some data").unwrap();

    build(&roots);

    assert!(
        !stale.parent().unwrap().exists(),
        "stale file was not removed"
    );
}

#[test]
fn test_user_file_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());

    let file_rel = "some/path to/file/my file.abc";
    let user_file = roots.upper_old.join(file_rel);
    mkdir_with_mode(user_file.parent().unwrap(), 0o751);
    write_with_mode(&user_file, b"Some data", 0o715);

    build(&roots);

    let copied = roots.upper_new.join(file_rel);
    assert_eq!(fs::read(&copied).unwrap(), b"Some data");
    let meta = fs::symlink_metadata(&copied).unwrap();
    assert_eq!(meta.mode() & 0o7777, 0o715, "file permissions don't match");

    let second_parent = copied.parent().unwrap().parent().unwrap();
    let dir_meta = fs::symlink_metadata(second_parent).unwrap();
    assert_eq!(
        dir_meta.mode() & 0o7777,
        0o751,
        "intermediate directory permissions don't match"
    );
}

#[test]
fn test_symlink_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());

    let file_rel = "some/path to/link/my link";
    let target = "../some/ra ndom/path";
    let user_link = roots.upper_old.join(file_rel);
    mkdir_with_mode(user_link.parent().unwrap(), 0o753);
    std::os::unix::fs::symlink(target, &user_link).unwrap();

    build(&roots);

    assert_eq!(
        fs::read_link(roots.upper_new.join(file_rel)).unwrap(),
        PathBuf::from(target)
    );
}

#[test]
fn test_special_files_merged() {
    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());

    build(&roots);

    let expectations = [
        ("passwd", PASSWD_EXPECT),
        ("group", GROUP_EXPECT),
        ("gshadow", GSHADOW_EXPECT),
        ("shadow", SHADOW_EXPECT),
        ("shells", SHELLS_EXPECT),
    ];
    for (name, expected) in expectations {
        let merged = fs::read_to_string(roots.upper_new.join(name)).unwrap();
        assert_same_lines(&merged, expected, name);
    }

    // local entries keep their numbering
    let passwd = PasswdFile::load(&roots.upper_new.join("passwd")).unwrap();
    assert_eq!(passwd.entries["test"].uid, 1000);
    assert_eq!(passwd.entries["test"].gid, 1000);
    assert_eq!(passwd.entries["uucp"].uid, 10);
    assert_eq!(passwd.entries["uucp"].gid, 10);

    let group = GroupFile::load(&roots.upper_new.join("group")).unwrap();
    assert_eq!(group.entries["test"].gid, 1000);
    assert_eq!(group.entries["uucp"].gid, 10);
}

#[test]
fn test_pristine_overlay_reduces_to_identity_files() {
    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());
    // no local customizations: the old overlay mirrors the old base
    write_identity_files(
        &roots.upper_old,
        PASSWD_LOWER_OLD,
        GROUP_LOWER_OLD,
        GSHADOW_LOWER_OLD,
        SHADOW_LOWER_OLD,
        SHELLS_LOWER_OLD,
    );

    build(&roots);

    let mut names: Vec<String> = fs::read_dir(&roots.upper_new)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["group", "gshadow", "passwd", "shadow", "shells"]);

    // each merged database covers exactly the new base's entries
    let merged = PasswdFile::load(&roots.upper_new.join("passwd")).unwrap();
    let incoming = PasswdFile::parse(PASSWD_LOWER_NEW);
    assert_eq!(merged.entries, incoming.entries);

    let merged = GroupFile::load(&roots.upper_new.join("group")).unwrap();
    let incoming = GroupFile::parse(GROUP_LOWER_NEW);
    assert_eq!(merged.entries, incoming.entries);
}

#[test]
fn test_char_special_roundtrip() {
    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("skipping test_char_special_roundtrip; requires root");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());

    let file_rel = "some/path to/link/my char special";
    let device = roots.upper_old.join(file_rel);
    mkdir_with_mode(device.parent().unwrap(), 0o753);
    nix::sys::stat::mknod(
        &device,
        nix::sys::stat::SFlag::S_IFCHR,
        nix::sys::stat::Mode::empty(),
        0,
    )
    .unwrap();

    build(&roots);

    let meta = fs::symlink_metadata(roots.upper_new.join(file_rel)).unwrap();
    assert_eq!(meta.mode(), 0o20000, "character special was not created correctly");
    assert_eq!(meta.rdev(), 0, "device number was not set correctly");
}

#[test]
fn test_cleanup_removes_identical_file() {
    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());

    let file_rel = "some/path to/file/my file.abc";
    for root in [&roots.upper_old, &roots.lower_new] {
        let file = root.join(file_rel);
        mkdir_with_mode(file.parent().unwrap(), 0o751);
        write_with_mode(&file, b"Some data", 0o715);
    }

    build(&roots);

    assert!(
        fs::symlink_metadata(roots.upper_new.join(file_rel)).is_err(),
        "identical file was not cleaned up"
    );
}

#[test]
fn test_cleanup_keeps_different_content() {
    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());

    let file_rel = "some/path to/file/my file.abc";
    let user_file = roots.upper_old.join(file_rel);
    mkdir_with_mode(user_file.parent().unwrap(), 0o751);
    write_with_mode(&user_file, b"Some data", 0o715);

    let base_file = roots.lower_new.join(file_rel);
    mkdir_with_mode(base_file.parent().unwrap(), 0o751);
    write_with_mode(&base_file, b"Some other data", 0o715);

    build(&roots);

    assert!(
        fs::symlink_metadata(roots.upper_new.join(file_rel)).is_ok(),
        "file was cleaned up even though it's not identical"
    );
}

#[test]
fn test_cleanup_keeps_different_mode() {
    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());

    let file_rel = "some/path to/file/my file.abc";
    let user_file = roots.upper_old.join(file_rel);
    mkdir_with_mode(user_file.parent().unwrap(), 0o751);
    write_with_mode(&user_file, b"Some data", 0o715);

    let base_file = roots.lower_new.join(file_rel);
    mkdir_with_mode(base_file.parent().unwrap(), 0o751);
    write_with_mode(&base_file, b"Some data", 0o777);

    build(&roots);

    assert!(
        fs::symlink_metadata(roots.upper_new.join(file_rel)).is_ok(),
        "file was cleaned up even though the attributes differ"
    );
}

#[test]
fn test_cleanup_symlinks() {
    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());

    let file_rel = "some/path to/file/my link";
    let user_link = roots.upper_old.join(file_rel);
    mkdir_with_mode(user_link.parent().unwrap(), 0o751);
    std::os::unix::fs::symlink("some/link", &user_link).unwrap();
    std::os::unix::fs::symlink("some/link", user_link.with_file_name("my link different"))
        .unwrap();

    let base_link = roots.lower_new.join(file_rel);
    mkdir_with_mode(base_link.parent().unwrap(), 0o751);
    std::os::unix::fs::symlink("some/link", &base_link).unwrap();
    std::os::unix::fs::symlink(
        "some/other/link",
        base_link.with_file_name("my link different"),
    )
    .unwrap();

    build(&roots);

    let copied = roots.upper_new.join(file_rel);
    assert!(
        fs::symlink_metadata(&copied).is_err(),
        "identical symlink was not cleaned up"
    );
    assert!(
        fs::symlink_metadata(copied.with_file_name("my link different")).is_ok(),
        "differing symlink was cleaned up"
    );
}

/// (kind tag, permission bits, payload) per relative path.
fn snapshot_tree(root: &Path) -> BTreeMap<String, (char, u32, Vec<u8>)> {
    let mut snapshot = BTreeMap::new();
    for entry in list_tree(root) {
        let rel = entry.strip_prefix(root).unwrap().to_string_lossy().into_owned();
        if rel.is_empty() {
            continue;
        }
        let meta = fs::symlink_metadata(&entry).unwrap();
        let perms = meta.mode() & 0o7777;
        let (tag, payload) = if meta.file_type().is_symlink() {
            ('l', fs::read_link(&entry).unwrap().to_string_lossy().into_owned().into_bytes())
        } else if meta.is_dir() {
            ('d', Vec::new())
        } else {
            ('f', fs::read(&entry).unwrap())
        };
        snapshot.insert(rel, (tag, perms, payload));
    }
    snapshot
}

fn list_tree(root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        paths.push(dir.clone());
        if dir.is_dir() && !fs::symlink_metadata(&dir).unwrap().file_type().is_symlink() {
            let mut children: Vec<PathBuf> = fs::read_dir(&dir)
                .unwrap()
                .map(|entry| entry.unwrap().path())
                .collect();
            children.sort();
            pending.extend(children);
        }
    }
    paths
}

#[test]
fn test_rebuild_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());

    let file_rel = "some/path to/file/my file.abc";
    let user_file = roots.upper_old.join(file_rel);
    mkdir_with_mode(user_file.parent().unwrap(), 0o751);
    write_with_mode(&user_file, b"Some data", 0o715);

    build(&roots);
    let first = snapshot_tree(&roots.upper_new);

    build(&roots);
    let second = snapshot_tree(&roots.upper_new);

    assert_eq!(first, second);
}

struct UppercaseHandler;

impl FileHandler for UppercaseHandler {
    fn supports(&self, path: &Path) -> bool {
        path.to_string_lossy().ends_with("handled.txt")
    }

    fn handle(&self, relative_path: &Path, roots: &BuildRoots) -> anyhow::Result<()> {
        let content = fs::read_to_string(roots.upper_old.join(relative_path))?;
        fs::write(roots.upper_new.join(relative_path), content.to_uppercase())?;
        Ok(())
    }
}

#[test]
fn test_handler_intercepts_default_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let roots = setup_environment(dir.path());
    fs::write(roots.upper_old.join("handled.txt"), "quiet").unwrap();

    let handlers = HandlerRegistry::with_handlers(vec![Box::new(UppercaseHandler)]);
    build_new_etc(&roots, &handlers).unwrap();

    assert_eq!(
        fs::read_to_string(roots.upper_new.join("handled.txt")).unwrap(),
        "QUIET"
    );
}
