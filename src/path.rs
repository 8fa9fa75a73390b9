//! Component B: filesystem info and path normalization.

use crate::error::{Error, ErrorKind, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_REDIRECTS: usize = 25;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum System {
    Posix,
    Windows,
}

impl System {
    #[cfg(windows)]
    pub const NATIVE: System = System::Windows;
    #[cfg(not(windows))]
    pub const NATIVE: System = System::Posix;

    fn sep(self) -> char {
        match self {
            System::Windows => '\\',
            System::Posix => '/',
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NormalizeFlags {
    pub absolute: bool,
    pub follow_symlinks: bool,
    pub no_parent: bool,
    pub home: bool,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Pipe,
    Other,
}

#[derive(Clone, Debug)]
pub struct PathInfo {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub birthtime: Option<SystemTime>,
    pub is_symlink: bool,
    pub hidden: bool,
}

/// `true` for any name starting with `.` other than `.`/`..`.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != ".."
}

#[derive(Clone, Copy, Debug, Default)]
pub struct InfoFlags {
    pub follow_symlinks: bool,
    pub basic_only: bool,
}

/// Split `path` into its non-separator components, converting separators to
/// `sys`'s native separator first. A leading empty component marks an
/// absolute path (POSIX root, or the first segment of a UNC path).
fn componentize(path: &str, sys: System) -> Vec<String> {
    let converted: String = path
        .chars()
        .map(|c| {
            if sys == System::Windows && c == '/' {
                sys.sep()
            } else {
                c
            }
        })
        .collect();

    let sep = sys.sep();
    let is_abs = converted.starts_with(sep);
    let mut parts: Vec<String> = converted
        .split(sep)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();
    if is_abs {
        parts.insert(0, String::new());
    }
    parts
}

fn join_parts(parts: &[String], sys: System) -> String {
    if parts.is_empty() {
        return String::new();
    }
    if parts[0].is_empty() {
        let sep = sys.sep();
        if parts.len() == 1 {
            return sep.to_string();
        }
        format!("{}{}", sep, parts[1..].join(&sep.to_string()))
    } else {
        parts.join(&sys.sep().to_string())
    }
}

fn expand_env_vars(parts: &mut Vec<String>) -> Result<()> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts.drain(..) {
        let var_name = if let Some(stripped) = part.strip_prefix('$') {
            Some(stripped.to_owned())
        } else if part.len() >= 2 && part.starts_with('%') && part.ends_with('%') {
            Some(part[1..part.len() - 1].to_owned())
        } else {
            out.push(part);
            continue;
        };

        let Some(name) = var_name else { continue };
        if name.is_empty() {
            continue;
        }
        let value = std::env::var(&name).map_err(|_| Error::new(ErrorKind::Invalid))?;
        if !value.is_empty() {
            out.push(value);
        }
    }
    *parts = out;
    Ok(())
}

fn expand_home(parts: &mut Vec<String>, sys: System) -> Result<()> {
    if parts.first().map(String::as_str) != Some("~") {
        return Ok(());
    }
    let home = home_dir().ok_or_else(|| Error::new(ErrorKind::Invalid))?;
    parts.remove(0);
    let mut home_parts = componentize(&home.to_string_lossy(), sys);
    home_parts.append(parts);
    *parts = home_parts;
    Ok(())
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    if let Ok(h) = std::env::var("HOME") {
        if !h.is_empty() {
            return Some(PathBuf::from(h));
        }
    }
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.dir)
}

#[cfg(not(unix))]
fn home_dir() -> Option<PathBuf> {
    std::env::var("USERPROFILE").ok().map(PathBuf::from)
}

fn make_absolute(parts: &mut Vec<String>, sys: System) -> Result<()> {
    if parts.first().map(String::as_str) == Some("") {
        return Ok(());
    }
    let cwd = std::env::current_dir().map_err(Error::from)?;
    let mut cwd_parts = componentize(&cwd.to_string_lossy(), sys);
    cwd_parts.append(parts);
    *parts = cwd_parts;
    Ok(())
}

fn remove_parent(base: &mut Vec<String>) {
    match base.last().map(String::as_str) {
        None => base.push("..".to_owned()),
        Some("") => {}
        Some("..") => base.push("..".to_owned()),
        Some(_) => {
            base.pop();
        }
    }
}

fn normalize_int(
    path: &str,
    flags: NormalizeFlags,
    sys: System,
    seen: &mut HashSet<String>,
) -> Result<String> {
    if path.is_empty() {
        return Err(Error::new(ErrorKind::Invalid));
    }
    if seen.len() >= MAX_REDIRECTS || seen.contains(path) {
        return Err(Error::new(ErrorKind::LinkLoop));
    }
    seen.insert(path.to_owned());

    let mut parts = componentize(path, sys);
    expand_env_vars(&mut parts)?;
    if flags.home {
        expand_home(&mut parts, sys)?;
    }
    if flags.absolute {
        make_absolute(&mut parts, sys)?;
    }

    let mut base: Vec<String> = Vec::new();
    let mut remaining: Vec<String> = parts.into_iter().rev().collect();
    while let Some(part) = remaining.pop() {
        if !flags.no_parent && part == ".." {
            remove_parent(&mut base);
        } else if part != "." {
            base.push(part);
            if flags.follow_symlinks {
                let candidate = join_parts(&base, sys);
                let target = std::fs::read_link(&candidate);
                if let Ok(target) = target {
                    let target_str = target.to_string_lossy().into_owned();
                    if componentize(&target_str, sys)
                        .first()
                        .map(String::as_str)
                        == Some("")
                    {
                        base.clear();
                    } else {
                        base.pop();
                    }
                    let mut new_parts = componentize(&target_str, sys);
                    new_parts.extend(base.drain(..).collect::<Vec<_>>());
                    new_parts.extend(remaining.drain(..).rev());
                    let rejoined = join_parts(&new_parts, sys);
                    return normalize_int(&rejoined, flags, sys, seen);
                }
            }
        }
    }

    if base.is_empty() {
        return Ok(".".to_owned());
    }
    Ok(join_parts(&base, sys))
}

/// Normalize `path` per §4.B. `flags.absolute` additionally requires
/// `flags.home` to have already expanded `~` if present.
pub fn normalize(path: &str, flags: NormalizeFlags, sys: System) -> Result<String> {
    let mut seen = HashSet::new();
    normalize_int(path, flags, sys, &mut seen)
}

pub fn info(path: &Path, flags: InfoFlags) -> Result<PathInfo> {
    let meta = if flags.follow_symlinks {
        std::fs::metadata(path)
    } else {
        std::fs::symlink_metadata(path)
    }
    .map_err(Error::from)?;

    let is_symlink = meta.file_type().is_symlink();
    let kind = if meta.is_dir() {
        EntryKind::Directory
    } else if is_symlink {
        EntryKind::Symlink
    } else if is_fifo(&meta) {
        EntryKind::Pipe
    } else if meta.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    let (mode, owner, group) = if flags.basic_only {
        (None, None, None)
    } else {
        mode_and_owner(&meta)
    };

    let (atime, ctime) = extra_times(&meta);
    let hidden = path
        .file_name()
        .map(|n| is_hidden(&n.to_string_lossy()))
        .unwrap_or(false);

    Ok(PathInfo {
        kind,
        size: meta.len(),
        mode,
        owner,
        group,
        atime,
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        ctime,
        birthtime: meta.created().ok(),
        is_symlink,
        hidden,
    })
}

#[cfg(unix)]
fn extra_times(meta: &std::fs::Metadata) -> (SystemTime, SystemTime) {
    use std::os::unix::fs::MetadataExt;
    use std::time::Duration;
    let atime = UNIX_EPOCH + Duration::from_secs(meta.atime().max(0) as u64);
    let ctime = UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64);
    (atime, ctime)
}

#[cfg(not(unix))]
fn extra_times(meta: &std::fs::Metadata) -> (SystemTime, SystemTime) {
    let t = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    (t, t)
}

#[cfg(unix)]
fn is_fifo(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_meta: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn mode_and_owner(meta: &std::fs::Metadata) -> (Option<u32>, Option<String>, Option<String>) {
    use std::os::unix::fs::MetadataExt;
    let mode = Some(meta.mode());
    let owner = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(meta.uid()))
        .ok()
        .flatten()
        .map(|u| u.name);
    let group = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(meta.gid()))
        .ok()
        .flatten()
        .map(|g| g.name);
    (mode, owner, group)
}

#[cfg(not(unix))]
fn mode_and_owner(_meta: &std::fs::Metadata) -> (Option<u32>, Option<String>, Option<String>) {
    (None, None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_dot_and_resolves_dotdot() {
        let out = normalize("/a/./b/../c", NormalizeFlags::default(), System::Posix).unwrap();
        assert_eq!(out, "/a/c");
    }

    #[test]
    fn normalize_is_idempotent() {
        let flags = NormalizeFlags::default();
        let once = normalize("/a/./b/../c/", flags, System::Posix).unwrap();
        let twice = normalize(&once, flags, System::Posix).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_empty_result_means_cwd() {
        let out = normalize(".", NormalizeFlags::default(), System::Posix).unwrap();
        assert_eq!(out, ".");
    }

    #[test]
    fn normalize_no_parent_keeps_dotdot() {
        let flags = NormalizeFlags {
            no_parent: true,
            ..Default::default()
        };
        let out = normalize("/a/../b", flags, System::Posix).unwrap();
        assert_eq!(out, "/a/../b");
    }

    #[test]
    fn normalize_expands_dollar_env_var() {
        // SAFETY: test runs single-threaded w.r.t. this var.
        unsafe { std::env::set_var("MFOUND_TEST_VAR", "xyz") };
        let out = normalize("$MFOUND_TEST_VAR/a", NormalizeFlags::default(), System::Posix).unwrap();
        assert_eq!(out, "xyz/a");
        unsafe { std::env::remove_var("MFOUND_TEST_VAR") };
    }

    #[test]
    fn info_reports_directory_kind() {
        let dir = tempfile::tempdir().unwrap();
        let info = info(dir.path(), InfoFlags::default()).unwrap();
        assert_eq!(info.kind, EntryKind::Directory);
    }

    #[test]
    fn info_basic_only_skips_owner() {
        let dir = tempfile::tempdir().unwrap();
        let flags = InfoFlags {
            basic_only: true,
            ..Default::default()
        };
        let info = info(dir.path(), flags).unwrap();
        assert!(info.owner.is_none());
        assert!(info.mode.is_none());
    }
}
