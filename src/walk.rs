//! Component D: symlink-safe recursive directory walking with jailing,
//! dedup, and glob filename filtering.

use crate::error::{Error, ErrorKind, Result};
use crate::path::{self, EntryKind, InfoFlags, NormalizeFlags, PathInfo, System, is_hidden};
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Default)]
pub struct WalkFilter {
    pub files: bool,
    pub dirs: bool,
    pub pipes: bool,
    pub symlinks: bool,
    pub recurse: bool,
    pub hidden: bool,
    pub case_insensitive: bool,
    pub follow_symlinks: bool,
    pub as_set: bool,
    pub jail_fail: bool,
    pub jail_skip: bool,
    pub read_info_basic: bool,
    pub read_info_full: bool,
}

impl WalkFilter {
    fn wants(&self, kind: EntryKind) -> bool {
        match kind {
            EntryKind::File => self.files,
            EntryKind::Directory => self.dirs,
            EntryKind::Pipe => self.pipes,
            EntryKind::Symlink => self.symlinks,
            EntryKind::Other => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WalkEntry {
    pub name: PathBuf,
    pub kind: EntryKind,
    pub hidden: bool,
    pub resolved_symlink: Option<PathBuf>,
    pub info: Option<PathInfo>,
}

/// Compile a shell-style glob (`*`, `?`, `[...]`) into an anchored regex
/// matched against the filename only, never the full path.
fn compile_glob(pattern: &str, case_insensitive: bool) -> Result<Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                for c2 in chars.by_ref() {
                    out.push(c2);
                    if c2 == ']' {
                        break;
                    }
                }
            }
            _ => {
                if "\\.+^$()|{}".contains(c) {
                    out.push('\\');
                }
                out.push(c);
            }
        }
    }
    out.push('$');
    RegexBuilder::new(&out)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|_| Error::new(ErrorKind::Invalid))
}

struct Walker<'a> {
    base_path: PathBuf,
    pattern: Regex,
    filter: WalkFilter,
    visited: HashSet<PathBuf>,
    traversed: HashSet<PathBuf>,
    cb: &'a mut dyn FnMut(&Path, Result<WalkEntry>) -> bool,
}

fn norm_abs(p: &Path) -> Result<PathBuf> {
    let flags = NormalizeFlags {
        absolute: true,
        ..Default::default()
    };
    path::normalize(&p.to_string_lossy(), flags, System::NATIVE).map(PathBuf::from)
}

impl<'a> Walker<'a> {
    fn entry_info(&self, full_path: &Path, kind: EntryKind) -> Option<PathInfo> {
        if !(self.filter.read_info_basic || self.filter.read_info_full) {
            return None;
        }
        let info_flags = InfoFlags {
            follow_symlinks: kind != EntryKind::Symlink,
            basic_only: !self.filter.read_info_full,
        };
        path::info(full_path, info_flags).ok()
    }

    fn build_entry(&self, full_path: &Path, rel: &Path, kind: EntryKind) -> WalkEntry {
        let name = full_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let resolved_symlink = if kind == EntryKind::Symlink {
            std::fs::read_link(full_path).ok()
        } else {
            None
        };
        WalkEntry {
            name: rel.to_path_buf(),
            kind,
            hidden: is_hidden(&name),
            resolved_symlink,
            info: self.entry_info(full_path, kind),
        }
    }

    /// Process one directory entry; `path`/`prefix` split mirrors the
    /// upstream convention where the full location is `path/prefix/name`.
    fn create_entry(&mut self, path: &Path, prefix: &Path, name: &str, kind_hint: Option<EntryKind>) -> bool {
        let full_dir = path.join(prefix);
        let full_path = full_dir.join(name);
        let rel = prefix.join(name);

        let norm_path = match norm_abs(&full_path) {
            Ok(p) => p,
            Err(_) => return true,
        };
        if (self.filter.jail_fail || self.filter.jail_skip) && !norm_path.starts_with(&self.base_path) {
            return !self.filter.jail_fail;
        }

        let kind = match kind_hint {
            Some(k) => k,
            None => match path::info(&full_path, InfoFlags { follow_symlinks: false, basic_only: true }) {
                Ok(i) => i.kind,
                Err(_) => return true,
            },
        };

        if name == "." || name == ".." {
            return true;
        }
        if is_hidden(name) && !self.filter.hidden {
            return true;
        }
        if self.filter.wants(kind) && !self.pattern.is_match(name) {
            return true;
        }

        if kind == EntryKind::Symlink && self.filter.follow_symlinks {
            if let Ok(target) = std::fs::read_link(&full_path) {
                let resolved = if target.is_absolute() {
                    target
                } else {
                    full_path.parent().unwrap_or(Path::new("")).join(target)
                };
                if let Ok(norm_target) = norm_abs(&resolved) {
                    if !self.traversed.contains(&norm_target) {
                        self.traversed.insert(norm_target.clone());
                        let (parent, leaf) = match (norm_target.parent(), norm_target.file_name()) {
                            (Some(p), Some(n)) => (p.to_path_buf(), n.to_string_lossy().into_owned()),
                            _ => (norm_target.clone(), String::new()),
                        };
                        if !leaf.is_empty() {
                            let kind = path::info(&norm_target, InfoFlags { follow_symlinks: false, basic_only: true })
                                .map(|i| i.kind)
                                .ok();
                            if !self.create_entry(&parent, Path::new(""), &leaf, kind) {
                                return false;
                            }
                        }
                    }
                }
            }
        }

        if kind == EntryKind::Directory && self.filter.recurse {
            match self.walk_dir(path, &rel) {
                WalkDirOutcome::InSet => return true,
                WalkDirOutcome::Fail => return false,
                WalkDirOutcome::Ok => {}
            }
        }

        if !self.filter.wants(kind) {
            return true;
        }

        if kind != EntryKind::Directory && self.filter.as_set {
            let key = full_dir.join(&rel);
            if let Ok(norm) = norm_abs(&key) {
                if !self.visited.insert(norm) {
                    return true;
                }
            }
        }

        let entry = self.build_entry(&full_path, &rel, kind);
        (self.cb)(path, Ok(entry))
    }

    fn walk_dir(&mut self, path: &Path, prefix: &Path) -> WalkDirOutcome {
        let full_path = path.join(prefix);
        let norm_path = match norm_abs(&full_path) {
            Ok(p) => p,
            Err(_) => return WalkDirOutcome::Fail,
        };

        if self.visited.contains(&norm_path) {
            if self.filter.as_set {
                return WalkDirOutcome::InSet;
            }
            let cont = (self.cb)(path, Err(Error::with_path(ErrorKind::LinkLoop, norm_path)));
            return if cont { WalkDirOutcome::Ok } else { WalkDirOutcome::Fail };
        }

        self.visited.insert(norm_path.clone());

        let read_dir = match std::fs::read_dir(&norm_path) {
            Ok(rd) => rd,
            Err(_) => {
                if !self.filter.as_set {
                    self.visited.remove(&norm_path);
                }
                return WalkDirOutcome::Fail;
            }
        };

        let mut ok = true;
        for entry in read_dir {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.create_entry(path, prefix, &name, None) {
                ok = false;
                break;
            }
        }

        if !self.filter.as_set {
            self.visited.remove(&norm_path);
        }

        if ok {
            WalkDirOutcome::Ok
        } else {
            WalkDirOutcome::Fail
        }
    }
}

enum WalkDirOutcome {
    Ok,
    Fail,
    InSet,
}

/// Walk `root`, invoking `cb(dir, entry_result)` for every matched entry.
/// Returning `false` from `cb` stops the walk early. `pattern` is matched
/// against the filename only (never the full path); an empty pattern
/// matches everything.
pub fn walk(root: &Path, pattern: &str, filter: WalkFilter, mut cb: impl FnMut(&Path, Result<WalkEntry>) -> bool) -> Result<()> {
    let norm_root = norm_abs(root)?;
    let pat = if pattern.is_empty() { "*" } else { pattern };
    let regex = compile_glob(pat, filter.case_insensitive)?;

    let mut walker = Walker {
        base_path: norm_root.clone(),
        pattern: regex,
        filter,
        visited: HashSet::new(),
        traversed: HashSet::new(),
        cb: &mut cb,
    };

    walker.walk_dir(&norm_root, Path::new(""));
    Ok(())
}

/// Convenience wrapper collecting all matched entries into a `Vec`.
pub fn walk_entries(root: &Path, pattern: &str, filter: WalkFilter) -> Result<Vec<WalkEntry>> {
    let mut out = Vec::new();
    walk(root, pattern, filter, |_path, res| {
        if let Ok(entry) = res {
            out.push(entry);
        }
        true
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn base_filter() -> WalkFilter {
        WalkFilter {
            files: true,
            dirs: true,
            recurse: true,
            ..Default::default()
        }
    }

    #[test]
    fn walk_collects_files_matching_glob() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        fs::write(dir.path().join("b.log"), b"x").unwrap();

        let entries = walk_entries(dir.path(), "*.txt", base_filter()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name.file_name().unwrap(), "a.txt");
    }

    #[test]
    fn walk_recurses_into_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c.txt"), b"x").unwrap();

        let entries = walk_entries(dir.path(), "*.txt", base_filter()).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn walk_skips_hidden_unless_requested() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden"), b"x").unwrap();
        fs::write(dir.path().join("visible"), b"x").unwrap();

        let entries = walk_entries(dir.path(), "*", base_filter()).unwrap();
        assert!(entries.iter().all(|e| e.name.file_name().unwrap() != ".hidden"));

        let mut with_hidden = base_filter();
        with_hidden.hidden = true;
        let entries = walk_entries(dir.path(), "*", with_hidden).unwrap();
        assert!(entries.iter().any(|e| e.name.file_name().unwrap() == ".hidden"));
    }

    #[test]
    fn jail_skip_excludes_escaping_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), b"x").unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
            let mut filter = base_filter();
            filter.symlinks = true;
            filter.jail_skip = true;
            let entries = walk_entries(dir.path(), "*", filter).unwrap();
            assert!(entries.iter().all(|e| e.name.to_string_lossy() != "secret.txt"));
        }
    }
}
