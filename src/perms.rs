//! Component A: portable permissions model.
//!
//! A `Perms` carries, per who-bucket (user/group/other), an optional base
//! mode triple and an optional directory-override triple, plus optional
//! named user/group identities. `merge` and `apply` implement the
//! exact/add/remove algebra; `apply` additionally resolves names to
//! platform identities and writes them back (`chown`/DACL).

use crate::error::{Error, ErrorKind, Result};
use std::path::Path;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Who {
    User,
    Group,
    Other,
}

const ALL_WHO: [Who; 3] = [Who::User, Who::Group, Who::Other];

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ModeType {
    Exact,
    Add,
    Remove,
}

/// Read/write/execute bits for a single who-bucket, mstdlib-style (not
/// raw POSIX mode bits shifted per-who; just the 3 rwx bits for this who).
pub const MODE_READ: u8 = 0b100;
pub const MODE_WRITE: u8 = 0b010;
pub const MODE_EXEC: u8 = 0b001;
pub const MODE_NONE: u8 = 0;

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    set: bool,
    mode: u8,
    kind_add: bool,    // only meaningful when set
    kind_remove: bool, // both false => Exact
}

impl Slot {
    fn kind(&self) -> ModeType {
        if self.kind_add {
            ModeType::Add
        } else if self.kind_remove {
            ModeType::Remove
        } else {
            ModeType::Exact
        }
    }

    fn set(&mut self, mode: u8, kind: ModeType) {
        self.set = true;
        self.mode = mode;
        self.kind_add = kind == ModeType::Add;
        self.kind_remove = kind == ModeType::Remove;
    }

    fn unset(&mut self) {
        *self = Slot::default();
    }

    /// `M_fs_perms_merge_part`: merge `src` into `self` in place.
    fn merge_from(&mut self, src: &Slot) {
        if !src.set {
            return;
        }
        if self.set && self.kind() == ModeType::Exact && src.kind() != ModeType::Exact {
            match src.kind() {
                ModeType::Add => self.mode |= src.mode,
                ModeType::Remove => self.mode &= !src.mode,
                ModeType::Exact => unreachable!(),
            }
        } else {
            self.mode = src.mode;
            self.kind_add = src.kind_add;
            self.kind_remove = src.kind_remove;
        }
        self.set = true;
    }
}

#[derive(Clone, Debug, Default)]
pub struct Perms {
    base: [Slot; 3],
    dir: [Slot; 3],
    user_name: Option<String>,
    group_name: Option<String>,
}

fn idx(who: Who) -> usize {
    match who {
        Who::User => 0,
        Who::Group => 1,
        Who::Other => 2,
    }
}

#[cfg(unix)]
fn user_exists(name: &str) -> Result<()> {
    nix::unistd::User::from_name(name)
        .map_err(Error::from)?
        .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
    Ok(())
}

#[cfg(unix)]
fn group_exists(name: &str) -> Result<()> {
    nix::unistd::Group::from_name(name)
        .map_err(Error::from)?
        .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
    Ok(())
}

#[cfg(windows)]
fn account_exists(name: &str) -> Result<()> {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Security::LookupAccountNameW;

    let wide: Vec<u16> = std::ffi::OsStr::new(name)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    let mut sid_size: u32 = 0;
    let mut domain_size: u32 = 0;
    let mut sid_use: i32 = 0;
    unsafe {
        LookupAccountNameW(
            std::ptr::null(),
            wide.as_ptr(),
            std::ptr::null_mut(),
            &mut sid_size,
            std::ptr::null_mut(),
            &mut domain_size,
            &mut sid_use,
        );
    }
    if sid_size == 0 {
        return Err(Error::new(ErrorKind::NotFound));
    }
    Ok(())
}

#[cfg(windows)]
fn user_exists(name: &str) -> Result<()> {
    account_exists(name)
}

#[cfg(windows)]
fn group_exists(name: &str) -> Result<()> {
    account_exists(name)
}

impl Perms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, who: Who, mode: u8, kind: ModeType) {
        self.base[idx(who)].set(mode, kind);
    }

    pub fn set_dir_mode(&mut self, who: Who, mode: u8, kind: ModeType) {
        self.dir[idx(who)].set(mode, kind);
    }

    pub fn unset_mode(&mut self, who: Who) {
        self.base[idx(who)].unset();
        self.dir[idx(who)].unset();
    }

    pub fn mode(&self, who: Who) -> u8 {
        self.base[idx(who)].mode
    }

    pub fn is_set(&self, who: Who) -> bool {
        self.base[idx(who)].set
    }

    /// Resolve `name` to a platform identity before storing it: failure
    /// leaves the prior value intact rather than deferring the error to
    /// `apply`.
    pub fn set_user(&mut self, name: Option<&str>) -> Result<()> {
        match name {
            None | Some("") => {
                self.user_name = None;
                Ok(())
            }
            Some(n) => {
                user_exists(n)?;
                self.user_name = Some(n.to_owned());
                Ok(())
            }
        }
    }

    pub fn set_group(&mut self, name: Option<&str>) -> Result<()> {
        match name {
            None | Some("") => {
                self.group_name = None;
                Ok(())
            }
            Some(n) => {
                group_exists(n)?;
                self.group_name = Some(n.to_owned());
                Ok(())
            }
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    pub fn group(&self) -> Option<&str> {
        self.group_name.as_deref()
    }

    /// Merge `src` into `self`: named identities in `src`, if set, replace
    /// those in `self`; mode slots merge via the exact/add/remove algebra.
    pub fn merge(&mut self, src: &Perms) {
        if src.user_name.is_some() {
            self.user_name = src.user_name.clone();
        }
        if src.group_name.is_some() {
            self.group_name = src.group_name.clone();
        }
        for w in ALL_WHO {
            self.base[idx(w)].merge_from(&src.base[idx(w)]);
            self.dir[idx(w)].merge_from(&src.dir[idx(w)]);
        }
    }

    /// Compute the new mode bits for `current` applied over `who`, given
    /// whether the target is a directory. `None` means this who has no
    /// applicable slot and should be left untouched.
    fn compute_who_bits(&self, who: Who, is_dir: bool, current_bits: u8) -> Option<u8> {
        let chosen = if is_dir && self.dir[idx(who)].set {
            &self.dir[idx(who)]
        } else if self.base[idx(who)].set {
            &self.base[idx(who)]
        } else {
            return None;
        };

        Some(match chosen.kind() {
            ModeType::Exact => chosen.mode,
            ModeType::Add => current_bits | chosen.mode,
            ModeType::Remove => current_bits & !chosen.mode,
        })
    }

    /// Compute a full POSIX mode (owner/group/other rwx in the low 9 bits,
    /// preserving any higher bits of `current_mode` such as setuid/sticky)
    /// for `path`'s current mode, per §4.A's mode-computation algorithm.
    pub fn compute_mode(&self, current_mode: u32, is_dir: bool) -> u32 {
        let mut mode = current_mode;
        for (who, shift) in [(Who::User, 6), (Who::Group, 3), (Who::Other, 0)] {
            let current_bits = ((mode >> shift) & 0b111) as u8;
            if let Some(bits) = self.compute_who_bits(who, is_dir, current_bits) {
                mode &= !(0b111 << shift);
                mode |= (bits as u32) << shift;
            }
        }
        mode
    }

    pub fn can_access(path: &Path, mask: u8) -> bool {
        if mask == MODE_NONE {
            return path.exists();
        }
        #[cfg(unix)]
        {
            use nix::unistd::{AccessFlags, access};
            let mut flags = AccessFlags::empty();
            if mask & MODE_READ != 0 {
                flags |= AccessFlags::R_OK;
            }
            if mask & MODE_WRITE != 0 {
                flags |= AccessFlags::W_OK;
            }
            if mask & MODE_EXEC != 0 {
                flags |= AccessFlags::X_OK;
            }
            access(path, flags).is_ok()
        }
        #[cfg(not(unix))]
        {
            path.exists()
        }
    }
}

#[cfg(unix)]
mod unix_apply {
    use super::*;
    use nix::sys::stat::Mode;
    use nix::unistd::{Gid, Group, Uid, User, chown};
    use std::os::unix::fs::PermissionsExt;

    impl Perms {
        pub fn apply(&self, path: &Path) -> Result<()> {
            let meta = std::fs::symlink_metadata(path).map_err(Error::from)?;
            let is_dir = meta.is_dir();
            let current_mode = meta.permissions().mode();
            let new_mode = self.compute_mode(current_mode, is_dir);
            if new_mode != current_mode {
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(new_mode))
                    .map_err(Error::from)?;
            }
            self.apply_ownership(path)
        }

        fn apply_ownership(&self, path: &Path) -> Result<()> {
            if self.user_name.is_none() && self.group_name.is_none() {
                return Ok(());
            }
            let uid: Option<Uid> = match &self.user_name {
                Some(name) => Some(
                    User::from_name(name)
                        .map_err(Error::from)?
                        .ok_or_else(|| Error::with_path(ErrorKind::NotFound, path))?
                        .uid,
                ),
                None => None,
            };
            let gid: Option<Gid> = match &self.group_name {
                Some(name) => Some(
                    Group::from_name(name)
                        .map_err(Error::from)?
                        .ok_or_else(|| Error::with_path(ErrorKind::NotFound, path))?
                        .gid,
                ),
                None => None,
            };
            chown(path, uid, gid).map_err(Error::from)
        }

        pub fn apply_to_open_file(&self, fd: std::os::fd::BorrowedFd<'_>) -> Result<()> {
            let meta = nix::sys::stat::fstat(fd).map_err(Error::from)?;
            let is_dir = (meta.st_mode & libc::S_IFMT) == libc::S_IFDIR;
            let new_mode = self.compute_mode(meta.st_mode, is_dir);
            if new_mode != meta.st_mode {
                nix::sys::stat::fchmod(fd, Mode::from_bits_truncate(new_mode & 0o7777))
                    .map_err(Error::from)?;
            }
            if self.user_name.is_some() || self.group_name.is_some() {
                let uid = match &self.user_name {
                    Some(name) => Some(
                        User::from_name(name)
                            .map_err(Error::from)?
                            .ok_or_else(|| Error::new(ErrorKind::NotFound))?
                            .uid,
                    ),
                    None => None,
                };
                let gid = match &self.group_name {
                    Some(name) => Some(
                        Group::from_name(name)
                            .map_err(Error::from)?
                            .ok_or_else(|| Error::new(ErrorKind::NotFound))?
                            .gid,
                    ),
                    None => None,
                };
                nix::unistd::fchown(fd, uid, gid).map_err(Error::from)?;
            }
            Ok(())
        }
    }
}

/// Windows back end: mode bits map onto an explicit three-entry DACL
/// (user, group, Everyone) instead of POSIX rwx bits. `None` means a NULL
/// DACL (grant all); `Some(vec![])` means an explicit empty DACL (deny
/// all) — these are never to be confused.
#[cfg(windows)]
mod windows_apply {
    use super::*;
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Foundation::{GENERIC_READ, GENERIC_WRITE, HLOCAL, LocalFree};
    use windows_sys::Win32::Security::Authorization::{
        EXPLICIT_ACCESS_W, SE_FILE_OBJECT, SET_ACCESS, SetEntriesInAclW, SetNamedSecurityInfoW,
        TRUSTEE_IS_SID, TRUSTEE_IS_USER, TRUSTEE_W,
    };
    use windows_sys::Win32::Security::{
        DACL_SECURITY_INFORMATION, DELETE, READ_CONTROL, WRITE_DAC, WRITE_OWNER,
    };
    use windows_sys::Win32::Storage::FileSystem::{
        FILE_GENERIC_EXECUTE, FILE_GENERIC_READ, FILE_GENERIC_WRITE, GENERIC_EXECUTE,
    };

    const OWNER_RIGHTS: u32 = WRITE_DAC | READ_CONTROL | WRITE_OWNER | DELETE;

    fn rights_for(mode: u8) -> u32 {
        let mut rights = 0u32;
        if mode & MODE_READ != 0 {
            rights |= GENERIC_READ | FILE_GENERIC_READ;
        }
        if mode & MODE_WRITE != 0 {
            rights |= GENERIC_WRITE | FILE_GENERIC_WRITE;
        }
        if mode & MODE_EXEC != 0 {
            rights |= GENERIC_EXECUTE | FILE_GENERIC_EXECUTE;
        }
        rights
    }

    fn wide(s: &str) -> Vec<u16> {
        std::ffi::OsStr::new(s)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }

    impl Perms {
        /// Build the three explicit-access entries (user, group, Everyone)
        /// for the computed mode, or `None` if nothing in this `Perms` is
        /// set (meaning: leave the existing DACL alone).
        fn explicit_entries(&self, is_dir: bool) -> Option<Vec<(String, u32)>> {
            let mut entries = Vec::new();
            for (who, sid_account) in [
                (Who::User, self.user_name.clone().unwrap_or_default()),
                (Who::Group, self.group_name.clone().unwrap_or_default()),
                (Who::Other, "Everyone".to_owned()),
            ] {
                let slot_set = if is_dir {
                    self.dir[idx(who)].set || self.base[idx(who)].set
                } else {
                    self.base[idx(who)].set
                };
                if !slot_set {
                    continue;
                }
                let bits = self.compute_who_bits(who, is_dir, 0).unwrap_or(0);
                let mut rights = rights_for(bits);
                if matches!(who, Who::User) {
                    rights |= OWNER_RIGHTS;
                }
                let account = if sid_account.is_empty() {
                    "Everyone".to_owned()
                } else {
                    sid_account
                };
                entries.push((account, rights));
            }
            if entries.is_empty() { None } else { Some(entries) }
        }

        pub fn apply(&self, path: &Path) -> Result<()> {
            let is_dir = path.is_dir();
            let Some(entries) = self.explicit_entries(is_dir) else {
                return Ok(());
            };

            let mut trustee_names: Vec<Vec<u16>> =
                entries.iter().map(|(name, _)| wide(name)).collect();
            let ea: Vec<EXPLICIT_ACCESS_W> = entries
                .iter()
                .zip(trustee_names.iter_mut())
                .map(|((_, rights), name)| unsafe {
                    let mut trustee: TRUSTEE_W = std::mem::zeroed();
                    trustee.TrusteeForm = TRUSTEE_IS_USER;
                    trustee.TrusteeType = TRUSTEE_IS_SID;
                    trustee.ptstrName = name.as_mut_ptr();
                    EXPLICIT_ACCESS_W {
                        grfAccessPermissions: *rights,
                        grfAccessMode: SET_ACCESS,
                        grfInheritance: 0,
                        Trustee: trustee,
                    }
                })
                .collect();

            let mut new_acl: *mut std::ffi::c_void = std::ptr::null_mut();
            let status = unsafe {
                SetEntriesInAclW(ea.len() as u32, ea.as_ptr(), std::ptr::null_mut(), &mut new_acl as *mut _ as *mut _)
            };
            if status != 0 || new_acl.is_null() {
                return Err(Error::with_path(ErrorKind::Generic, path));
            }

            let mut wpath = wide(&path.to_string_lossy());
            let result = unsafe {
                SetNamedSecurityInfoW(
                    wpath.as_mut_ptr(),
                    SE_FILE_OBJECT,
                    DACL_SECURITY_INFORMATION,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    new_acl as *mut _,
                    std::ptr::null_mut(),
                )
            };
            unsafe { LocalFree(new_acl as HLOCAL) };

            if result != 0 {
                return Err(Error::with_path(ErrorKind::PermissionDenied, path));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_exact_then_add_ors_bits() {
        let mut dest = Perms::new();
        dest.set_mode(Who::User, MODE_READ, ModeType::Exact);

        let mut src = Perms::new();
        src.set_mode(Who::User, MODE_WRITE, ModeType::Add);

        dest.merge(&src);
        assert_eq!(dest.mode(Who::User), MODE_READ | MODE_WRITE);
    }

    #[test]
    fn merge_exact_then_remove_ands_not_bits() {
        let mut dest = Perms::new();
        dest.set_mode(Who::User, MODE_READ | MODE_WRITE, ModeType::Exact);

        let mut src = Perms::new();
        src.set_mode(Who::User, MODE_WRITE, ModeType::Remove);

        dest.merge(&src);
        assert_eq!(dest.mode(Who::User), MODE_READ);
    }

    #[test]
    fn merge_non_exact_dest_replaces_wholesale() {
        let mut dest = Perms::new();
        dest.set_mode(Who::User, MODE_READ, ModeType::Add);

        let mut src = Perms::new();
        src.set_mode(Who::User, MODE_EXEC, ModeType::Exact);

        dest.merge(&src);
        assert_eq!(dest.mode(Who::User), MODE_EXEC);
    }

    #[test]
    fn dir_override_wins_over_base_for_directories() {
        let mut perms = Perms::new();
        perms.set_mode(Who::User, MODE_READ, ModeType::Exact);
        perms.set_dir_mode(Who::User, MODE_READ | MODE_EXEC, ModeType::Exact);

        let current = 0o000_000_000u32;
        let dir_mode = perms.compute_mode(current, true);
        let file_mode = perms.compute_mode(current, false);
        assert_eq!((dir_mode >> 6) & 0o7, 0o5);
        assert_eq!((file_mode >> 6) & 0o7, 0o4);
    }

    #[test]
    fn unset_clears_base_and_dir() {
        let mut perms = Perms::new();
        perms.set_mode(Who::Group, MODE_READ, ModeType::Exact);
        perms.set_dir_mode(Who::Group, MODE_READ, ModeType::Exact);
        perms.unset_mode(Who::Group);
        assert!(!perms.is_set(Who::Group));
        assert_eq!(perms.compute_mode(0o770, true), 0o770);
    }

    #[test]
    fn empty_name_clears_user() {
        let mut perms = Perms::new();
        perms.set_user(Some("root")).unwrap();
        perms.set_user(Some("")).unwrap();
        assert_eq!(perms.user(), None);
    }

    #[test]
    fn unknown_user_name_is_rejected_and_leaves_prior_value() {
        let mut perms = Perms::new();
        perms.set_user(Some("root")).unwrap();
        assert!(perms.set_user(Some("definitely-not-a-real-user-xyz")).is_err());
        assert_eq!(perms.user(), Some("root"));
    }
}
