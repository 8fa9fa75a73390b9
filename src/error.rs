//! Unified error taxonomy shared by the permissions, path, and file-I/O
//! components. Mirrors OS errors into a small portable set of kinds instead
//! of leaking `errno`/`GetLastError` directly to callers.

use std::fmt;
use std::io;
use std::path::PathBuf;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    IsDirectory,
    NotDirectory,
    DirNotEmpty,
    LinkLoop,
    NameTooLong,
    IOError,
    Quota,
    FileTooBig,
    TooManyFiles,
    TooManyLinks,
    ReadOnly,
    NotSupported,
    Seek,
    NotSameDevice,
    Invalid,
    Generic,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::PermissionDenied => "permission denied",
            Self::IsDirectory => "is a directory",
            Self::NotDirectory => "not a directory",
            Self::DirNotEmpty => "directory not empty",
            Self::LinkLoop => "symlink loop or too many redirects",
            Self::NameTooLong => "name too long",
            Self::IOError => "I/O error",
            Self::Quota => "quota exceeded",
            Self::FileTooBig => "file too big",
            Self::TooManyFiles => "too many open files",
            Self::TooManyLinks => "too many links",
            Self::ReadOnly => "read-only filesystem",
            Self::NotSupported => "operation not supported",
            Self::Seek => "seek not permitted",
            Self::NotSameDevice => "cross-device operation",
            Self::Invalid => "invalid argument or state",
            Self::Generic => "generic OS error",
        };
        f.write_str(s)
    }
}

/// Error type for components A (Permissions), B (Path), C (File).
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub path: Option<PathBuf>,
    source: Option<io::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            path: None,
            source: None,
        }
    }

    pub fn with_path(kind: ErrorKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: Some(path.into()),
            source: None,
        }
    }

    pub fn io(kind: ErrorKind, source: io::Error) -> Self {
        Self {
            kind,
            path: None,
            source: Some(source),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, &self.source) {
            (Some(p), Some(e)) => write!(f, "{}: {} ({e})", p.display(), self.kind),
            (Some(p), None) => write!(f, "{}: {}", p.display(), self.kind),
            (None, Some(e)) => write!(f, "{} ({e})", self.kind),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as _)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorKind::Invalid,
            _ => ErrorKind::Generic,
        };
        Error::io(kind, e)
    }
}

#[cfg(unix)]
impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        use nix::Error as E;
        let kind = match e {
            E::ENOENT => ErrorKind::NotFound,
            E::EEXIST => ErrorKind::AlreadyExists,
            E::EACCES | E::EPERM => ErrorKind::PermissionDenied,
            E::EISDIR => ErrorKind::IsDirectory,
            E::ENOTDIR => ErrorKind::NotDirectory,
            E::ENOTEMPTY => ErrorKind::DirNotEmpty,
            E::ELOOP => ErrorKind::LinkLoop,
            E::ENAMETOOLONG => ErrorKind::NameTooLong,
            E::EDQUOT => ErrorKind::Quota,
            E::EFBIG => ErrorKind::FileTooBig,
            E::EMFILE | E::ENFILE => ErrorKind::TooManyFiles,
            E::EMLINK => ErrorKind::TooManyLinks,
            E::EROFS => ErrorKind::ReadOnly,
            E::ENOTSUP => ErrorKind::NotSupported,
            E::ESPIPE => ErrorKind::Seek,
            E::EXDEV => ErrorKind::NotSameDevice,
            E::EINVAL => ErrorKind::Invalid,
            _ => ErrorKind::Generic,
        };
        Error::io(kind, io::Error::from(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
