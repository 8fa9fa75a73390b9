#![allow(clippy::result_large_err)]
#![allow(clippy::large_enum_variant)]

//! `mfound` is a portable systems foundation library: a small set of
//! primitives for building services and command-line tools without
//! re-deriving them per-project.
//!
//! It contains:
//! - A hierarchical, trace-enabled state-machine engine
//! - Buffered file I/O with strict positional semantics
//! - Symlink-safe recursive directory walking
//! - A portable permissions model (POSIX modes / Windows DACLs)
//! - A bounded multi-stage pipeline scheduler
//! - A cross-platform child-process launcher

pub mod config;
pub mod error;
pub mod file;
pub mod lock_ext;
pub mod logging;
pub mod path;
pub mod perms;
pub mod pipeline;
pub mod popen;
pub mod state_machine;
pub mod walk;
