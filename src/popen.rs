//! Component G: cross-platform child-process launcher.
//!
//! POSIX side forks, wires up three pipes, and execs `/bin/sh -c "exec
//! <cmd>"` in the child so shell metacharacters in the command line work
//! the same way a shell-invoked command would. Exec failures inside the
//! child are reported back to the parent by exiting with a reserved code
//! (124-127) rather than writing to a shared fd after fork, since the
//! child is single-threaded and must not touch anything that could
//! deadlock (see `services::fork_child`'s own caution about this).

use crate::error::{Error, ErrorKind, Result};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ExitKind {
    Normal(i32),
    Signaled(i32),
    CommandNotFound,
    PermissionDenied,
    ShellFailure,
    ExecFailure,
}

/// Reserved shell-style exit codes used to report exec-time failures back
/// through the child's own exit status, since there is no other safe
/// channel between fork and exec.
mod exit_codes {
    pub const EXEC_FAILURE: i32 = 124;
    pub const SHELL_FAILURE: i32 = 125;
    pub const PERMISSION_DENIED: i32 = 126;
    pub const COMMAND_NOT_FOUND: i32 = 127;
}

fn classify_exit(code: i32) -> ExitKind {
    match code {
        exit_codes::EXEC_FAILURE => ExitKind::ExecFailure,
        exit_codes::SHELL_FAILURE => ExitKind::ShellFailure,
        exit_codes::PERMISSION_DENIED => ExitKind::PermissionDenied,
        exit_codes::COMMAND_NOT_FOUND => ExitKind::CommandNotFound,
        other => ExitKind::Normal(other),
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum FdTarget {
    Inherit,
    Pipe,
    Null,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PopenFlags {
    pub stdin: Option<FdTarget>,
    pub stdout: Option<FdTarget>,
    pub stderr: Option<FdTarget>,
}

pub struct PopenHandle {
    #[cfg(unix)]
    pid: nix::unistd::Pid,
    #[cfg(windows)]
    process: windows_sys::Win32::Foundation::HANDLE,
    stdin: Option<std::fs::File>,
    stdout: Option<std::fs::File>,
    stderr: Option<std::fs::File>,
    exited: Option<ExitKind>,
}

unsafe impl Send for PopenHandle {}

impl PopenHandle {
    #[cfg(unix)]
    pub fn spawn(cmd: &str, flags: PopenFlags) -> Result<Self> {
        use nix::unistd::{self, ForkResult};
        use std::os::fd::AsRawFd;

        let want = |t: Option<FdTarget>| t.unwrap_or(FdTarget::Inherit);
        let stdin_target = want(flags.stdin);
        let stdout_target = want(flags.stdout);
        let stderr_target = want(flags.stderr);

        let stdin_pipe = if stdin_target == FdTarget::Pipe {
            Some(nix::unistd::pipe().map_err(Error::from)?)
        } else {
            None
        };
        let stdout_pipe = if stdout_target == FdTarget::Pipe {
            Some(nix::unistd::pipe().map_err(Error::from)?)
        } else {
            None
        };
        let stderr_pipe = if stderr_target == FdTarget::Pipe {
            Some(nix::unistd::pipe().map_err(Error::from)?)
        } else {
            None
        };

        let cmd_owned = cmd.to_owned();

        match unsafe { unistd::fork() }.map_err(Error::from)? {
            ForkResult::Child => {
                // `pipe()` fds are not O_CLOEXEC, so every end not dup2'd into
                // place must be closed explicitly here — otherwise the child
                // (and whatever it execs) keeps the unused halves open, and
                // the parent closing its own end (e.g. `close_stdin`) never
                // delivers EOF.
                if let Some((r, w)) = &stdin_pipe {
                    let _ = unistd::dup2(r.as_raw_fd(), libc::STDIN_FILENO);
                    unsafe {
                        libc::close(r.as_raw_fd());
                        libc::close(w.as_raw_fd());
                    }
                }
                if let Some((r, w)) = &stdout_pipe {
                    let _ = unistd::dup2(w.as_raw_fd(), libc::STDOUT_FILENO);
                    unsafe {
                        libc::close(r.as_raw_fd());
                        libc::close(w.as_raw_fd());
                    }
                }
                if let Some((r, w)) = &stderr_pipe {
                    let _ = unistd::dup2(w.as_raw_fd(), libc::STDERR_FILENO);
                    unsafe {
                        libc::close(r.as_raw_fd());
                        libc::close(w.as_raw_fd());
                    }
                }
                if stdin_target == FdTarget::Null {
                    redirect_to_devnull(libc::STDIN_FILENO);
                }
                if stdout_target == FdTarget::Null {
                    redirect_to_devnull(libc::STDOUT_FILENO);
                }
                if stderr_target == FdTarget::Null {
                    redirect_to_devnull(libc::STDERR_FILENO);
                }

                let shell = std::ffi::CString::new("/bin/sh").unwrap();
                let dash_c = std::ffi::CString::new("-c").unwrap();
                let full = std::ffi::CString::new(format!("exec {cmd_owned}")).unwrap();
                let argv = [shell.as_ptr(), dash_c.as_ptr(), full.as_ptr(), std::ptr::null()];
                unsafe {
                    libc::execv(shell.as_ptr(), argv.as_ptr());
                }
                // execv only returns on failure.
                let code = match nix::errno::Errno::last() {
                    nix::errno::Errno::ENOENT => exit_codes::COMMAND_NOT_FOUND,
                    nix::errno::Errno::EACCES => exit_codes::PERMISSION_DENIED,
                    _ => exit_codes::EXEC_FAILURE,
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                let stdin_file = stdin_pipe.map(|(_r, w)| fd_to_file(w));
                let stdout_file = stdout_pipe.map(|(r, _w)| fd_to_file(r));
                let stderr_file = stderr_pipe.map(|(r, _w)| fd_to_file(r));

                Ok(PopenHandle {
                    pid: child,
                    stdin: stdin_file,
                    stdout: stdout_file,
                    stderr: stderr_file,
                    exited: None,
                })
            }
        }
    }

    #[cfg(windows)]
    pub fn spawn(_cmd: &str, _flags: PopenFlags) -> Result<Self> {
        Err(Error::new(ErrorKind::NotSupported))
    }

    pub fn write_stdin(&mut self, buf: &[u8]) -> Result<usize> {
        let f = self.stdin.as_mut().ok_or_else(|| Error::new(ErrorKind::Invalid))?;
        f.write(buf).map_err(Error::from)
    }

    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    pub fn read_stdout(&mut self, buf: &mut [u8]) -> Result<usize> {
        let f = self.stdout.as_mut().ok_or_else(|| Error::new(ErrorKind::Invalid))?;
        f.read(buf).map_err(Error::from)
    }

    pub fn read_stderr(&mut self, buf: &mut [u8]) -> Result<usize> {
        let f = self.stderr.as_mut().ok_or_else(|| Error::new(ErrorKind::Invalid))?;
        f.read(buf).map_err(Error::from)
    }

    /// Non-blocking poll for exit; returns `None` if still running.
    #[cfg(unix)]
    pub fn check(&mut self) -> Result<Option<ExitKind>> {
        use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
        if let Some(k) = self.exited {
            return Ok(Some(k));
        }
        match wait::waitpid(self.pid, Some(WaitPidFlag::WNOHANG)).map_err(Error::from)? {
            WaitStatus::Exited(_, code) => {
                let kind = classify_exit(code);
                self.exited = Some(kind);
                Ok(Some(kind))
            }
            WaitStatus::Signaled(_, sig, _) => {
                let kind = ExitKind::Signaled(sig as i32);
                self.exited = Some(kind);
                Ok(Some(kind))
            }
            _ => Ok(None),
        }
    }

    #[cfg(windows)]
    pub fn check(&mut self) -> Result<Option<ExitKind>> {
        Err(Error::new(ErrorKind::NotSupported))
    }

    /// Block (with an optional timeout) until the child exits, escalating
    /// to `SIGKILL`/`TerminateProcess` if the deadline passes.
    pub fn wait_timeout(&mut self, timeout: Option<Duration>) -> Result<ExitKind> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(kind) = self.check()? {
                return Ok(kind);
            }
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    self.kill()?;
                    return self.wait_timeout(None);
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[cfg(unix)]
    pub fn kill(&mut self) -> Result<()> {
        nix::sys::signal::kill(self.pid, nix::sys::signal::Signal::SIGKILL).map_err(Error::from)
    }

    #[cfg(windows)]
    pub fn kill(&mut self) -> Result<()> {
        Err(Error::new(ErrorKind::NotSupported))
    }

    /// Close all pipes and wait (up to `timeout`) for the child; kills it
    /// on timeout. Mirrors the upstream `close_ex` contract.
    pub fn close_ex(&mut self, timeout: Option<Duration>) -> Result<ExitKind> {
        self.close_stdin();
        self.stdout = None;
        self.stderr = None;
        self.wait_timeout(timeout)
    }
}

#[cfg(unix)]
fn redirect_to_devnull(target: std::os::fd::RawFd) {
    use std::os::fd::AsRawFd;
    if let Ok(null) = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null") {
        unsafe {
            libc::dup2(null.as_raw_fd(), target);
        }
    }
}

#[cfg(unix)]
fn fd_to_file(fd: std::os::fd::OwnedFd) -> std::fs::File {
    use std::os::fd::IntoRawFd;
    unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fd.into_raw_fd()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[cfg(unix)]
    #[test]
    fn spawn_captures_stdout() {
        let mut handle = PopenHandle::spawn(
            "echo hello",
            PopenFlags { stdout: Some(FdTarget::Pipe), ..Default::default() },
        )
        .unwrap();
        let mut out = String::new();
        handle.stdout.as_mut().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out.trim(), "hello");
        let status = handle.wait_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(status, ExitKind::Normal(0));
    }

    #[cfg(unix)]
    #[test]
    fn spawn_reports_nonzero_exit() {
        let mut handle = PopenHandle::spawn("exit 3", PopenFlags::default()).unwrap();
        let status = handle.wait_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(status, ExitKind::Normal(3));
    }

    #[cfg(unix)]
    #[test]
    fn missing_command_reports_not_found() {
        let mut handle = PopenHandle::spawn(
            "this-binary-does-not-exist-xyz",
            PopenFlags { stdout: Some(FdTarget::Pipe), stderr: Some(FdTarget::Pipe), ..Default::default() },
        )
        .unwrap();
        let status = handle.wait_timeout(Some(Duration::from_secs(5))).unwrap();
        assert!(matches!(status, ExitKind::CommandNotFound | ExitKind::ShellFailure | ExitKind::Normal(127)));
    }
}
