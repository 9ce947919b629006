//! Two-phase container process bootstrap.
//!
//! Phase one runs on the host: [`spawn`] clones a child into fresh
//! namespaces, wires its standard streams and the read end of a private
//! pipe (as descriptor 3), and has it re-invoke the runtime binary with the
//! reserved `init` subcommand from inside the container's merge directory.
//! The child then blocks on the pipe, so the caller can enroll it in a
//! cgroup and persist its record before releasing it with
//! [`ContainerProcess::hand_off`].
//!
//! Phase two runs inside the namespaces: [`run_init`] reads the command,
//! pivots into the merge directory, mounts `/proc` and `/dev`, and replaces
//! itself with the user program.

use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Pid, pipe2};

use capsule_common::constants::{HANDOFF_FD, INIT_SUBCOMMAND};
use capsule_common::error::{CapsuleError, Result};
use capsule_core::filesystem::{mount, pivot_root};
use capsule_core::namespace::NamespaceConfig;
use capsule_core::signal;

use crate::handoff;

const STACK_SIZE: usize = 1024 * 1024;

/// Exit status of a child that failed before reaching `execve(2)`.
const CHILD_SETUP_FAILED: i32 = 125;
/// Exit status of a child whose `execve(2)` failed.
const CHILD_EXEC_FAILED: i32 = 127;

/// The program a container child executes to become the container's init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitProgram {
    program: PathBuf,
    args: Vec<OsString>,
}

impl InitProgram {
    /// Creates an init program from an explicit path and arguments.
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The running binary invoked with the reserved `init` subcommand.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the path of the running binary is unknown.
    pub fn current_exe() -> Result<Self> {
        Self::reinvoke(INIT_SUBCOMMAND)
    }

    /// The running binary invoked with `subcommand`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the path of the running binary is unknown.
    pub fn reinvoke(subcommand: &str) -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| CapsuleError::io("/proc/self/exe", e))?;
        Ok(Self::new(exe, [subcommand]))
    }

    /// Returns the program path.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Returns the arguments passed after the program path.
    #[must_use]
    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

/// Where a container's standard streams go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioMode {
    /// Share the caller's terminal.
    Inherit,
    /// Append stdout and stderr to a log file; stdin reads `/dev/null`.
    Log(PathBuf),
}

/// Parameters of [`spawn`].
#[derive(Debug, Clone)]
pub struct SpawnConfig<'a> {
    /// Program the child executes.
    pub init: &'a InitProgram,
    /// Namespaces the child is cloned into.
    pub namespaces: NamespaceConfig,
    /// Working directory of the child; the container's merge directory.
    pub workdir: &'a Path,
    /// Variables added to the inherited environment, overriding it.
    pub env: &'a [(String, String)],
    /// Standard stream wiring.
    pub stdio: StdioMode,
}

/// A spawned container child waiting for, or past, its command handoff.
#[derive(Debug)]
pub struct ContainerProcess {
    pid: Pid,
    handoff: Option<File>,
}

impl ContainerProcess {
    /// Returns the host pid of the child.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Sends the command and closes the pipe, releasing the child.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Protocol`] if the command was already sent
    /// or cannot be framed, or a setup error if the write fails.
    pub fn hand_off(&mut self, argv: &[String]) -> Result<()> {
        let mut pipe = self.handoff.take().ok_or_else(|| CapsuleError::Protocol {
            message: "command already handed off".into(),
        })?;
        handoff::write_command(&mut pipe, argv)?;
        tracing::debug!(pid = self.pid(), "command handed off");
        Ok(())
    }

    /// Blocks until the child exits and returns its exit code.
    ///
    /// A child killed by a signal reports `128 + signal`, as shells do.
    ///
    /// # Errors
    ///
    /// Returns a setup error if `waitpid(2)` fails.
    pub fn wait(&self) -> Result<i32> {
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(CapsuleError::setup("wait", e)),
            }
        }
    }

    /// Kills the child and reaps it. Used to abandon a child whose setup
    /// failed before the handoff.
    pub fn abort(mut self) {
        drop(self.handoff.take());
        if let Err(e) = signal::send_signal(self.pid(), Signal::SIGKILL) {
            tracing::warn!(pid = self.pid(), error = %e, "failed to kill aborted child");
            return;
        }
        let _ = self.wait();
    }
}

/// Everything the cloned child needs, prepared before `clone(2)` so the
/// child only makes raw system calls.
struct ChildPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    workdir: CString,
    handoff_fd: RawFd,
    stdin_fd: Option<RawFd>,
    log_fd: Option<RawFd>,
}

impl ChildPlan {
    /// Runs in the cloned child. Never returns.
    fn enter(&self, argv: &[*const libc::c_char], envp: &[*const libc::c_char]) -> ! {
        // SAFETY: only async-signal-safe libc calls on descriptors and
        // C strings prepared by the parent; every failure ends in `_exit`.
        unsafe {
            if let Some(fd) = self.stdin_fd {
                if libc::dup2(fd, libc::STDIN_FILENO) < 0 {
                    libc::_exit(CHILD_SETUP_FAILED);
                }
            }
            if let Some(fd) = self.log_fd {
                if libc::dup2(fd, libc::STDOUT_FILENO) < 0 || libc::dup2(fd, libc::STDERR_FILENO) < 0
                {
                    libc::_exit(CHILD_SETUP_FAILED);
                }
            }
            // Every source descriptor sits above HANDOFF_FD, so each dup2
            // makes a real copy, which clears close-on-exec.
            if libc::dup2(self.handoff_fd, HANDOFF_FD) < 0
                || libc::chdir(self.workdir.as_ptr()) < 0
            {
                libc::_exit(CHILD_SETUP_FAILED);
            }
            libc::execve(self.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
            libc::_exit(CHILD_EXEC_FAILED)
        }
    }
}

fn cstring(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes).map_err(|_| CapsuleError::Config {
        message: format!("{what} contains a NUL byte"),
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Builds `KEY=VALUE` entries from the current environment with
/// `overrides` applied on top.
fn merged_env(overrides: &[(String, String)]) -> Result<Vec<CString>> {
    let mut vars: Vec<(OsString, OsString)> = std::env::vars_os()
        .filter(|(key, _)| !overrides.iter().any(|(k, _)| OsStr::new(k) == key))
        .collect();
    vars.extend(
        overrides
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v))),
    );
    vars.iter()
        .map(|(key, value)| {
            let mut entry = key.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            cstring(&entry, "environment variable")
        })
        .collect()
}

/// Moves `fd` above the descriptors the child rewires, stdio and the
/// handoff slot, so that no `dup2` there can overwrite it. Matters when the
/// runtime itself was started with a standard stream closed.
fn above_reserved(fd: impl Into<OwnedFd>) -> Result<OwnedFd> {
    let fd = fd.into();
    let raised = fcntl(&fd, FcntlArg::F_DUPFD_CLOEXEC(HANDOFF_FD + 1))
        .map_err(|e| CapsuleError::setup("descriptor", e))?;
    // SAFETY: F_DUPFD_CLOEXEC returned a new descriptor nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raised) })
}

/// Clones the container child and leaves it blocked on the handoff pipe.
///
/// # Errors
///
/// Returns [`CapsuleError::Config`] for arguments that cannot be passed to
/// `execve(2)`, an I/O error if the log file cannot be opened, or
/// [`CapsuleError::ResourceSetup`] if the pipe or `clone(2)` fails.
pub fn spawn(config: &SpawnConfig<'_>) -> Result<ContainerProcess> {
    let (read_end, write_end): (OwnedFd, OwnedFd) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| CapsuleError::setup("handoff pipe", e))?;
    let read_end = above_reserved(read_end)?;

    let (stdin, log) = match &config.stdio {
        StdioMode::Inherit => (None, None),
        StdioMode::Log(path) => {
            let log = OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o644)
                .open(path)
                .map_err(|e| CapsuleError::io(path, e))?;
            let null = File::open("/dev/null").map_err(|e| CapsuleError::io("/dev/null", e))?;
            (Some(above_reserved(null)?), Some(above_reserved(log)?))
        }
    };

    let program = cstring(config.init.program.as_os_str().as_bytes(), "init program")?;
    let argv = std::iter::once(config.init.program.as_os_str())
        .chain(config.init.args.iter().map(OsString::as_os_str))
        .map(|arg| cstring(arg.as_bytes(), "init argument"))
        .collect::<Result<Vec<_>>>()?;
    let plan = ChildPlan {
        program,
        argv,
        envp: merged_env(config.env)?,
        workdir: cstring(config.workdir.as_os_str().as_bytes(), "working directory")?,
        handoff_fd: read_end.as_raw_fd(),
        stdin_fd: stdin.as_ref().map(AsRawFd::as_raw_fd),
        log_fd: log.as_ref().map(AsRawFd::as_raw_fd),
    };
    let argv_ptrs = null_terminated(&plan.argv);
    let envp_ptrs = null_terminated(&plan.envp);

    let mut stack = vec![0u8; STACK_SIZE];
    let flags = config.namespaces.clone_flags();
    // SAFETY: without CLONE_VM the child runs on a copy of this address
    // space and only calls `ChildPlan::enter`, which never returns.
    let pid = unsafe {
        nix::sched::clone(
            Box::new(|| -> isize { plan.enter(&argv_ptrs, &envp_ptrs) }),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    }
    .map_err(|e| CapsuleError::setup("clone", e))?;

    drop(read_end);
    tracing::info!(
        pid = pid.as_raw(),
        program = %config.init.program.display(),
        workdir = %config.workdir.display(),
        "container process spawned"
    );
    Ok(ContainerProcess {
        pid,
        handoff: Some(File::from(write_end)),
    })
}

/// Init side of the bootstrap, run as the container's first process.
///
/// Reads the command from the inherited pipe, makes the working directory
/// the new root, mounts `/proc` and a `/dev` tmpfs, resolves the program
/// on `PATH`, and executes it with the inherited environment. Returns
/// only on failure.
///
/// # Errors
///
/// Returns [`CapsuleError::Protocol`] for a missing or malformed command,
/// or the error of the first mount, lookup, or exec step that fails.
pub fn run_init() -> Result<Infallible> {
    // SAFETY: descriptor 3 is the handoff pipe installed by `spawn` and is
    // owned by nothing else in this process.
    let mut pipe = unsafe { File::from_raw_fd(HANDOFF_FD) };
    let argv = handoff::read_command(&mut pipe)?;
    drop(pipe);
    tracing::debug!(command = ?argv, "command received");

    pivot_root::pivot_to_cwd()?;
    mount::mount_proc()?;
    mount::mount_dev_tmpfs()?;

    let program = which::which(&argv[0]).map_err(|e| CapsuleError::NotFound {
        kind: "command",
        id: format!("{}: {e}", argv[0]),
    })?;
    let program = cstring(program.as_os_str().as_bytes(), "command path")?;
    let args = argv
        .iter()
        .map(|a| cstring(a.as_bytes(), "command argument"))
        .collect::<Result<Vec<_>>>()?;
    nix::unistd::execv(&program, &args).map_err(|e| CapsuleError::setup("exec", e))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sh(script: &str) -> InitProgram {
        InitProgram::new("/bin/sh", ["-c", script])
    }

    fn spawn_in(
        dir: &Path,
        init: &InitProgram,
        env: &[(String, String)],
        stdio: StdioMode,
    ) -> ContainerProcess {
        spawn(&SpawnConfig {
            init,
            namespaces: NamespaceConfig::none(),
            workdir: dir,
            env,
            stdio,
        })
        .expect("spawn")
    }

    #[test]
    fn child_blocks_until_handoff_then_receives_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let init = sh("cat <&3 > received");
        let mut child = spawn_in(dir.path(), &init, &[], StdioMode::Inherit);

        std::thread::sleep(Duration::from_millis(100));
        let early = std::fs::read(dir.path().join("received")).unwrap_or_default();
        assert!(early.is_empty());

        let argv = vec!["echo".to_string(), "hi".to_string()];
        child.hand_off(&argv).expect("hand off");
        assert_eq!(child.wait().expect("wait"), 0);

        let mut frame = Vec::new();
        handoff::write_command(&mut frame, &argv).expect("frame");
        assert_eq!(std::fs::read(dir.path().join("received")).expect("read"), frame);
    }

    #[test]
    fn detached_output_goes_to_log_with_extra_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("container.log");
        let init = sh("cat <&3 >/dev/null; echo \"$GREETING\"; echo oops >&2");
        let env = [("GREETING".to_string(), "hello".to_string())];
        let mut child = spawn_in(dir.path(), &init, &env, StdioMode::Log(log.clone()));
        child.hand_off(&["true".to_string()]).expect("hand off");
        assert_eq!(child.wait().expect("wait"), 0);
        assert_eq!(std::fs::read_to_string(log).expect("log"), "hello\noops\n");
    }

    #[test]
    fn working_directory_is_the_given_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let init = sh("cat <&3 >/dev/null; pwd > cwd");
        let mut child = spawn_in(dir.path(), &init, &[], StdioMode::Inherit);
        child.hand_off(&["true".to_string()]).expect("hand off");
        let _ = child.wait().expect("wait");
        let cwd = std::fs::read_to_string(dir.path().join("cwd")).expect("cwd");
        let expected = std::fs::canonicalize(dir.path()).expect("canonical");
        assert_eq!(Path::new(cwd.trim()), expected);
    }

    #[test]
    fn exit_code_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let init = sh("cat <&3 >/dev/null; exit 7");
        let mut child = spawn_in(dir.path(), &init, &[], StdioMode::Inherit);
        child.hand_off(&["true".to_string()]).expect("hand off");
        assert_eq!(child.wait().expect("wait"), 7);
    }

    #[test]
    fn missing_program_exits_with_exec_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let init = InitProgram::new(dir.path().join("no-such-binary"), Vec::<String>::new());
        let child = spawn_in(dir.path(), &init, &[], StdioMode::Inherit);
        assert_eq!(child.wait().expect("wait"), CHILD_EXEC_FAILED);
    }

    #[test]
    fn second_handoff_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let init = sh("cat <&3 >/dev/null");
        let mut child = spawn_in(dir.path(), &init, &[], StdioMode::Inherit);
        child.hand_off(&["true".to_string()]).expect("first");
        assert!(matches!(
            child.hand_off(&["true".to_string()]),
            Err(CapsuleError::Protocol { .. })
        ));
        let _ = child.wait();
    }

    #[test]
    fn aborted_child_is_killed_and_reaped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let init = sh("sleep 30");
        let child = spawn_in(dir.path(), &init, &[], StdioMode::Inherit);
        let pid = child.pid();
        child.abort();
        assert!(!signal::is_alive(pid));
    }

    #[test]
    fn descriptors_are_moved_above_stdio_and_handoff_slot() {
        use nix::fcntl::FdFlag;

        let (read_end, _write_end) = pipe2(OFlag::O_CLOEXEC).expect("pipe");
        let raised = above_reserved(read_end).expect("raise");
        assert!(raised.as_raw_fd() > HANDOFF_FD);
        let flags = fcntl(&raised, FcntlArg::F_GETFD).expect("flags");
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn env_overrides_replace_inherited_values() {
        let env = merged_env(&[("PATH".to_string(), "/capsule/bin".to_string())]).expect("env");
        let paths: Vec<_> = env
            .iter()
            .filter(|e| e.as_bytes().starts_with(b"PATH="))
            .collect();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].as_bytes(), b"PATH=/capsule/bin");
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(matches!(
            cstring(b"a\0b", "argument"),
            Err(CapsuleError::Config { .. })
        ));
    }

    #[test]
    fn current_exe_uses_init_subcommand() {
        let init = InitProgram::current_exe().expect("exe");
        assert_eq!(init.args, vec![OsString::from(INIT_SUBCOMMAND)]);
        assert!(init.program().is_absolute());
    }

    #[test]
    #[ignore = "requires root: creates namespaces, mounts, and pivots"]
    fn isolated_child_sees_itself_as_pid_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let init = sh("cat <&3 >/dev/null; echo $$ > pid");
        let mut child = spawn(&SpawnConfig {
            init: &init,
            namespaces: NamespaceConfig::default(),
            workdir: dir.path(),
            env: &[],
            stdio: StdioMode::Inherit,
        })
        .expect("spawn");
        child.hand_off(&["true".to_string()]).expect("hand off");
        assert_eq!(child.wait().expect("wait"), 0);
        let pid = std::fs::read_to_string(dir.path().join("pid")).expect("pid");
        assert_eq!(pid.trim(), "1");
    }
}
