//! Worker process spawning.
//!
//! Uses `std::process::Command` (`posix_spawn`/`fork`+`exec` under the hood)
//! with a `pre_exec` hook that keeps exactly one channel descriptor open
//! across `exec` and enrols the child in the lifecycle group.

use crate::config::CHANNEL_FD_ARG;
use crate::error::SpawnError;
use crate::group::WorkerExit;
use crate::platform;
use chrono::{DateTime, Utc};
use std::ffi::{OsStr, OsString};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Everything needed to start one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Descriptor the child must inherit (the channel's readable end).
    pub inherit_fd: RawFd,
    /// Process group to join before `exec`; `None` starts a new one.
    pub process_group: Option<i32>,
}

impl WorkerCommand {
    /// Full command line, program first.
    pub fn argv(&self) -> Vec<OsString> {
        std::iter::once(self.program.clone().into_os_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// One spawned child, from the coordinator's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcess {
    pub pid: u32,
    pub argv: Vec<OsString>,
    pub started_at: DateTime<Utc>,
    /// Filled in once the exit has been observed.
    pub exit: Option<WorkerExit>,
}

impl WorkerProcess {
    pub fn new(pid: u32, argv: Vec<OsString>) -> Self {
        Self {
            pid,
            argv,
            started_at: Utc::now(),
            exit: None,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ProcessSpawner {
    /// Launch a worker. On error no usable child exists.
    fn spawn(&self, command: &WorkerCommand) -> Result<WorkerProcess, SpawnError>;

    /// Forcibly terminate a worker that must not keep running.
    fn kill(&self, pid: u32) -> Result<(), SpawnError>;
}

/// Spawner backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessSpawner;

impl OsProcessSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSpawner for OsProcessSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<WorkerProcess, SpawnError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        platform::prepare_worker_command(&mut cmd, command.inherit_fd, command.process_group);

        let child = cmd.spawn().map_err(|source| SpawnError::Launch {
            program: command.program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        // Reaping is the lifecycle group's job, the std handle is not kept.
        drop(child);

        debug!(
            "Started worker process pid={} fd={} group={:?}",
            pid, command.inherit_fd, command.process_group
        );
        Ok(WorkerProcess::new(pid, command.argv()))
    }

    fn kill(&self, pid: u32) -> Result<(), SpawnError> {
        platform::kill_process(pid).map_err(|source| SpawnError::Kill { pid, source })
    }
}

/// Program and arguments every worker is started with.
///
/// The channel argument is appended per worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTemplate {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerTemplate {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args: strip_channel_arg(args),
        }
    }

    /// Re-run the current executable with the current arguments.
    pub fn current() -> Result<Self, SpawnError> {
        let program = std::env::current_exe().map_err(SpawnError::Executable)?;
        Ok(Self::new(program, std::env::args_os().skip(1).collect()))
    }

    pub fn command_for(&self, channel_fd: RawFd, process_group: Option<i32>) -> WorkerCommand {
        let mut args = self.args.clone();
        args.push(OsString::from(format!("{}={}", CHANNEL_FD_ARG, channel_fd)));
        WorkerCommand {
            program: self.program.clone(),
            args,
            inherit_fd: channel_fd,
            process_group,
        }
    }
}

/// Drop any `--channel-fd` left over from an earlier hand-off.
fn strip_channel_arg(args: Vec<OsString>) -> Vec<OsString> {
    let prefix = format!("{}=", CHANNEL_FD_ARG);
    let mut stripped = Vec::with_capacity(args.len());
    let mut skip_value = false;

    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        if arg.as_os_str() == OsStr::new(CHANNEL_FD_ARG) {
            skip_value = true;
            continue;
        }
        if arg.to_str().is_some_and(|s| s.starts_with(&prefix)) {
            continue;
        }
        stripped.push(arg);
    }
    stripped
}
