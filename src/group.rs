//! Lifecycle group: every worker lives and dies with it.
//!
//! The Unix implementation is a process group whose id is pinned by an
//! "anchor" child that exits at once and stays a zombie until the group is
//! closed, so the group id stays valid even when every worker has exited.
//! Workers join it between `fork` and `exec`; closing the group sends
//! `SIGKILL` to every member, and the parent death signal armed in each
//! worker covers a coordinator that dies without closing it.

use crate::error::SupervisionError;
use crate::platform;
use crate::spawner::WorkerProcess;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::fmt;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    Signal(i32),
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        matches!(self, WorkerExit::Code(0))
    }

    /// Shell-style exit code: signals map to `128 + signo`.
    pub fn code(&self) -> i32 {
        match self {
            WorkerExit::Code(code) => *code,
            WorkerExit::Signal(signo) => 128 + signo,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Code(code) => write!(f, "exit code {}", code),
            WorkerExit::Signal(signo) => match Signal::try_from(*signo) {
                Ok(signal) => write!(f, "killed by {}", signal),
                Err(_) => write!(f, "killed by signal {}", signo),
            },
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait LifecycleGroup {
    /// Group id that workers join at spawn time, if the platform needs one.
    fn id(&self) -> Option<i32>;

    /// Put a freshly spawned worker under supervision.
    ///
    /// On error the caller must kill the worker at once.
    fn bind(&mut self, worker: &WorkerProcess) -> Result<(), SupervisionError>;

    /// Pids currently supervised.
    fn members(&self) -> Vec<u32>;

    /// Block until every listed pid has exited; one status per pid, in order.
    fn wait_all(&mut self, pids: &[u32]) -> Result<Vec<(u32, WorkerExit)>, SupervisionError>;

    /// Terminate all current members and refuse future ones.
    fn terminate_all(&mut self) -> Result<(), SupervisionError>;
}

/// POSIX process group pinned by a zombie anchor.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: i32,
    anchor: Option<Child>,
    members: Vec<u32>,
    closed: bool,
}

impl ProcessGroup {
    /// Create a new, empty group.
    pub fn create() -> Result<Self, SupervisionError> {
        // Minimal process that exits immediately and becomes the group's zombie anchor
        let anchor = Command::new("true")
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(SupervisionError::Create)?;

        let pgid = anchor.id() as i32;
        debug!("Lifecycle group created with PGID: {}", pgid);

        Ok(Self {
            pgid,
            anchor: Some(anchor),
            members: Vec::new(),
            closed: false,
        })
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn reap_anchor(&mut self) {
        if let Some(mut anchor) = self.anchor.take() {
            let _ = anchor.kill();
            let _ = anchor.wait();
        }
    }
}

impl LifecycleGroup for ProcessGroup {
    fn id(&self) -> Option<i32> {
        Some(self.pgid)
    }

    fn bind(&mut self, worker: &WorkerProcess) -> Result<(), SupervisionError> {
        if self.closed {
            return Err(SupervisionError::Closed { pid: worker.pid });
        }

        let actual = platform::process_group_of(worker.pid).map_err(|source| {
            SupervisionError::Bind {
                pid: worker.pid,
                source,
            }
        })?;
        if actual != self.pgid {
            return Err(SupervisionError::NotMember {
                pid: worker.pid,
                expected: self.pgid,
                actual,
            });
        }

        self.members.push(worker.pid);
        debug!("pid={} bound to lifecycle group {}", worker.pid, self.pgid);
        Ok(())
    }

    fn members(&self) -> Vec<u32> {
        self.members.clone()
    }

    fn wait_all(&mut self, pids: &[u32]) -> Result<Vec<(u32, WorkerExit)>, SupervisionError> {
        let mut statuses = Vec::with_capacity(pids.len());
        for &pid in pids {
            let exit = wait_for(pid)?;
            self.members.retain(|member| *member != pid);
            info!("Worker pid={} exited: {}", pid, exit);
            statuses.push((pid, exit));
        }
        Ok(statuses)
    }

    fn terminate_all(&mut self) -> Result<(), SupervisionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = platform::kill_process_group(self.pgid, Signal::SIGKILL)
            .map_err(SupervisionError::Terminate);
        match &result {
            Ok(()) => info!(
                "Lifecycle group {} terminated ({} members)",
                self.pgid,
                self.members.len()
            ),
            Err(err) => warn!("{}", err),
        }
        self.reap_anchor();
        result
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let _ = self.terminate_all();
        self.reap_anchor();
    }
}

fn wait_for(pid: u32) -> Result<WorkerExit, SupervisionError> {
    let target = Pid::from_raw(pid as i32);
    loop {
        match waitpid(target, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(WorkerExit::Code(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(WorkerExit::Signal(signal as i32)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(SupervisionError::Wait {
                    pid,
                    source: e.into(),
                })
            }
        }
    }
}
