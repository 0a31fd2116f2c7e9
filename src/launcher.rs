//! Worker pool launcher.
//!
//! The coordinator owns the listening socket. For every worker it opens a
//! fresh channel, spawns the child with the channel's readable end, binds the
//! child into the lifecycle group and only then hands it the socket. After
//! the loop it blocks until every group member has exited.

use crate::channel::{self, ChannelReader, ChannelWriter};
use crate::codec::{SocketShareCodec, UnixShareCodec};
use crate::config::LauncherConfig;
use crate::error::{LaunchError, ServeError, TransferError};
use crate::group::{LifecycleGroup, ProcessGroup};
use crate::platform;
use crate::report::{PoolReport, WorkerSummary};
use crate::server;
use crate::signal;
use crate::spawner::{OsProcessSpawner, ProcessSpawner, WorkerProcess, WorkerTemplate};
use axum::Router;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Which side of the hand-off this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Worker { channel_fd: RawFd },
}

pub struct Launcher<S, G, C> {
    listener: TcpListener,
    spawner: S,
    group: G,
    codec: C,
    template: WorkerTemplate,
    worker_count: usize,
    transfer_timeout: Option<Duration>,
    debug: bool,
    workers: Vec<WorkerProcess>,
}

impl<S, G, C> Launcher<S, G, C>
where
    S: ProcessSpawner,
    G: LifecycleGroup,
    C: SocketShareCodec,
{
    pub fn new(
        listener: TcpListener,
        spawner: S,
        group: G,
        codec: C,
        template: WorkerTemplate,
    ) -> Self {
        Self {
            listener,
            spawner,
            group,
            codec,
            template,
            worker_count: 0,
            transfer_timeout: None,
            debug: false,
            workers: Vec::new(),
        }
    }

    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn transfer_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Serve `app` from the pool, or from this process when the pool is empty.
    pub fn start(self, app: Router) -> Result<PoolReport, LaunchError> {
        let debug = self.debug;
        self.start_with(move |listener| server::serve(listener, app, debug))
    }

    /// Like [`start`](Self::start) with the per-process request server supplied
    /// by the caller.
    pub fn start_with<F>(mut self, serve: F) -> Result<PoolReport, LaunchError>
    where
        F: FnOnce(TcpListener) -> Result<(), ServeError>,
    {
        if self.worker_count == 0 {
            info!("No workers requested, serving from pid={}", platform::current_pid());
            serve(self.listener)?;
            return Ok(PoolReport::default());
        }

        let _signals = match self.group.id() {
            Some(group_id) => Some(signal::install(group_id).map_err(LaunchError::Signal)?),
            None => None,
        };

        let started = Instant::now();
        let result = self.spawn_pool().and_then(|()| self.supervise(started));
        if let Err(err) = &result {
            error!("{} failure, closing worker pool: {}", err.category().display_name(), err);
            if let Err(term_err) = self.group.terminate_all() {
                warn!("{}", term_err);
            }
        }
        result
    }

    fn spawn_pool(&mut self) -> Result<(), LaunchError> {
        info!("Starting {} workers", self.worker_count);
        for idx in 0..self.worker_count {
            if signal::shutdown_requested() {
                break;
            }
            let worker = self.spawn_worker(idx)?;
            self.workers.push(worker);
        }

        // Members spawned after the signal was forwarded never received it.
        if signal::shutdown_requested() {
            info!(
                "Shutdown requested while starting workers ({} of {} started)",
                self.workers.len(),
                self.worker_count
            );
            self.group.terminate_all()?;
        }
        Ok(())
    }

    fn spawn_worker(&mut self, idx: usize) -> Result<WorkerProcess, LaunchError> {
        let (reader, writer) = channel::create(self.transfer_timeout)?;
        let command = self.template.command_for(reader.as_raw_fd(), self.group.id());

        let worker = self.spawner.spawn(&command)?;
        // The child holds its own copy now.
        drop(reader);

        if let Err(err) = self.group.bind(&worker) {
            error!("Worker {} pid={} could not be supervised: {}", idx, worker.pid, err);
            if let Err(kill_err) = self.spawner.kill(worker.pid) {
                warn!("{}", kill_err);
            }
            return Err(err.into());
        }
        info!("Worker {} started pid={}", idx, worker.pid);
        debug!("Worker {} argv={:?}", idx, worker.argv);

        match self.share_with(&worker, writer) {
            Ok(len) => debug!("Sent {} byte socket blob to pid={}", len, worker.pid),
            Err(err) => warn!(
                "Socket hand-off to worker {} pid={} failed: {}",
                idx, worker.pid, err
            ),
        }
        Ok(worker)
    }

    /// Serialize the socket for `worker` and send it; the writer is closed
    /// either way.
    fn share_with(
        &self,
        worker: &WorkerProcess,
        writer: ChannelWriter,
    ) -> Result<usize, TransferError> {
        let blob = self.codec.serialize_for(&self.listener, worker.pid)?;
        writer.send(blob)
    }

    fn supervise(&mut self, started: Instant) -> Result<PoolReport, LaunchError> {
        let members = self.group.members();
        info!("Supervising {} workers", members.len());

        for (pid, exit) in self.group.wait_all(&members)? {
            if let Some(worker) = self.workers.iter_mut().find(|w| w.pid == pid) {
                worker.exit = Some(exit);
            }
        }

        let interrupted = signal::shutdown_requested();
        if interrupted {
            info!("Shutdown signal was forwarded to the worker group");
        }

        let report = PoolReport {
            workers: self
                .workers
                .iter()
                .enumerate()
                .map(|(idx, worker)| WorkerSummary {
                    idx,
                    pid: worker.pid,
                    started_at: worker.started_at,
                    exit: worker.exit,
                })
                .collect(),
            duration: started.elapsed(),
            interrupted,
        };
        Ok(report)
    }
}

/// Entry point for both roles.
pub fn run(role: Role, config: &LauncherConfig, app: Router) -> Result<PoolReport, LaunchError> {
    match role {
        Role::Worker { channel_fd } => {
            run_worker(channel_fd, config, app)?;
            Ok(PoolReport::default())
        }
        Role::Coordinator => {
            let addr = config.listen_addr();
            let listener =
                TcpListener::bind(addr).map_err(|source| LaunchError::Listen { addr, source })?;
            info!(
                "Listening on {}",
                listener.local_addr().map_err(|source| LaunchError::Listen { addr, source })?
            );

            if config.worker_count == 0 {
                info!("No workers requested, serving from pid={}", platform::current_pid());
                server::serve(listener, app, config.debug)?;
                return Ok(PoolReport::default());
            }

            let group = ProcessGroup::create()?;
            let template = WorkerTemplate::current()?;
            let spawner = OsProcessSpawner::new();
            let report = Launcher::new(listener, spawner, group, UnixShareCodec::new(), template)
                .worker_count(config.worker_count)
                .transfer_timeout(config.transfer_timeout())
                .debug(config.debug)
                .start(app)?;
            report.log();
            Ok(report)
        }
    }
}

fn run_worker(channel_fd: RawFd, config: &LauncherConfig, app: Router) -> Result<(), LaunchError> {
    let pid = platform::current_pid();
    debug!("Worker pid={} awaiting socket on fd {}", pid, channel_fd);

    let reader = ChannelReader::from_inherited(channel_fd)?;
    reader.set_timeout(config.transfer_timeout())?;
    let blob = reader.receive()?;
    let listener = UnixShareCodec::new().deserialize(blob)?;

    info!(
        "Worker pid={} serving on {}",
        pid,
        listener.local_addr().map_err(ServeError::Io)?
    );
    server::serve(listener, app, config.debug)?;
    Ok(())
}
