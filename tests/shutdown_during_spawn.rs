//! A termination signal that arrives while the pool is still starting stops
//! the spawn loop. Runs in its own test binary: the shutdown flag is
//! process-wide.

use nix::sys::signal::{raise, Signal};
use prefork::error::SpawnError;
use prefork::spawner::WorkerCommand;
use prefork::{
    Launcher, OsProcessSpawner, ProcessGroup, ProcessSpawner, UnixShareCodec, WorkerProcess,
    WorkerTemplate,
};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Raises SIGTERM in this process right after the first worker starts.
struct InterruptingSpawner {
    inner: OsProcessSpawner,
    spawned: Arc<AtomicUsize>,
}

impl ProcessSpawner for InterruptingSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<WorkerProcess, SpawnError> {
        let worker = self.inner.spawn(command)?;
        if self.spawned.fetch_add(1, Ordering::SeqCst) == 0 {
            raise(Signal::SIGTERM).expect("raise SIGTERM");
        }
        Ok(worker)
    }

    fn kill(&self, pid: u32) -> Result<(), SpawnError> {
        self.inner.kill(pid)
    }
}

#[test]
fn signal_during_spawn_stops_the_pool() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let spawner = InterruptingSpawner {
        inner: OsProcessSpawner::new(),
        spawned: spawned.clone(),
    };
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let group = ProcessGroup::create().expect("create group");
    let template = WorkerTemplate::new("sh", vec!["-c".into(), "exec sleep 30".into()]);

    let report = Launcher::new(listener, spawner, group, UnixShareCodec::new(), template)
        .worker_count(3)
        .transfer_timeout(Some(Duration::from_secs(5)))
        .start_with(|_| panic!("coordinator must not serve"))
        .expect("pool report");

    assert_eq!(spawned.load(Ordering::SeqCst), 1);
    assert!(report.interrupted);
    assert_eq!(report.workers.len(), 1);
    let exit = report.workers[0].exit.expect("worker exit observed");
    assert!(!exit.success(), "{exit}");
    assert!(report.succeeded());
}
