//! End-to-end runs of the `prefork` binary.

use assert_cmd::prelude::*;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use predicates::prelude::*;
use serial_test::serial;
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);

fn prefork() -> Command {
    let mut cmd = Command::cargo_bin("prefork").expect("binary built");
    cmd.env("RUST_LOG", "off");
    cmd
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("free port")
}

/// Coordinator process that is killed if a test bails out early.
struct Pool {
    child: Child,
    port: u16,
}

impl Pool {
    fn start(workers: usize) -> Self {
        let port = free_port();
        let child = prefork()
            .args(["--port", &port.to_string(), "--workers", &workers.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("start coordinator");
        Self { child, port }
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Send one request and return the pid of the worker that answered.
    fn request(&self) -> Option<u32> {
        let mut stream = TcpStream::connect(("127.0.0.1", self.port)).ok()?;
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .ok()?;
        let mut response = String::new();
        stream.read_to_string(&mut response).ok()?;

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        let body = response.split("\r\n\r\n").nth(1)?;
        assert!(body.starts_with("Test WS.\r\n"), "{body}");
        body.strip_prefix("Test WS.\r\nWorker: ")?.trim().parse().ok()
    }

    fn wait_until_serving(&self) -> u32 {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            if let Some(pid) = self.request() {
                return pid;
            }
            assert!(Instant::now() < deadline, "pool never started serving");
            thread::sleep(Duration::from_millis(100));
        }
    }

    fn signal(&self, signal: Signal) {
        kill(Pid::from_raw(self.pid() as i32), signal).expect("signal coordinator");
    }

    fn wait_exit(&mut self) -> ExitStatus {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            if let Some(status) = self.child.try_wait().expect("poll coordinator") {
                return status;
            }
            assert!(Instant::now() < deadline, "coordinator did not exit");
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// `pid` no longer exists or is a zombie waiting for its new parent.
#[cfg(target_os = "linux")]
fn gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => true,
    }
}

/// Children of `parent`, from `/proc`; zombies only when asked for.
#[cfg(target_os = "linux")]
fn children(parent: u32, include_zombies: bool) -> Vec<u32> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir("/proc").expect("read /proc").flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        let Some((_, rest)) = stat.rsplit_once(')') else {
            continue;
        };
        let mut fields = rest.split_whitespace();
        let state = fields.next();
        let ppid = fields.next().and_then(|p| p.parse::<u32>().ok());
        if ppid == Some(parent) && (include_zombies || state != Some("Z")) {
            children.push(pid);
        }
    }
    children
}

#[test]
#[serial]
fn help_displays_usage_information() {
    prefork()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"))
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("channel-fd").not());
}

#[test]
#[serial]
fn invalid_configuration_exits_with_code_2() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("prefork.toml");
    std::fs::write(&path, "worker_count = 100000\n").unwrap();

    prefork()
        .arg("--config")
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("worker_count"));
}

#[test]
#[serial]
fn worker_with_bogus_channel_fails() {
    prefork()
        .args(["--channel-fd=1", "--transfer-timeout", "1"])
        .assert()
        .code(1);
}

#[test]
#[serial]
fn workers_serve_and_stop_with_the_coordinator() {
    let mut pool = Pool::start(3);
    let coordinator = pool.pid();

    let mut seen = BTreeSet::new();
    seen.insert(pool.wait_until_serving());
    for _ in 0..30 {
        if let Some(pid) = pool.request() {
            seen.insert(pid);
        }
    }
    assert!(!seen.contains(&coordinator));
    assert!(seen.len() <= 3, "{seen:?}");

    pool.signal(Signal::SIGTERM);
    let status = pool.wait_exit();
    assert!(status.success(), "{status:?}");

    // The coordinator reaped every worker before exiting.
    for pid in seen {
        assert!(!prefork::platform::process_alive(pid), "worker {pid} survived");
    }
    assert!(TcpStream::connect(("127.0.0.1", pool.port)).is_err());
}

#[cfg(target_os = "linux")]
#[test]
#[serial]
fn workers_die_when_the_coordinator_is_killed() {
    let mut pool = Pool::start(3);
    pool.wait_until_serving();

    let deadline = Instant::now() + STARTUP_TIMEOUT;
    let workers = loop {
        let found = children(pool.pid(), false);
        if found.len() == 3 {
            break found;
        }
        assert!(Instant::now() < deadline, "expected 3 workers, found {found:?}");
        thread::sleep(Duration::from_millis(100));
    };

    pool.signal(Signal::SIGKILL);
    pool.wait_exit();

    let deadline = Instant::now() + STARTUP_TIMEOUT;
    while !workers.iter().all(|&pid| gone(pid)) {
        assert!(Instant::now() < deadline, "orphaned workers: {workers:?}");
        thread::sleep(Duration::from_millis(100));
    }
}

#[test]
#[serial]
fn zero_workers_serve_from_the_coordinator() {
    let pool = Pool::start(0);
    assert_eq!(pool.wait_until_serving(), pool.pid());

    // Nothing was spawned, not even a group anchor.
    #[cfg(target_os = "linux")]
    assert_eq!(children(pool.pid(), true), Vec::<u32>::new());
}
