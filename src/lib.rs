//! Prefork Library
//!
//! Pre-fork worker pool: a coordinator binds one listening socket, spawns N
//! worker processes into a lifecycle group and hands each of them the socket
//! over a private channel; every worker then serves requests on it.

#[cfg(not(unix))]
compile_error!("prefork supports Unix targets only");

pub mod channel;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod group;
pub mod launcher;
pub mod logging;
pub mod platform;
pub mod report;
pub mod server;
pub mod signal;
pub mod spawner;

// Re-export commonly used types for convenience
pub use codec::{ShareBlob, SocketShareCodec, UnixShareCodec};
pub use config::LauncherConfig;
pub use error::{ErrorCategory, LaunchError};
pub use group::{LifecycleGroup, ProcessGroup, WorkerExit};
pub use launcher::{Launcher, Role};
pub use report::PoolReport;
pub use spawner::{OsProcessSpawner, ProcessSpawner, WorkerProcess, WorkerTemplate};
