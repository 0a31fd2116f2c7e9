//! Unified error handling for the prefork launcher
//!
//! Every component has its own error enum; [`LaunchError`] wraps them for
//! the entry point and classifies them so the binary can pick an exit code.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Failures moving a share blob over a handle-transfer channel, or turning
/// it back into a socket.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Short read on handle-transfer channel: expected {expected} bytes, got {received}")]
    ShortRead { expected: usize, received: usize },
    #[error("Short write on handle-transfer channel: expected {expected} bytes, wrote {written}")]
    ShortWrite { expected: usize, written: usize },
    #[error("Handle-transfer channel timed out")]
    TimedOut,
    #[error("No socket handle arrived with the share blob")]
    MissingHandle,
    #[error("Share blob of {0} bytes exceeds the frame limit")]
    Oversized(u32),
    #[error("Malformed share blob: {0}")]
    Malformed(String),
    #[error("Share blob is addressed to pid {expected}, but was decoded in pid {actual}")]
    WrongTarget { expected: u32, actual: u32 },
    #[error("Target process {0} has exited")]
    TargetGone(u32),
    #[error("Permission denied sharing the socket with pid {0}")]
    PermissionDenied(u32),
    #[error("Received handle is not the shared listening socket: {0}")]
    Mismatch(String),
    #[error("Invalid channel descriptor {fd}: {source}")]
    InvalidDescriptor { fd: RawFd, source: io::Error },
    #[error("Channel I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Cannot locate worker executable: {0}")]
    Executable(io::Error),
    #[error("Failed to launch worker '{program}': {source}")]
    Launch { program: String, source: io::Error },
    #[error("Failed to kill worker pid={pid}: {source}")]
    Kill { pid: u32, source: io::Error },
}

#[derive(Debug, Error)]
pub enum SupervisionError {
    #[error("Failed to create lifecycle group: {0}")]
    Create(io::Error),
    #[error("Failed to bind pid={pid} into the lifecycle group: {source}")]
    Bind { pid: u32, source: io::Error },
    #[error("pid={pid} is in process group {actual}, expected {expected}")]
    NotMember { pid: u32, expected: i32, actual: i32 },
    #[error("Lifecycle group is closed, refusing pid={pid}")]
    Closed { pid: u32 },
    #[error("Failed waiting for pid={pid}: {source}")]
    Wait { pid: u32, source: io::Error },
    #[error("Failed to terminate lifecycle group: {0}")]
    Terminate(io::Error),
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Failed to start request server runtime: {0}")]
    Runtime(io::Error),
    #[error("Request server failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration value for '{field}': {message}")]
    Invalid { field: &'static str, message: String },
}

/// Top-level error returned by the launcher entry points.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Supervision(#[from] SupervisionError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Serve(#[from] ServeError),
    #[error("Failed to listen on {addr}: {source}")]
    Listen { addr: SocketAddr, source: io::Error },
    #[error("Failed to install signal handlers: {0}")]
    Signal(io::Error),
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Spawn,
    Supervision,
    Transfer,
    Serve,
}

impl ErrorCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            ErrorCategory::Config => "Configuration",
            ErrorCategory::Spawn => "Spawn",
            ErrorCategory::Supervision => "Supervision",
            ErrorCategory::Transfer => "Transfer",
            ErrorCategory::Serve => "Serve",
        }
    }
}

impl LaunchError {
    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            LaunchError::Config(_) => ErrorCategory::Config,
            LaunchError::Spawn(_) => ErrorCategory::Spawn,
            LaunchError::Supervision(_) | LaunchError::Signal(_) => ErrorCategory::Supervision,
            LaunchError::Transfer(_) => ErrorCategory::Transfer,
            LaunchError::Serve(_) | LaunchError::Listen { .. } => ErrorCategory::Serve,
        }
    }

    /// Whether the failure stops the whole pool rather than a single worker.
    ///
    /// Transfer and serve failures only ever end the process they occur in.
    pub fn is_fatal_to_pool(&self) -> bool {
        !matches!(
            self.category(),
            ErrorCategory::Transfer | ErrorCategory::Serve
        )
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self.category() {
            ErrorCategory::Config => 2,
            _ => 1,
        }
    }
}
