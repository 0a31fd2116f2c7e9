//! Command-line interface.

use crate::config::LauncherConfig;
use crate::error::ConfigError;
use crate::launcher::Role;
use clap::Parser;
use std::ffi::OsString;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// Pre-fork HTTP worker pool: one listening socket shared by N worker processes.
#[derive(Parser, Debug, Clone, Default, PartialEq, Eq)]
#[command(name = "prefork", version, about)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to bind the listening socket to
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<IpAddr>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker processes; 0 serves from this process
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Seconds to wait for each socket hand-off; 0 waits forever
    #[arg(long, value_name = "SECS")]
    pub transfer_timeout: Option<u64>,

    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Append log output to this file as well
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log every request and response
    #[arg(long)]
    pub debug: bool,

    /// Inherited channel descriptor; set by the coordinator when starting a worker
    #[arg(long = "channel-fd", value_name = "FD", hide = true)]
    pub channel_fd: Option<RawFd>,
}

impl Cli {
    /// Parse arguments (for tests or custom argv).
    pub fn try_parse_args_from<I, T>(iter: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(iter)
    }

    pub fn role(&self) -> Role {
        match self.channel_fd {
            Some(channel_fd) => Role::Worker { channel_fd },
            None => Role::Coordinator,
        }
    }

    /// Apply command-line overrides on top of a loaded configuration.
    pub fn apply(&self, mut config: LauncherConfig) -> Result<LauncherConfig, ConfigError> {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.workers {
            config.worker_count = workers;
        }
        if let Some(timeout) = self.transfer_timeout {
            config.transfer_timeout_secs = timeout;
        }
        if let Some(level) = &self.log_level {
            config.log_level = Some(level.clone());
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.clone());
        }
        if self.debug {
            config.debug = true;
        }

        config.validate()?;
        Ok(config)
    }
}
