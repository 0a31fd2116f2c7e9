//! Launcher configuration
//!
//! Defaults, then an optional TOML file, then `PREFORK_*` environment
//! variables; command-line flags are applied on top by the binary.

use crate::error::ConfigError;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const DEFAULT_BIND_PORT: u16 = 1234;
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 10;
pub const MAX_WORKERS: usize = 256;

pub const ENV_PREFIX: &str = "PREFORK";
/// Worker invocation argument naming the inherited channel descriptor.
pub const CHANNEL_FD_ARG: &str = "--channel-fd";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Number of worker processes; `0` serves from the coordinator itself.
    pub worker_count: usize,
    /// Bound on each handle-transfer read/write; `0` waits forever.
    pub transfer_timeout_secs: u64,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    /// Log every request and response.
    pub debug: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR,
            port: DEFAULT_BIND_PORT,
            worker_count: DEFAULT_WORKER_COUNT,
            transfer_timeout_secs: DEFAULT_TRANSFER_TIMEOUT_SECS,
            log_level: None,
            log_file: None,
            debug: false,
        }
    }
}

impl LauncherConfig {
    /// Load from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX).try_parsing(true),
        );

        let loaded: LauncherConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count > MAX_WORKERS {
            return Err(ConfigError::Invalid {
                field: "worker_count",
                message: format!("{} exceeds the maximum of {}", self.worker_count, MAX_WORKERS),
            });
        }
        if let Some(level) = &self.log_level {
            if level.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "log_level",
                    message: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        match self.transfer_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
