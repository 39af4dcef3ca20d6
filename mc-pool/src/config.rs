//! # Pool and Client Configuration
//!
//! Purpose: Describe where the cache lives and how the pool behaves, and
//! resolve the transport selection once, before any slot exists.
//!
//! ## Design Principles
//! 1. **Plain Data**: Public fields plus `Default`, filled with struct-update syntax.
//! 2. **Fail Fast**: Contradictory transport options are rejected at construction.
//! 3. **Immutable Target**: The resolved `Target` never changes for a pool.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PoolError, PoolResult};

/// Host used when the TCP transport is selected without a host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Standard memcached port.
pub const DEFAULT_PORT: u16 = 11211;
/// Number of slots allocated at construction.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Resolved connection destination shared by every slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// TCP host and port.
    Tcp { host: String, port: u16 },
    /// Unix-domain socket path.
    Unix(PathBuf),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Target::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Per-connection settings handed to every client the pool creates.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Optional connect timeout. `None` waits as long as the OS does.
    pub connect_timeout: Option<Duration>,
    /// Optional timeout for one request/reply exchange.
    pub io_timeout: Option<Duration>,
    /// Expiry applied to stored items. `None` stores without expiry.
    pub default_ttl: Option<Duration>,
}

/// Construction options for `MemcachedPool`.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Slots allocated up front.
    pub pool_size: usize,
    /// TCP host. Mutually exclusive with `unix_path`.
    pub host: Option<String>,
    /// TCP port. Mutually exclusive with `unix_path`.
    pub port: Option<u16>,
    /// Unix socket path. Mutually exclusive with `host`/`port`.
    pub unix_path: Option<PathBuf>,
    /// Defer connecting each slot until it is first acquired.
    pub lazy_connect: bool,
    /// Optional ceiling on slot count. `None` grows without bound.
    pub max_size: Option<usize>,
    /// Settings for each pooled client.
    pub client: ClientConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            pool_size: DEFAULT_POOL_SIZE,
            host: None,
            port: None,
            unix_path: None,
            lazy_connect: false,
            max_size: None,
            client: ClientConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Validates the options and resolves the connection target.
    pub fn target(&self) -> PoolResult<Target> {
        if let Some(max) = self.max_size {
            if max < self.pool_size {
                return Err(PoolError::Configuration(format!(
                    "max_size {} is smaller than pool_size {}",
                    max, self.pool_size
                )));
            }
        }

        match (&self.unix_path, &self.host, self.port) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(PoolError::Configuration(
                "cannot use both unix_path and host/port".to_string(),
            )),
            (Some(path), None, None) => Ok(Target::Unix(path.clone())),
            (None, host, port) => Ok(Target::Tcp {
                host: host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: port.unwrap_or(DEFAULT_PORT),
            }),
        }
    }
}
