//! # Proxy configuration
//!
//! Every field of the TOML file is optional. A missing value falls back to
//! the `DEFAULT_*` constants below, then the whole thing is validated into a
//! [`Config`], which is what the library consumes.
//!
//! ```toml
//! listen_address = "127.0.0.1"
//! listen_port = 1990
//! worker_count = 4
//! dns_ttl_seconds = 3600
//! log_level = "info,fwdproxy_lib::dns=debug"
//! ```
use std::{
    fs,
    net::{AddrParseError, IpAddr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_LISTEN_PORT: u16 = 1990;

/// size of every receive and send chunk
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// number of request slots allocated up front
pub const DEFAULT_REQUEST_POOL_STATIC: usize = 256;

/// number of request slots added each time the pool grows
pub const DEFAULT_REQUEST_POOL_DYNAMIC: usize = 256;

/// idle chunks kept by the buffer pool, surplus chunks are freed
pub const DEFAULT_MAX_IDLE_BUFFERS: usize = 1024;

/// number of accepts kept armed on the listener
pub const DEFAULT_INITIAL_ACCEPTS: usize = 64;

pub const DEFAULT_DNS_TTL_SECONDS: u64 = 3600;
pub const DEFAULT_RESOLVER_THREADS: usize = 2;
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 10;

/// 0 disables the periodic statistics log
pub const DEFAULT_STATISTICS_INTERVAL_SECONDS: u64 = 0;

pub const DEFAULT_LOG_TARGET: &str = "stdout";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read configuration file {path}: {error}")]
    Read { path: String, error: std::io::Error },
    #[error("could not parse configuration: {0}")]
    Deserialize(#[from] toml::de::Error),
    #[error("invalid listen address {address}: {error}")]
    InvalidAddress {
        address: String,
        error: AddrParseError,
    },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

/// The configuration as written in the TOML file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen_address: Option<String>,
    pub listen_port: Option<u16>,
    pub worker_count: Option<usize>,
    pub buffer_size: Option<usize>,
    pub request_pool_static: Option<usize>,
    pub request_pool_dynamic: Option<usize>,
    pub max_idle_buffers: Option<usize>,
    pub initial_accepts: Option<usize>,
    pub dns_ttl_seconds: Option<u64>,
    pub resolver_threads: Option<usize>,
    pub connect_timeout_seconds: Option<u64>,
    pub statistics_interval_seconds: Option<u64>,
    pub log_target: Option<String>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load_from_path(path: &str) -> Result<FileConfig, ConfigError> {
        let data = fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_owned(),
            error,
        })?;

        let config = Self::from_toml(&data)?;
        debug!("loaded configuration from {}", path);
        Ok(config)
    }

    pub fn from_toml(data: &str) -> Result<FileConfig, ConfigError> {
        Ok(toml::from_str(data)?)
    }

    /// fills the blanks with defaults and checks every value
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let address = self
            .listen_address
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_owned());
        let ip: IpAddr = address
            .parse()
            .map_err(|error| ConfigError::InvalidAddress {
                address: address.clone(),
                error,
            })?;

        let config = Config {
            listen_address: SocketAddr::new(ip, self.listen_port.unwrap_or(DEFAULT_LISTEN_PORT)),
            worker_count: self.worker_count.unwrap_or_else(num_cpus::get),
            buffer_size: self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            request_pool_static: self
                .request_pool_static
                .unwrap_or(DEFAULT_REQUEST_POOL_STATIC),
            request_pool_dynamic: self
                .request_pool_dynamic
                .unwrap_or(DEFAULT_REQUEST_POOL_DYNAMIC),
            max_idle_buffers: self.max_idle_buffers.unwrap_or(DEFAULT_MAX_IDLE_BUFFERS),
            initial_accepts: self.initial_accepts.unwrap_or(DEFAULT_INITIAL_ACCEPTS),
            dns_ttl_seconds: self.dns_ttl_seconds.unwrap_or(DEFAULT_DNS_TTL_SECONDS),
            resolver_threads: self.resolver_threads.unwrap_or(DEFAULT_RESOLVER_THREADS),
            connect_timeout_seconds: self
                .connect_timeout_seconds
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECONDS),
            statistics_interval_seconds: self
                .statistics_interval_seconds
                .unwrap_or(DEFAULT_STATISTICS_INTERVAL_SECONDS),
            log_target: self
                .log_target
                .unwrap_or_else(|| DEFAULT_LOG_TARGET.to_owned()),
            log_level: self
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned()),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Validated configuration, consumed by the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub listen_address: SocketAddr,
    pub worker_count: usize,
    pub buffer_size: usize,
    pub request_pool_static: usize,
    pub request_pool_dynamic: usize,
    pub max_idle_buffers: usize,
    pub initial_accepts: usize,
    pub dns_ttl_seconds: u64,
    pub resolver_threads: usize,
    pub connect_timeout_seconds: u64,
    pub statistics_interval_seconds: u64,
    pub log_target: String,
    pub log_level: String,
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("worker_count", self.worker_count),
            ("buffer_size", self.buffer_size),
            ("request_pool_dynamic", self.request_pool_dynamic),
            ("initial_accepts", self.initial_accepts),
            ("resolver_threads", self.resolver_threads),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        if self.connect_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connect_timeout_seconds",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    pub fn dns_ttl(&self) -> Duration {
        Duration::from_secs(self.dns_ttl_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn statistics_interval(&self) -> Option<Duration> {
        match self.statistics_interval_seconds {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_address: SocketAddr::new(
                IpAddr::from([127, 0, 0, 1]),
                DEFAULT_LISTEN_PORT,
            ),
            worker_count: num_cpus::get(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            request_pool_static: DEFAULT_REQUEST_POOL_STATIC,
            request_pool_dynamic: DEFAULT_REQUEST_POOL_DYNAMIC,
            max_idle_buffers: DEFAULT_MAX_IDLE_BUFFERS,
            initial_accepts: DEFAULT_INITIAL_ACCEPTS,
            dns_ttl_seconds: DEFAULT_DNS_TTL_SECONDS,
            resolver_threads: DEFAULT_RESOLVER_THREADS,
            connect_timeout_seconds: DEFAULT_CONNECT_TIMEOUT_SECONDS,
            statistics_interval_seconds: DEFAULT_STATISTICS_INTERVAL_SECONDS,
            log_target: DEFAULT_LOG_TARGET.to_owned(),
            log_level: DEFAULT_LOG_LEVEL.to_owned(),
        }
    }
}
