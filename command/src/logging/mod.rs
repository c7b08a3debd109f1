//! fwdproxy logs
//!
//! A small logger behind the `log` facade. Lines look like
//! `2024-05-02T10:11:12.123456Z 4242 FWDPROXY INFO	message` and go to one
//! of the targets understood by [`target_to_backend`]. Levels follow the
//! `env_logger` directive syntax: `info,fwdproxy_lib::dns=trace`.

pub mod logs;

use std::net::AddrParseError;

pub use crate::logging::logs::*;

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("invalid log target {0}: {1}")]
    InvalidLogTarget(String, &'static str),
    #[error("invalid log target {0}: {1}")]
    InvalidSocketAddress(String, AddrParseError),
    #[error("could not open log file {0}: {1}")]
    OpenFile(String, std::io::Error),
    #[error("could not connect to TCP socket {0}: {1}")]
    TcpConnect(String, std::io::Error),
    #[error("could not bind to UDP socket: {0}")]
    UdpBind(std::io::Error),
    #[error("invalid log level directive {0}")]
    InvalidDirective(String),
    #[error("a logger is already installed")]
    AlreadyInstalled,
}
