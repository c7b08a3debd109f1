//! Configuration and logging shared by the fwdproxy binary, its library and
//! the end-to-end tests.
//!
//! - [`config`] turns an optional TOML file plus command-line overrides into a
//!   validated [`config::Config`]
//! - [`logging`] installs the process logger behind the `log` facade

#[macro_use]
extern crate log;

pub mod config;
pub mod logging;
