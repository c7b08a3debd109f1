//! ## What this library does
//!
//! `fwdproxy-lib` is a forward proxy for HTTP/1.x and for HTTPS through
//! `CONNECT` tunnels. Browsers are configured to use it as their proxy; it
//! reads their requests, rewrites them for the origin server, connects to
//! the origin and relays bytes both ways.
//!
//! ## How it is organized
//!
//! All socket I/O goes through a [`reactor::Reactor`]: sessions post
//! operations (accept, connect, receive, send) and get each of them back
//! exactly once as a [`operation::Completion`] on a shared queue. A fixed
//! set of worker threads drains that queue and hands every completion to
//! the [`request::Request`] it belongs to, found through the
//! [`pool::Ticket`] the socket was associated with.
//!
//! Name resolution is asynchronous too: [`dns::AsyncResolver`] pushes its
//! results on the same queue, and addresses that worked are remembered in
//! a [`dns::DnsCache`] whose entries live as long as they keep being used.
//!
//! ## Starting a proxy
//!
//! ```no_run
//! use fwdproxy_command::config::Config;
//! use fwdproxy_lib::server::Proxy;
//!
//! let config = Config::default();
//! let mut proxy = Proxy::start(&config).expect("could not start the proxy");
//! println!("listening on {}", proxy.local_address());
//! proxy.shutdown();
//! ```
#[macro_use]
extern crate log;

#[macro_use]
pub mod metrics;

pub mod buffer;
pub mod dns;
pub mod operation;
pub mod pool;
pub mod protocol;
pub mod reactor;
pub mod request;
pub mod server;

pub use crate::server::{Proxy, ServerError};
