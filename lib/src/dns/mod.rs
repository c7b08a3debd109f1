//! Name resolution: a shared cache of known-good addresses and an
//! asynchronous resolver whose results come back as completions.
pub mod cache;
pub mod resolver;

pub use cache::DnsCache;
pub use resolver::{AsyncResolver, Resolution, ResolveCallback};

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("lookup of {host} failed: {error}")]
    Lookup { host: String, error: std::io::Error },
    #[error("no address found for {0}")]
    NoAddress(String),
}

/// the cache key of a destination
pub fn cache_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}
