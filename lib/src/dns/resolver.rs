use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};

use crate::{
    dns::{cache_key, ResolveError},
    pool::Ticket,
};

/// The result of one `post_resolve`, handed to the callback by value
#[derive(Debug)]
pub struct Resolution {
    pub ticket: Ticket,
    pub query: u64,
    pub key: String,
    pub outcome: Result<Vec<SocketAddr>, ResolveError>,
}

pub type ResolveCallback = Arc<dyn Fn(Resolution) + Send + Sync>;

/// Resolves host names without blocking the caller.
///
/// Every accepted query invokes the callback exactly once. Literal IP
/// addresses complete synchronously, on the calling thread, before
/// `post_resolve` returns. Everything else completes on one of the resolver
/// threads.
pub struct AsyncResolver {
    runtime: Mutex<Option<Runtime>>,
    callback: ResolveCallback,
}

impl AsyncResolver {
    pub fn new(threads: usize, callback: ResolveCallback) -> io::Result<AsyncResolver> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("fwdproxy-resolver")
            .enable_all()
            .build()?;

        Ok(AsyncResolver {
            runtime: Mutex::new(Some(runtime)),
            callback,
        })
    }

    /// Returns `false` when the query could not be enqueued, in which case
    /// the callback will never run for it.
    pub fn post_resolve(&self, host: &str, port: u16, ticket: Ticket, query: u64) -> bool {
        let key = cache_key(host, port);

        if let Ok(ip) = host.parse::<IpAddr>() {
            (self.callback)(Resolution {
                ticket,
                query,
                key,
                outcome: Ok(vec![SocketAddr::new(ip, port)]),
            });
            return true;
        }

        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            error!("resolver is shut down, cannot resolve {}", key);
            return false;
        };

        let callback = self.callback.clone();
        let host = host.to_owned();
        runtime.spawn(async move {
            let outcome = match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addresses) => {
                    let addresses: Vec<SocketAddr> = addresses.collect();
                    if addresses.is_empty() {
                        Err(ResolveError::NoAddress(key.clone()))
                    } else {
                        Ok(addresses)
                    }
                }
                Err(error) => Err(ResolveError::Lookup {
                    host: host.clone(),
                    error,
                }),
            };
            debug!("resolved {}: {:?}", key, outcome);
            callback(Resolution {
                ticket,
                query,
                key,
                outcome,
            });
        });
        true
    }

    /// Drops pending queries, their callbacks never run
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for AsyncResolver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_channel::unbounded;
    use serial_test::serial;

    use super::*;

    fn resolver() -> (AsyncResolver, crossbeam_channel::Receiver<Resolution>) {
        let (tx, rx) = unbounded();
        let callback: ResolveCallback = Arc::new(move |resolution| {
            let _ = tx.send(resolution);
        });
        (AsyncResolver::new(1, callback).unwrap(), rx)
    }

    const TICKET: Ticket = Ticket {
        index: 7,
        generation: 2,
    };

    #[test]
    fn literal_address_completes_synchronously() {
        let (resolver, rx) = resolver();
        assert!(resolver.post_resolve("127.0.0.1", 8080, TICKET, 1));

        let resolution = rx.try_recv().expect("callback should already have run");
        assert_eq!(resolution.ticket, TICKET);
        assert_eq!(resolution.key, "127.0.0.1:8080");
        assert_eq!(
            resolution.outcome.unwrap(),
            vec![SocketAddr::from(([127, 0, 0, 1], 8080))]
        );
    }

    #[test]
    fn ipv6_literal() {
        let (resolver, rx) = resolver();
        assert!(resolver.post_resolve("::1", 443, TICKET, 2));
        let resolution = rx.try_recv().unwrap();
        assert_eq!(
            resolution.outcome.unwrap(),
            vec!["[::1]:443".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    #[serial]
    fn localhost_resolves_asynchronously() {
        let (resolver, rx) = resolver();
        assert!(resolver.post_resolve("localhost", 80, TICKET, 3));

        let resolution = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("resolver should call back");
        assert_eq!(resolution.query, 3);
        let addresses = resolution.outcome.expect("localhost should resolve");
        assert!(addresses.iter().all(|address| address.port() == 80));
        assert!(addresses.iter().any(|address| address.ip().is_loopback()));
    }

    #[test]
    #[serial]
    fn invalid_name_reports_failure() {
        let (resolver, rx) = resolver();
        assert!(resolver.post_resolve("does-not-exist.invalid", 80, TICKET, 4));
        let resolution = rx.recv_timeout(Duration::from_secs(30)).unwrap();
        assert!(resolution.outcome.is_err());
    }

    #[test]
    fn shut_down_resolver_rejects_queries() {
        let (resolver, rx) = resolver();
        resolver.shutdown();
        assert!(!resolver.post_resolve("localhost", 80, TICKET, 5));
        assert!(rx.try_recv().is_err());
    }
}
