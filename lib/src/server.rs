//! The proxy: a reactor thread, a few worker threads draining the
//! completion queue, and the services they share.
//!
//! Workers never block on anything but the completion queue. A completion
//! keyed [`RoutingKey::System`] is an accepted connection or the exit
//! sentinel; anything else is routed to the request owning the ticket, if
//! that request is still the slot's occupant.
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{unbounded, Receiver};
use fwdproxy_command::config::Config;

use crate::{
    buffer::FixedChunkPool,
    dns::{AsyncResolver, DnsCache, Resolution, ResolveCallback},
    metrics::{Metrics, ProxyMetrics, StatisticsSnapshot, MAX_DESTINATIONS},
    operation::{AcceptOp, Completion, IoOperation, ResolveOp, RoutingKey, SocketId},
    pool::{ObjectPool, Ticket},
    reactor::{PollReactor, Reactor},
    request::Request,
};

pub type RequestPool = ObjectPool<Request>;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("could not create the reactor: {0}")]
    Reactor(io::Error),
    #[error("could not listen on {address}: {error}")]
    Bind {
        address: SocketAddr,
        error: io::Error,
    },
    #[error("could not start the resolver: {0}")]
    Resolver(io::Error),
    #[error("could not spawn thread: {0}")]
    SpawnThread(io::Error),
}

/// Everything a request needs besides its own state
pub struct Services {
    pub reactor: Arc<dyn Reactor>,
    pub dns_cache: DnsCache,
    pub resolver: AsyncResolver,
    pub buffers: FixedChunkPool,
    pub metrics: Metrics,
}

impl Services {
    /// Resolver results are pushed back on the completion queue, keyed to
    /// the request that asked.
    pub fn new(reactor: Arc<dyn Reactor>, config: &Config) -> io::Result<Arc<Services>> {
        let completions = reactor.clone();
        let callback: ResolveCallback = Arc::new(move |resolution: Resolution| {
            let Resolution {
                ticket,
                query,
                key,
                outcome,
            } = resolution;
            let completion = Completion {
                bytes_transferred: 0,
                key: RoutingKey::Session(ticket),
                operation: IoOperation::Resolve(ResolveOp {
                    query,
                    key,
                    outcome,
                }),
            };
            if let Err(error) = completions.post_completion(completion) {
                error!("could not deliver resolution for {}: {}", ticket, error);
            }
        });

        Ok(Arc::new(Services {
            reactor,
            dns_cache: DnsCache::new(config.dns_ttl()),
            resolver: AsyncResolver::new(config.resolver_threads, callback)?,
            buffers: FixedChunkPool::new(config.buffer_size, config.max_idle_buffers),
            metrics: Metrics::new(MAX_DESTINATIONS),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Exit,
}

/// Routes completions to requests. Shared by every worker.
pub struct Dispatcher {
    services: Arc<Services>,
    pool: RequestPool,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>, pool_static: usize, pool_dynamic: usize) -> Dispatcher {
        let factory_services = services.clone();
        Dispatcher {
            services,
            pool: RequestPool::new(pool_static, pool_dynamic, move || {
                Request::new(factory_services.clone())
            }),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// requests currently occupying a pool slot
    pub fn active_requests(&self) -> usize {
        self.pool.len()
    }

    pub fn dispatch(&self, completion: Completion) -> Dispatch {
        let Completion {
            bytes_transferred,
            key,
            operation,
        } = completion;

        match (key, operation) {
            (_, IoOperation::Exit) => Dispatch::Exit,
            (RoutingKey::System, IoOperation::Accept(op)) => {
                self.on_accept(op);
                Dispatch::Continue
            }
            (RoutingKey::System, operation) => {
                warn!("unexpected {} completion without session", operation.kind());
                self.services.buffers.checkin_all(operation.into_buffers());
                Dispatch::Continue
            }
            (RoutingKey::Session(ticket), operation) => {
                self.on_session(ticket, bytes_transferred, operation);
                Dispatch::Continue
            }
        }
    }

    fn on_accept(&self, op: AcceptOp) {
        // keep the listener armed whatever happens to this connection
        if let Err(error) = self.services.reactor.post_accept(op.listener) {
            error!("could not re-arm accept on {}: {}", op.listener, error);
        }

        let (ticket, node) = self.pool.allocate();
        if let Err(error) = self
            .services
            .reactor
            .set_key(op.socket, RoutingKey::Session(ticket))
        {
            error!("could not route accepted socket {}: {}", op.socket, error);
            self.services.reactor.shutdown(op.socket);
            self.pool.deallocate(ticket);
            return;
        }

        let mut request = node.lock();
        request.init(ticket, op.socket, op.peer);
        request.start();
        let deleted = request.is_deleted();
        // released unlocked, so that allocate sees the slot as recyclable
        drop(request);
        if deleted {
            self.pool.deallocate(ticket);
        }
    }

    fn on_session(&self, ticket: Ticket, bytes_transferred: usize, operation: IoOperation) {
        let Some(node) = self.pool.get(ticket) else {
            trace!("dropping {} completion for stale ticket {}", operation.kind(), ticket);
            self.services.buffers.checkin_all(operation.into_buffers());
            return;
        };

        let mut request = node.lock();
        if request.ticket() != Some(ticket) || request.is_deleted() {
            trace!("dropping {} completion for finished request {}", operation.kind(), ticket);
            self.services.buffers.checkin_all(operation.into_buffers());
            return;
        }

        request.on_completion(bytes_transferred, operation);
        let deleted = request.is_deleted();
        drop(request);
        if deleted {
            self.pool.deallocate(ticket);
        }
    }
}

/// Blocks on the completion queue until the exit sentinel shows up
pub fn worker_loop(dispatcher: &Dispatcher, completions: &Receiver<Completion>) {
    loop {
        let completion = match completions.recv() {
            Ok(completion) => completion,
            Err(_) => {
                debug!("completion queue closed");
                return;
            }
        };
        if dispatcher.dispatch(completion) == Dispatch::Exit {
            return;
        }
    }
}

/// A running proxy. Dropping it stops everything.
pub struct Proxy {
    reactor: PollReactor,
    dispatcher: Arc<Dispatcher>,
    listener: SocketId,
    local_address: SocketAddr,
    reactor_thread: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    stopped: AtomicBool,
}

impl Proxy {
    pub fn start(config: &Config) -> Result<Proxy, ServerError> {
        let (sender, receiver) = unbounded();
        let reactor =
            PollReactor::new(sender, config.connect_timeout()).map_err(ServerError::Reactor)?;
        let listener = reactor
            .listen(config.listen_address)
            .map_err(|error| ServerError::Bind {
                address: config.listen_address,
                error,
            })?;
        let local_address = reactor
            .local_addr(listener)
            .unwrap_or(config.listen_address);

        let services = Services::new(Arc::new(reactor.clone()), config)
            .map_err(ServerError::Resolver)?;
        let dispatcher = Arc::new(Dispatcher::new(
            services,
            config.request_pool_static,
            config.request_pool_dynamic,
        ));

        let mut proxy = Proxy {
            reactor: reactor.clone(),
            dispatcher: dispatcher.clone(),
            listener,
            local_address,
            reactor_thread: None,
            workers: Vec::with_capacity(config.worker_count),
            stopped: AtomicBool::new(false),
        };

        proxy.reactor_thread = Some(reactor.spawn().map_err(ServerError::SpawnThread)?);

        for index in 0..config.worker_count.max(1) {
            let dispatcher = dispatcher.clone();
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("fwdproxy-worker-{index}"))
                .spawn(move || {
                    debug!("worker started");
                    worker_loop(&dispatcher, &receiver);
                    debug!("worker stopped");
                })
                .map_err(ServerError::SpawnThread)?;
            proxy.workers.push(worker);
        }

        for _ in 0..config.initial_accepts.max(1) {
            if let Err(error) = dispatcher.services().reactor.post_accept(listener) {
                error!("could not post accept: {}", error);
            }
        }

        info!(
            "proxy listening on {} with {} workers",
            local_address,
            proxy.workers.len()
        );
        Ok(proxy)
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    /// shared state, outlives the proxy threads
    pub fn services(&self) -> Arc<Services> {
        self.dispatcher.services().clone()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.dispatcher.services().metrics.statistics.snapshot()
    }

    pub fn metrics(&self) -> ProxyMetrics {
        self.dispatcher.services().metrics.dump()
    }

    pub fn active_requests(&self) -> usize {
        self.dispatcher.active_requests()
    }

    /// Stops the workers, then the reactor and the resolver. Can be called
    /// more than once.
    pub fn shutdown(&mut self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down the proxy");

        let services = self.dispatcher.services();
        services.reactor.shutdown(self.listener);
        for _ in 0..self.workers.len() {
            if let Err(error) = services.reactor.post_completion(Completion::exit()) {
                error!("could not post the exit sentinel: {}", error);
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("a worker thread panicked");
            }
        }

        self.reactor.stop();
        if let Some(reactor_thread) = self.reactor_thread.take() {
            if reactor_thread.join().is_err() {
                error!("the reactor thread panicked");
            }
        }
        services.resolver.shutdown();
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}
