//! One browser connection and the upstream connection serving it.
//!
//! A `Request` is driven exclusively by completions: every entry point runs
//! on a worker thread holding the slot lock, posts new operations, and
//! returns. Nothing here blocks or touches a socket directly.
//!
//! Rough life of a plain HTTP request:
//!
//! ```plain
//! start -> recv browser* -> headers parsed -> cache hit?  -> connect -> recv server / recv browser
//!                                         \-> resolve --/          \-> relay both ways until a side closes
//! ```
//!
//! A `CONNECT` request goes the same way but the browser gets the
//! `200 Connection Established` banner once the upstream connection is up,
//! and from then on bytes are relayed untouched.
mod legs;


use std::{
    collections::VecDeque,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use rusty_ulid::Ulid;
use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    buffer::ByteBuffer,
    operation::{ConnectOp, IoOperation, RecvOp, ResolveOp, Role, RoutingKey, SendOp, SocketId},
    pool::{Recyclable, Ticket},
    protocol::{
        absolute_authority, find_header_end, split_host, to_origin_form, ChunkedFraming, Headers,
        CONNECT_ESTABLISHED, CONNECT_PREFIX, HTTPS_DEFAULT_PORT, HTTP_DEFAULT_PORT,
        MAX_HEADER_SIZE, RESPONSE_PREFIX,
    },
    reactor::ReactorError,
    server::Services,
};

pub use self::legs::{BrowserLeg, Destination, ServerLeg, ServerSocket};

/// This macro is defined uniquely in this module to help the tracking of
/// a session across workers
macro_rules! log_context {
    ($self:expr) => {
        format!(
            "REQUEST\t{}\tSession(ticket={}, peer={}, browser={}, server={}, destination={})\t >>>",
            $self.id,
            $self
                .ticket
                .map(|ticket| ticket.to_string())
                .unwrap_or_else(|| "<none>".to_string()),
            $self
                .peer
                .map(|peer| peer.to_string())
                .unwrap_or_else(|| "<none>".to_string()),
            $self
                .browser
                .as_ref()
                .map(|leg| leg.socket.to_string())
                .unwrap_or_else(|| "<none>".to_string()),
            $self.server,
            $self
                .destination
                .as_ref()
                .map(|destination| destination.full_name())
                .unwrap_or_else(|| "<none>".to_string()),
        )
    };
}

/// longest request line prefix written to the logs
const MAX_LOGGED_REQUEST_LINE: usize = 100;
/// the accumulation buffer is shrunk back when it grew past this
const RETAINED_BUFFER_CAPACITY: usize = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("the request is not bound to a pool slot")]
    Unbound,
    #[error("no {0} socket")]
    NoSocket(Role),
    #[error("no destination for this request")]
    NoDestination,
    #[error("no Host header and no absolute target")]
    MissingHost,
    #[error("invalid host {0:?}")]
    InvalidHost(String),
    #[error("header block of {0} bytes or more is too large")]
    HeadersTooLarge(usize),
    #[error("malformed chunked body")]
    MalformedChunkedBody,
    #[error("could not create socket: {0}")]
    CreateSocket(io::Error),
    #[error("could not bind socket: {0}")]
    Bind(io::Error),
    #[error("could not associate socket: {0}")]
    Associate(ReactorError),
    #[error("could not connect to {target}: {error}")]
    Connect {
        target: SocketAddr,
        error: ReactorError,
    },
    #[error("could not enqueue the resolution of {0}")]
    ResolveEnqueue(String),
    #[error("could not post {role} receive: {error}")]
    PostRecv { role: Role, error: ReactorError },
    #[error("could not post {role} send: {error}")]
    PostSend { role: Role, error: ReactorError },
}

pub struct Request {
    services: Arc<Services>,
    id: Ulid,
    ticket: Option<Ticket>,
    peer: Option<SocketAddr>,
    browser: Option<BrowserLeg>,
    server: ServerLeg,
    destination: Option<Destination>,
    headers: Headers,
    /// bytes received from the browser since the last parse reset
    buffer: Vec<u8>,
    /// no header block ends before this offset of `buffer`
    scanned: usize,
    /// end of the current upload, header bytes included
    btotal: usize,
    /// bytes of the current upload received so far
    brx: usize,
    /// framing of a chunked upload
    chunked: Option<ChunkedFraming>,
    next_seq: u64,
    created_at: Instant,
    deleted: bool,
    deleted_at: Option<Instant>,
}

impl Recyclable for Request {
    fn is_recyclable(&self) -> bool {
        self.deleted || self.ticket.is_none()
    }
}

impl Request {
    pub fn new(services: Arc<Services>) -> Request {
        Request {
            services,
            id: Ulid::generate(),
            ticket: None,
            peer: None,
            browser: None,
            server: ServerLeg::Idle,
            destination: None,
            headers: Headers::default(),
            buffer: Vec::new(),
            scanned: 0,
            btotal: 0,
            brx: 0,
            chunked: None,
            next_seq: 0,
            created_at: Instant::now(),
            deleted: false,
            deleted_at: None,
        }
    }

    /// Binds a recycled or fresh slot to a newly accepted browser socket
    pub fn init(&mut self, ticket: Ticket, socket: SocketId, peer: SocketAddr) {
        self.reset();
        self.id = Ulid::generate();
        self.ticket = Some(ticket);
        self.peer = Some(peer);
        self.browser = Some(BrowserLeg {
            socket,
            pending_recv: None,
        });
        self.created_at = Instant::now();
        self.deleted = false;
        self.deleted_at = None;
        gauge_add!(self.services.metrics, "requests.active", 1);
        debug!("{} new browser connection", log_context!(self));
    }

    pub fn ticket(&self) -> Option<Ticket> {
        self.ticket
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn deleted_at(&self) -> Option<Instant> {
        self.deleted_at
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn server_leg(&self) -> &ServerLeg {
        &self.server
    }

    /// Starts reading from the browser
    pub fn start(&mut self) {
        trace!("{} ============== start", log_context!(self));
        self.handle_browser(&[]);
    }

    /// Entry point for every completion routed to this request
    pub fn on_completion(&mut self, bytes_transferred: usize, operation: IoOperation) {
        if self.deleted {
            self.recycle(operation);
            return;
        }

        match operation {
            IoOperation::Recv(op) => self.on_recv_completed(op, bytes_transferred),
            IoOperation::Send(op) => self.on_send_completed(op, bytes_transferred),
            IoOperation::Connect(op) => self.on_connect_completed(op),
            IoOperation::Resolve(op) => self.on_resolve_completed(op),
            operation @ (IoOperation::Accept(_) | IoOperation::Exit) => {
                warn!(
                    "{} unexpected {} completion",
                    log_context!(self),
                    operation.kind()
                );
            }
        }
    }

    fn recycle(&self, operation: IoOperation) {
        self.services.buffers.checkin_all(operation.into_buffers());
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn handle_browser(&mut self, data: &[u8]) {
        trace!("{} ============== handle_browser", log_context!(self));
        self.buffer.extend_from_slice(data);

        match self.try_parsing_headers() {
            Ok(true) => {}
            Ok(false) => {
                if let Err(error) = self.post_recv(Role::Browser) {
                    error!("{} {}", log_context!(self), error);
                    self.delete_this();
                }
                return;
            }
            Err(error) => {
                error!("{} {}", log_context!(self), error);
                self.delete_this();
                return;
            }
        }

        self.print_request();
        if !self.headers.keep_alive() {
            debug!("{} the browser asked to close after this exchange", log_context!(self));
        }
        self.services.metrics.statistics.add_request();
        incr!(self.services.metrics, "requests");

        if let Err(error) = self.route_request() {
            error!("{} {}", log_context!(self), error);
            self.delete_this();
        }
    }

    fn route_request(&mut self) -> Result<(), RequestError> {
        if self.buffer.starts_with(CONNECT_PREFIX) {
            self.prepare_tunnel()?;
        } else {
            self.filter_browser_headers()?;
        }
        self.handle_server()
    }

    /// Parses the header block once its end arrived. Only the bytes received
    /// since the previous attempt are searched for the terminator.
    fn try_parsing_headers(&mut self) -> Result<bool, RequestError> {
        let Some(body_offset) = find_header_end(&self.buffer, self.scanned) else {
            self.scanned = self.buffer.len();
            if self.buffer.len() >= MAX_HEADER_SIZE {
                return Err(RequestError::HeadersTooLarge(self.buffer.len()));
            }
            return Ok(false);
        };
        if body_offset > MAX_HEADER_SIZE {
            return Err(RequestError::HeadersTooLarge(body_offset));
        }
        self.scanned = 0;
        if !self.headers.parse(&self.buffer) {
            return Ok(false);
        }

        let content_length = self.headers.content_length();
        self.brx = self.buffer.len();
        self.btotal = body_offset + content_length.unwrap_or(0);
        self.chunked = (content_length.is_none() && self.headers.is_chunked())
            .then(ChunkedFraming::default);
        if let Some(framing) = self.chunked.as_mut() {
            framing.feed(&self.buffer[body_offset..]);
            if framing.is_malformed() {
                return Err(RequestError::MalformedChunkedBody);
            }
        }
        Ok(true)
    }

    fn request_line(&self) -> String {
        let end = memchr::memmem::find(&self.buffer, b"\r\n").unwrap_or(self.buffer.len());
        String::from_utf8_lossy(&self.buffer[..end]).into_owned()
    }

    fn print_request(&self) {
        let line = self.request_line();
        let mut end = line.len().min(MAX_LOGGED_REQUEST_LINE);
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        info!("{} {}", log_context!(self), &line[..end]);
    }

    fn prepare_tunnel(&mut self) -> Result<(), RequestError> {
        let line = self.request_line();
        let authority = line[CONNECT_PREFIX.len()..]
            .split(' ')
            .next()
            .unwrap_or_default();
        let (name, port) = split_host(authority, HTTPS_DEFAULT_PORT)
            .ok_or_else(|| RequestError::InvalidHost(authority.to_owned()))?;

        self.destination = Some(Destination {
            name,
            port,
            tunnel: true,
        });
        self.shutdown_server_socket();
        Ok(())
    }

    /// Rewrites the buffered request for the origin server: origin-form
    /// request line, no `Proxy-Connection`, whose value moves to
    /// `Connection` when the latter is absent.
    fn filter_browser_headers(&mut self) -> Result<(), RequestError> {
        let line = self.request_line();
        let host = match self.headers.get("Host") {
            Some(host) => host.to_owned(),
            None => absolute_authority(&line)
                .map(str::to_owned)
                .ok_or(RequestError::MissingHost)?,
        };
        let (name, port) = split_host(&host, HTTP_DEFAULT_PORT)
            .ok_or_else(|| RequestError::InvalidHost(host.clone()))?;

        if let Some(value) = self.headers.remove("Proxy-Connection") {
            if !self.headers.contains("Connection") {
                self.headers.insert("Connection", &value);
            }
        }

        let body_offset = self.headers.body_offset().unwrap_or(self.buffer.len());
        let mut rewritten = Vec::with_capacity(self.buffer.len());
        rewritten.extend_from_slice(to_origin_form(&line).as_bytes());
        rewritten.extend_from_slice(b"\r\n");
        self.headers.write_fields(&mut rewritten);
        rewritten.extend_from_slice(&self.buffer[body_offset..]);
        self.buffer = rewritten;

        let destination = Destination {
            name,
            port,
            tunnel: false,
        };
        let changed = self
            .destination
            .as_ref()
            .map(|previous| !previous.same_host(&destination))
            .unwrap_or(true);
        if changed && self.server.connected().is_some() {
            debug!(
                "{} destination changed to {}, closing the server connection",
                log_context!(self),
                destination.full_name()
            );
            self.shutdown_server_socket();
        }
        self.destination = Some(destination);
        Ok(())
    }

    fn handle_server(&mut self) -> Result<(), RequestError> {
        match self.server {
            ServerLeg::Connected(_) => match self.do_handle_server() {
                Ok(()) => {
                    debug!("{} reusing the server connection", log_context!(self));
                    return self.post_recv(Role::Browser);
                }
                Err(error) => {
                    warn!(
                        "{} could not reuse the server connection: {}",
                        log_context!(self),
                        error
                    );
                    self.shutdown_server_socket();
                }
            },
            ServerLeg::Idle => {}
            // leftovers of an abandoned request
            ServerLeg::Resolving { .. } | ServerLeg::Connecting { .. } => {
                self.shutdown_server_socket()
            }
        }

        if self.try_dns_cache()? {
            return Ok(());
        }
        self.post_dns_query()
    }

    /// Forwards the buffered request on the existing server connection
    fn do_handle_server(&mut self) -> Result<(), RequestError> {
        let chunks = self.services.buffers.copy_into_chunks(&self.buffer);
        self.send_to(Role::Server, chunks)?;

        if let Some(server) = self.server.connected_mut() {
            server.response_seen = false;
            debug_assert!(server.pending_recv.is_some());
        }
        if self.is_upload_done() {
            self.on_upload_done();
        }
        Ok(())
    }

    fn try_dns_cache(&mut self) -> Result<bool, RequestError> {
        let key = self
            .destination
            .as_ref()
            .map(Destination::full_name)
            .ok_or(RequestError::NoDestination)?;

        self.services.metrics.statistics.add_dns_query();
        incr!(self.services.metrics, "dns.queries");

        match self.services.dns_cache.resolve(&key) {
            Some(address) => {
                self.services.metrics.statistics.add_dns_cache_hit();
                incr!(self.services.metrics, "dns.cache_hit");
                debug!("{} dns cache hit: {}", log_context!(self), address);
                self.post_connect(VecDeque::from([address]));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn post_dns_query(&mut self) -> Result<(), RequestError> {
        let ticket = self.ticket.ok_or(RequestError::Unbound)?;
        let (name, port) = self
            .destination
            .as_ref()
            .map(|destination| (destination.name.clone(), destination.port))
            .ok_or(RequestError::NoDestination)?;

        let query = self.next_seq();
        self.server = ServerLeg::Resolving { query };
        debug!("{} resolving {}:{}", log_context!(self), name, port);

        if !self.services.resolver.post_resolve(&name, port, ticket, query) {
            self.server = ServerLeg::Idle;
            return Err(RequestError::ResolveEnqueue(format!("{name}:{port}")));
        }
        Ok(())
    }

    fn on_resolve_completed(&mut self, op: ResolveOp) {
        match self.server {
            ServerLeg::Resolving { query } if query == op.query => {}
            _ => {
                debug!(
                    "{} dropping stale resolution #{} of {}",
                    log_context!(self),
                    op.query,
                    op.key
                );
                return;
            }
        }
        self.server = ServerLeg::Idle;

        match op.outcome {
            Ok(addresses) => {
                debug!("{} {} resolved to {:?}", log_context!(self), op.key, addresses);
                self.post_connect(addresses.into());
            }
            Err(error) => {
                warn!("{} {}", log_context!(self), error);
                incr!(self.services.metrics, "dns.errors");
                self.delete_this();
            }
        }
    }

    /// Tries the candidates in order until a connect could be posted.
    /// Exhausting them tears the request down.
    fn post_connect(&mut self, mut candidates: VecDeque<SocketAddr>) {
        while let Some(target) = candidates.pop_front() {
            match self.start_connect(target) {
                Ok(socket) => {
                    self.server = ServerLeg::Connecting {
                        socket,
                        target,
                        candidates,
                    };
                    return;
                }
                Err(error @ RequestError::Connect { .. }) => {
                    info!("{} {}", log_context!(self), error);
                }
                Err(error) => {
                    error!("{} {}", log_context!(self), error);
                    self.delete_this();
                    return;
                }
            }
        }

        warn!("{} no address left to connect to", log_context!(self));
        self.delete_this();
    }

    fn start_connect(&mut self, target: SocketAddr) -> Result<SocketId, RequestError> {
        let ticket = self.ticket.ok_or(RequestError::Unbound)?;
        let destination = self.destination.as_ref().ok_or(RequestError::NoDestination)?;
        let key = destination.full_name();
        let tunnel = destination.tunnel;

        let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))
            .map_err(RequestError::CreateSocket)?;
        socket
            .set_nonblocking(true)
            .map_err(RequestError::CreateSocket)?;
        let wildcard: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        socket
            .bind(&wildcard.into())
            .map_err(RequestError::Bind)?;

        let socket = self
            .services
            .reactor
            .associate(socket, RoutingKey::Session(ticket))
            .map_err(RequestError::Associate)?;

        self.services.dns_cache.add(&key, target);

        let initial = if tunnel {
            Vec::new()
        } else {
            self.services.buffers.copy_into_chunks(&self.buffer)
        };

        if let Err(error) = self
            .services
            .reactor
            .post_connect(ConnectOp::new(socket, target, initial))
        {
            self.services.reactor.shutdown(socket);
            self.services.dns_cache.remove(&key);
            incr!(self.services.metrics, "connect.errors", &key);
            return Err(RequestError::Connect { target, error });
        }

        debug!("{} connecting to {}", log_context!(self), target);
        Ok(socket)
    }

    fn on_connect_completed(&mut self, op: ConnectOp) {
        let (socket, target, candidates) = match std::mem::take(&mut self.server) {
            ServerLeg::Connecting {
                socket,
                target,
                candidates,
            } if socket == op.socket => (socket, target, candidates),
            other => {
                self.server = other;
                debug!(
                    "{} dropping stale connect completion for {}",
                    log_context!(self),
                    op.socket
                );
                self.recycle(IoOperation::Connect(op));
                return;
            }
        };

        let ConnectOp {
            initial,
            requested,
            sent,
            connected,
            started,
            ..
        } = op;
        self.services.buffers.checkin_all(initial);

        let Some(destination) = self.destination.clone() else {
            self.services.reactor.shutdown(socket);
            self.delete_this();
            return;
        };
        let key = destination.full_name();

        if !connected {
            info!("{} could not connect to {}", log_context!(self), target);
            self.services.dns_cache.remove(&key);
            self.services.reactor.shutdown(socket);
            incr!(self.services.metrics, "connect.errors", &key);
            self.post_connect(candidates);
            return;
        }

        time!(
            self.services.metrics,
            "connect_time",
            started.elapsed().as_millis() as usize,
            &key
        );

        if !destination.tunnel && sent < requested {
            error!(
                "{} only {} of {} request bytes were sent while connecting",
                log_context!(self),
                sent,
                requested
            );
            self.services.reactor.shutdown(socket);
            self.delete_this();
            return;
        }

        self.server = ServerLeg::Connected(ServerSocket {
            socket,
            target,
            pending_recv: None,
            response_seen: false,
        });
        info!("{} connected to {}", log_context!(self), target);

        if sent > 0 {
            self.services.metrics.statistics.add_out_bytes(sent);
        }

        if let Err(error) = self.post_recv(Role::Server) {
            error!("{} {}", log_context!(self), error);
            self.delete_this();
            return;
        }

        if destination.tunnel {
            if let Err(error) = self.establish_tunnel() {
                error!("{} {}", log_context!(self), error);
                self.delete_this();
                return;
            }
        } else if self.is_upload_done() {
            self.on_upload_done();
        }

        if let Err(error) = self.post_recv(Role::Browser) {
            error!("{} {}", log_context!(self), error);
            self.delete_this();
        }
    }

    /// Sends the banner to the browser, then whatever the browser sent
    /// after its CONNECT header block to the server
    fn establish_tunnel(&mut self) -> Result<(), RequestError> {
        let banner = self.services.buffers.copy_into_chunks(CONNECT_ESTABLISHED);
        self.send_to(Role::Browser, banner)?;

        let body_offset = self.headers.body_offset().unwrap_or(self.buffer.len());
        if body_offset < self.buffer.len() {
            let early = self
                .services
                .buffers
                .copy_into_chunks(&self.buffer[body_offset..]);
            self.send_to(Role::Server, early)?;
        }
        self.buffer.clear();
        Ok(())
    }

    fn on_recv_completed(&mut self, op: RecvOp, bytes: usize) {
        let role = if self.browser.as_ref().map(|leg| leg.socket) == Some(op.socket) {
            Role::Browser
        } else if self.server.connected().map(|server| server.socket) == Some(op.socket) {
            Role::Server
        } else {
            debug!("{} hanging recv op on {}", log_context!(self), op.socket);
            self.services.buffers.checkin(op.buffer);
            return;
        };

        let pending = match role {
            Role::Browser => self.browser.as_mut().map(|leg| &mut leg.pending_recv),
            Role::Server => self.server.connected_mut().map(|server| &mut server.pending_recv),
        };
        match pending {
            Some(pending) if *pending == Some(op.seq) => *pending = None,
            _ => {
                debug!(
                    "{} dropping unexpected {} recv completion #{}",
                    log_context!(self),
                    role,
                    op.seq
                );
                self.services.buffers.checkin(op.buffer);
                return;
            }
        }

        let tunnel = self
            .destination
            .as_ref()
            .map(|destination| destination.tunnel)
            .unwrap_or(false);

        if bytes == 0 {
            self.services.buffers.checkin(op.buffer);
            match role {
                Role::Browser => {
                    info!("{} browser disconnected", log_context!(self));
                    self.delete_this();
                }
                Role::Server => {
                    info!("{} server disconnected", log_context!(self));
                    self.shutdown_server_socket();
                }
            }
            return;
        }

        trace!("{} received {} bytes from the {}", log_context!(self), bytes, role);
        self.services.metrics.statistics.add_in_bytes(bytes);

        match role {
            Role::Browser if !self.headers.is_ok() => {
                // handle_browser posts the next receive itself
                self.handle_browser(op.buffer.filled());
                self.services.buffers.checkin(op.buffer);
                return;
            }
            Role::Browser => {
                if !tunnel {
                    self.brx += bytes;
                    if let Some(framing) = self.chunked.as_mut() {
                        framing.feed(op.buffer.filled());
                        if framing.is_malformed() {
                            warn!("{} {}", log_context!(self), RequestError::MalformedChunkedBody);
                            self.services.buffers.checkin(op.buffer);
                            self.delete_this();
                            return;
                        }
                    }
                }
                if let Err(error) = self.send_to(Role::Server, vec![op.buffer]) {
                    warn!("{} {}", log_context!(self), error);
                    self.delete_this();
                    return;
                }
                if !tunnel && self.is_upload_done() {
                    self.on_upload_done();
                }
            }
            Role::Server => {
                let first = self
                    .server
                    .connected_mut()
                    .map(|server| !std::mem::replace(&mut server.response_seen, true))
                    .unwrap_or(false);
                if first && !tunnel {
                    let data = op.buffer.filled();
                    if !data.starts_with(RESPONSE_PREFIX) {
                        error!("{} fatal: incorrect response header", log_context!(self));
                        self.services.buffers.checkin(op.buffer);
                        self.delete_this();
                        return;
                    }
                    let end = memchr::memmem::find(data, b"\r\n")
                        .unwrap_or(data.len())
                        .min(MAX_LOGGED_REQUEST_LINE);
                    info!(
                        "{} {}",
                        log_context!(self),
                        String::from_utf8_lossy(&data[..end])
                    );
                }
                if let Err(error) = self.send_to(Role::Browser, vec![op.buffer]) {
                    warn!("{} {}", log_context!(self), error);
                    self.delete_this();
                    return;
                }
            }
        }

        if let Err(error) = self.post_recv(role) {
            warn!("{} {}", log_context!(self), error);
            match role {
                Role::Browser => self.delete_this(),
                Role::Server => self.shutdown_server_socket(),
            }
        }
    }

    fn on_send_completed(&mut self, op: SendOp, bytes: usize) {
        if bytes < op.requested {
            warn!(
                "{} short send on {}: {} of {} bytes",
                log_context!(self),
                op.socket,
                bytes,
                op.requested
            );
        }
        self.services.metrics.statistics.add_out_bytes(bytes);
        self.services.buffers.checkin_all(op.buffers);
    }

    fn is_upload_done(&self) -> bool {
        match &self.chunked {
            Some(framing) => framing.is_done(),
            None => self.brx >= self.btotal,
        }
    }

    /// Readies the request to parse the next request of the connection
    fn on_upload_done(&mut self) {
        trace!("{} upload done", log_context!(self));
        self.btotal = 0;
        self.brx = 0;
        self.chunked = None;
        self.buffer.clear();
        self.scanned = 0;
        self.headers.clear();
    }

    /// Posts a receive unless one is already outstanding for `role`
    fn post_recv(&mut self, role: Role) -> Result<(), RequestError> {
        let seq = self.next_seq();
        let (socket, pending) = match role {
            Role::Browser => match self.browser.as_mut() {
                Some(leg) => (leg.socket, &mut leg.pending_recv),
                None => return Err(RequestError::NoSocket(role)),
            },
            Role::Server => match self.server.connected_mut() {
                Some(server) => (server.socket, &mut server.pending_recv),
                None => return Err(RequestError::NoSocket(role)),
            },
        };

        if pending.is_some() {
            return Ok(());
        }
        // set before posting: the completion may be dequeued right away
        *pending = Some(seq);

        let buffer = self.services.buffers.checkout();
        if let Err(error) = self
            .services
            .reactor
            .post_recv(RecvOp { socket, seq, buffer })
        {
            *pending = None;
            return Err(RequestError::PostRecv { role, error });
        }
        Ok(())
    }

    fn send_to(&mut self, role: Role, buffers: Vec<ByteBuffer>) -> Result<(), RequestError> {
        let socket = match role {
            Role::Browser => self.browser.as_ref().map(|leg| leg.socket),
            Role::Server => self.server.connected().map(|server| server.socket),
        }
        .ok_or(RequestError::NoSocket(role))?;

        self.services
            .reactor
            .post_send(SendOp::new(socket, buffers))
            .map_err(|error| RequestError::PostSend { role, error })
    }

    fn shutdown_browser_socket(&mut self) {
        if let Some(leg) = self.browser.take() {
            if self.services.reactor.shutdown(leg.socket) {
                debug!("{} browser socket {} closed", log_context!(self), leg.socket);
            }
        }
    }

    /// Also forgets any DNS query or connect in flight
    fn shutdown_server_socket(&mut self) {
        match std::mem::take(&mut self.server) {
            ServerLeg::Idle => {}
            ServerLeg::Resolving { query } => {
                debug!("{} abandoning dns query #{}", log_context!(self), query);
            }
            ServerLeg::Connecting { socket, .. }
            | ServerLeg::Connected(ServerSocket { socket, .. }) => {
                if self.services.reactor.shutdown(socket) {
                    debug!("{} server socket {} closed", log_context!(self), socket);
                }
            }
        }
    }

    /// Closes both sides and marks the slot for release. Safe to call any
    /// number of times.
    pub fn delete_this(&mut self) {
        if self.deleted {
            return;
        }
        self.shutdown_browser_socket();
        self.shutdown_server_socket();

        info!(
            "{} request finished after {:?}",
            log_context!(self),
            self.created_at.elapsed()
        );
        gauge_add!(self.services.metrics, "requests.active", -1);

        self.reset();
        self.deleted = true;
        self.deleted_at = Some(Instant::now());
    }

    fn reset(&mut self) {
        self.peer = None;
        self.browser = None;
        self.server = ServerLeg::Idle;
        self.destination = None;
        self.headers.clear();
        self.buffer.clear();
        if self.buffer.capacity() > RETAINED_BUFFER_CAPACITY {
            self.buffer.shrink_to(self.services.buffers.chunk_size());
        }
        self.scanned = 0;
        self.btotal = 0;
        self.brx = 0;
        self.chunked = None;
    }
}
