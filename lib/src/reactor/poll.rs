//! A completion reactor on top of mio readiness events.
//!
//! One thread owns the `mio::Poll`. Every socket lives in a [`Slab`] shared
//! by that thread and the workers posting operations. An operation is
//! attempted as soon as it is posted; if the socket would block, it stays
//! attached to the socket entry until the next readiness event for it. Once
//! done, the operation is pushed on the completion queue.
use std::{
    collections::VecDeque,
    io::{self, ErrorKind, IoSlice, Read, Write},
    net::{Shutdown, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Registry, Token, Waker,
};
use parking_lot::Mutex;
use slab::Slab;

use crate::{
    buffer::ByteBuffer,
    operation::{
        AcceptOp, Completion, ConnectOp, IoOperation, RecvOp, RoutingKey, SendOp, SocketId,
    },
    reactor::{Reactor, ReactorError},
};

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;
/// also the resolution of connect timeouts
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

enum Endpoint {
    /// created by a session, connect not posted yet
    Unconnected(socket2::Socket),
    Stream(TcpStream),
    Listener(TcpListener),
    /// transient, while a connect is being started
    Detached,
}

struct SocketEntry {
    id: SocketId,
    key: RoutingKey,
    endpoint: Endpoint,
    accepts: usize,
    connect: Option<ConnectOp>,
    recv: Option<RecvOp>,
    sends: VecDeque<SendOp>,
}

impl SocketEntry {
    fn new(id: SocketId, key: RoutingKey, endpoint: Endpoint) -> SocketEntry {
        SocketEntry {
            id,
            key,
            endpoint,
            accepts: 0,
            connect: None,
            recv: None,
            sends: VecDeque::new(),
        }
    }

    fn complete(&self, completions: &Sender<Completion>, bytes: usize, operation: IoOperation) {
        let completion = Completion {
            bytes_transferred: bytes,
            key: self.key,
            operation,
        };
        if completions.send(completion).is_err() {
            debug!("completion queue closed, dropping completion for {}", self.id);
        }
    }

    fn drive_connect(&mut self, completions: &Sender<Completion>) {
        let Endpoint::Stream(stream) = &mut self.endpoint else {
            return;
        };
        let Some(op) = self.connect.as_mut() else {
            return;
        };

        if !op.connected {
            match stream.take_error() {
                Ok(None) => {}
                Ok(Some(error)) | Err(error) => {
                    debug!("connect to {} failed: {}", op.target, error);
                    if let Some(op) = self.connect.take() {
                        self.complete(completions, 0, IoOperation::Connect(op));
                    }
                    return;
                }
            }
            match stream.peer_addr() {
                Ok(_) => op.connected = true,
                Err(error) if error.kind() == ErrorKind::NotConnected => return,
                Err(error) => {
                    debug!("connect to {} failed: {}", op.target, error);
                    if let Some(op) = self.connect.take() {
                        self.complete(completions, 0, IoOperation::Connect(op));
                    }
                    return;
                }
            }
        }

        match write_buffers(stream, &op.initial, &mut op.sent) {
            Ok(false) => return,
            Ok(true) => {}
            Err(error) => {
                debug!(
                    "could not write initial data to {}: {}, {}/{} bytes sent",
                    op.target, error, op.sent, op.requested
                );
            }
        }

        if let Some(op) = self.connect.take() {
            let sent = op.sent;
            self.complete(completions, sent, IoOperation::Connect(op));
        }
        // operations posted while connecting were waiting for this
        self.drive_recv(completions);
        self.drive_sends(completions);
    }

    fn drive_recv(&mut self, completions: &Sender<Completion>) {
        if self.connect.is_some() {
            return;
        }
        let Endpoint::Stream(stream) = &mut self.endpoint else {
            return;
        };
        let Some(mut op) = self.recv.take() else {
            return;
        };

        loop {
            match stream.read(op.buffer.spare_mut()) {
                Ok(size) => {
                    op.buffer.advance(size);
                    self.complete(completions, size, IoOperation::Recv(op));
                    return;
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    self.recv = Some(op);
                    return;
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    // resets and the like read as a closed connection
                    debug!("recv on {} failed: {}", self.id, error);
                    self.complete(completions, 0, IoOperation::Recv(op));
                    return;
                }
            }
        }
    }

    fn drive_sends(&mut self, completions: &Sender<Completion>) {
        if self.connect.is_some() {
            return;
        }
        let Endpoint::Stream(stream) = &mut self.endpoint else {
            return;
        };

        while let Some(op) = self.sends.front_mut() {
            match write_buffers(stream, &op.buffers, &mut op.sent) {
                Ok(false) => return,
                Ok(true) => {}
                Err(error) => {
                    debug!(
                        "send on {} failed: {}, {}/{} bytes sent",
                        self.id, error, op.sent, op.requested
                    );
                }
            }
            if let Some(op) = self.sends.pop_front() {
                let sent = op.sent;
                let completion = Completion {
                    bytes_transferred: sent,
                    key: self.key,
                    operation: IoOperation::Send(op),
                };
                if completions.send(completion).is_err() {
                    return;
                }
            }
        }
    }

    fn expire_connect(&mut self, timeout: Duration, now: Instant, completions: &Sender<Completion>) {
        let expired = self
            .connect
            .as_ref()
            .map(|op| !op.connected && now.saturating_duration_since(op.started) > timeout)
            .unwrap_or(false);

        if expired {
            if let Some(op) = self.connect.take() {
                debug!("connect to {} timed out", op.target);
                self.complete(completions, 0, IoOperation::Connect(op));
            }
        }
    }
}

/// Writes the unsent part of `buffers`.
///
/// `Ok(true)` once everything is written, `Ok(false)` if the socket would
/// block first.
fn write_buffers(stream: &mut TcpStream, buffers: &[ByteBuffer], sent: &mut usize) -> io::Result<bool> {
    let requested: usize = buffers.iter().map(ByteBuffer::len).sum();

    while *sent < requested {
        let mut skip = *sent;
        let mut slices = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            let filled = buffer.filled();
            if skip >= filled.len() {
                skip -= filled.len();
                continue;
            }
            slices.push(IoSlice::new(&filled[skip..]));
            skip = 0;
        }

        match stream.write_vectored(&slices) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(size) => *sent += size,
            Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(true)
}

struct SocketTable {
    entries: Slab<SocketEntry>,
    generation: u64,
}

impl SocketTable {
    fn next_id(&mut self) -> SocketId {
        self.generation += 1;
        SocketId {
            index: self.entries.vacant_key(),
            generation: self.generation,
        }
    }

    fn get_mut(&mut self, id: SocketId) -> Result<&mut SocketEntry, ReactorError> {
        self.entries
            .get_mut(id.index)
            .filter(|entry| entry.id == id)
            .ok_or(ReactorError::UnknownSocket(id))
    }

    fn drive_accept(&mut self, index: usize, registry: &Registry, completions: &Sender<Completion>) {
        loop {
            let (listener_id, (mut stream, peer)) = {
                let Some(entry) = self.entries.get_mut(index) else {
                    return;
                };
                if entry.accepts == 0 {
                    return;
                }
                let Endpoint::Listener(listener) = &entry.endpoint else {
                    return;
                };
                match listener.accept() {
                    Ok(accepted) => {
                        entry.accepts -= 1;
                        (entry.id, accepted)
                    }
                    Err(error) if error.kind() == ErrorKind::WouldBlock => return,
                    Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                    Err(error) => {
                        error!("could not accept on {}: {}", entry.id, error);
                        return;
                    }
                }
            };

            let id = self.next_id();
            if let Err(error) = registry.register(
                &mut stream,
                Token(id.index),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                error!("could not register accepted socket from {}: {}", peer, error);
                if let Some(listener) = self.entries.get_mut(index) {
                    listener.accepts += 1;
                }
                continue;
            }
            if let Err(error) = stream.set_nodelay(true) {
                debug!("could not set TCP_NODELAY for {}: {}", peer, error);
            }

            trace!("accepted {} from {}", id, peer);
            let entry = SocketEntry::new(id, RoutingKey::System, Endpoint::Stream(stream));
            let inserted = self.entries.insert(entry);
            debug_assert_eq!(inserted, id.index);

            let completion = Completion {
                bytes_transferred: 0,
                key: RoutingKey::System,
                operation: IoOperation::Accept(AcceptOp {
                    listener: listener_id,
                    socket: id,
                    peer,
                }),
            };
            if completions.send(completion).is_err() {
                return;
            }
        }
    }

    fn handle_event(&mut self, index: usize, registry: &Registry, completions: &Sender<Completion>) {
        let is_listener = match self.entries.get(index) {
            Some(entry) => matches!(entry.endpoint, Endpoint::Listener(_)),
            None => return,
        };

        if is_listener {
            self.drive_accept(index, registry, completions);
            return;
        }

        if let Some(entry) = self.entries.get_mut(index) {
            entry.drive_connect(completions);
            entry.drive_recv(completions);
            entry.drive_sends(completions);
        }
    }
}

struct Shared {
    table: Mutex<SocketTable>,
    registry: Registry,
    waker: Waker,
    completions: Sender<Completion>,
    running: AtomicBool,
    connect_timeout: Duration,
}

/// The mio backed [`Reactor`]
#[derive(Clone)]
pub struct PollReactor {
    shared: Arc<Shared>,
    poll: Arc<Mutex<Option<Poll>>>,
}

impl PollReactor {
    pub fn new(completions: Sender<Completion>, connect_timeout: Duration) -> io::Result<PollReactor> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(&registry, WAKER_TOKEN)?;

        Ok(PollReactor {
            shared: Arc::new(Shared {
                table: Mutex::new(SocketTable {
                    entries: Slab::with_capacity(1024),
                    generation: 0,
                }),
                registry,
                waker,
                completions,
                running: AtomicBool::new(true),
                connect_timeout,
            }),
            poll: Arc::new(Mutex::new(Some(poll))),
        })
    }

    /// starts the event loop thread, can only be called once
    pub fn spawn(&self) -> io::Result<JoinHandle<()>> {
        let poll = self
            .poll
            .lock()
            .take()
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "reactor already started"))?;
        let shared = self.shared.clone();

        thread::Builder::new()
            .name("fwdproxy-reactor".to_owned())
            .spawn(move || run(shared, poll))
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Err(error) = self.shared.waker.wake() {
            error!("could not wake the reactor: {}", error);
        }
    }

    pub fn listen(&self, address: SocketAddr) -> io::Result<SocketId> {
        let mut listener = TcpListener::bind(address)?;
        let mut table = self.shared.table.lock();
        let id = table.next_id();
        self.shared
            .registry
            .register(&mut listener, Token(id.index), Interest::READABLE)?;
        table
            .entries
            .insert(SocketEntry::new(id, RoutingKey::System, Endpoint::Listener(listener)));
        info!("listening on {}", address);
        Ok(id)
    }

    pub fn local_addr(&self, socket: SocketId) -> Option<SocketAddr> {
        let mut table = self.shared.table.lock();
        let entry = table.get_mut(socket).ok()?;
        match &entry.endpoint {
            Endpoint::Listener(listener) => listener.local_addr().ok(),
            Endpoint::Stream(stream) => stream.local_addr().ok(),
            Endpoint::Unconnected(socket) => socket.local_addr().ok()?.as_socket(),
            Endpoint::Detached => None,
        }
    }

    pub fn socket_count(&self) -> usize {
        self.shared.table.lock().entries.len()
    }
}

fn run(shared: Arc<Shared>, mut poll: Poll) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    let mut last_sweep = Instant::now();
    info!("reactor started");

    while shared.running.load(Ordering::Acquire) {
        if let Err(error) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if error.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!("reactor poll failed: {}", error);
            break;
        }

        let mut table = shared.table.lock();
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            table.handle_event(event.token().0, &shared.registry, &shared.completions);
        }

        let now = Instant::now();
        if now.saturating_duration_since(last_sweep) >= POLL_TIMEOUT {
            last_sweep = now;
            for (_, entry) in table.entries.iter_mut() {
                entry.expire_connect(shared.connect_timeout, now, &shared.completions);
            }
        }
    }
    info!("reactor stopped");
}

impl Reactor for PollReactor {
    fn associate(&self, socket: socket2::Socket, key: RoutingKey) -> Result<SocketId, ReactorError> {
        let mut table = self.shared.table.lock();
        let id = table.next_id();
        table
            .entries
            .insert(SocketEntry::new(id, key, Endpoint::Unconnected(socket)));
        Ok(id)
    }

    fn set_key(&self, socket: SocketId, key: RoutingKey) -> Result<(), ReactorError> {
        let mut table = self.shared.table.lock();
        table.get_mut(socket)?.key = key;
        Ok(())
    }

    fn post_accept(&self, listener: SocketId) -> Result<(), ReactorError> {
        let mut table = self.shared.table.lock();
        let entry = table.get_mut(listener)?;
        if !matches!(entry.endpoint, Endpoint::Listener(_)) {
            return Err(ReactorError::InvalidState(listener));
        }
        entry.accepts += 1;
        table.drive_accept(listener.index, &self.shared.registry, &self.shared.completions);
        Ok(())
    }

    fn post_connect(&self, op: ConnectOp) -> Result<(), ReactorError> {
        let mut table = self.shared.table.lock();
        let entry = table.get_mut(op.socket)?;

        let socket = match std::mem::replace(&mut entry.endpoint, Endpoint::Detached) {
            Endpoint::Unconnected(socket) => socket,
            other => {
                entry.endpoint = other;
                return Err(ReactorError::InvalidState(op.socket));
            }
        };

        match socket.connect(&op.target.into()) {
            Ok(()) => {}
            Err(error)
                if error.raw_os_error() == Some(libc::EINPROGRESS)
                    || error.kind() == ErrorKind::WouldBlock => {}
            Err(error) => {
                entry.endpoint = Endpoint::Unconnected(socket);
                return Err(ReactorError::Connect(error));
            }
        }

        let mut stream = TcpStream::from_std(std::net::TcpStream::from(socket));
        if let Err(error) = self.shared.registry.register(
            &mut stream,
            Token(op.socket.index),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            entry.endpoint = Endpoint::Stream(stream);
            return Err(ReactorError::Register(error));
        }
        if let Err(error) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY on {}: {}", op.socket, error);
        }

        entry.endpoint = Endpoint::Stream(stream);
        entry.connect = Some(op);
        // the connection may already be established
        entry.drive_connect(&self.shared.completions);
        Ok(())
    }

    fn post_recv(&self, op: RecvOp) -> Result<(), ReactorError> {
        let mut table = self.shared.table.lock();
        let entry = table.get_mut(op.socket)?;
        if !matches!(entry.endpoint, Endpoint::Stream(_)) {
            return Err(ReactorError::InvalidState(op.socket));
        }
        if entry.recv.is_some() {
            return Err(ReactorError::ReceivePending(op.socket));
        }
        entry.recv = Some(op);
        entry.drive_recv(&self.shared.completions);
        Ok(())
    }

    fn post_send(&self, op: SendOp) -> Result<(), ReactorError> {
        let mut table = self.shared.table.lock();
        let entry = table.get_mut(op.socket)?;
        if !matches!(entry.endpoint, Endpoint::Stream(_)) {
            return Err(ReactorError::InvalidState(op.socket));
        }
        entry.sends.push_back(op);
        if entry.sends.len() == 1 {
            entry.drive_sends(&self.shared.completions);
        }
        Ok(())
    }

    fn post_completion(&self, completion: Completion) -> Result<(), ReactorError> {
        self.shared
            .completions
            .send(completion)
            .map_err(|_| ReactorError::QueueClosed)
    }

    fn shutdown(&self, socket: SocketId) -> bool {
        let mut table = self.shared.table.lock();
        if table.get_mut(socket).is_err() {
            return false;
        }
        let entry = table.entries.remove(socket.index);

        match entry.endpoint {
            Endpoint::Stream(mut stream) => {
                if let Err(error) = stream.shutdown(Shutdown::Write) {
                    if error.kind() != ErrorKind::NotConnected {
                        debug!("error half-closing {}: {}", socket, error);
                    }
                }
                if let Err(error) = self.shared.registry.deregister(&mut stream) {
                    debug!("error deregistering {}: {}", socket, error);
                }
            }
            Endpoint::Listener(mut listener) => {
                let _ = self.shared.registry.deregister(&mut listener);
            }
            Endpoint::Unconnected(_) | Endpoint::Detached => {}
        }

        let dropped = entry.recv.iter().count() + entry.sends.len() + entry.connect.iter().count();
        if dropped > 0 {
            trace!("{} pending operations dropped with {}", dropped, socket);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener as StdListener,
    };

    use crossbeam_channel::{unbounded, Receiver};

    use super::*;
    use crate::pool::Ticket;

    const KEY: RoutingKey = RoutingKey::Session(Ticket {
        index: 1,
        generation: 0,
    });

    fn reactor() -> (PollReactor, Receiver<Completion>, JoinHandle<()>) {
        let (tx, rx) = unbounded();
        let reactor = PollReactor::new(tx, Duration::from_secs(5)).unwrap();
        let handle = reactor.spawn().unwrap();
        (reactor, rx, handle)
    }

    fn next(rx: &Receiver<Completion>) -> Completion {
        rx.recv_timeout(Duration::from_secs(5))
            .expect("no completion in time")
    }

    fn unconnected(target: SocketAddr) -> socket2::Socket {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(target),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        socket.set_nonblocking(true).unwrap();
        socket
    }

    #[test]
    fn connect_send_recv() {
        let (reactor, rx, handle) = reactor();
        let origin = StdListener::bind("127.0.0.1:0").unwrap();
        let target = origin.local_addr().unwrap();

        let socket = reactor.associate(unconnected(target), KEY).unwrap();
        reactor
            .post_connect(ConnectOp::new(socket, target, vec![ByteBuffer::from_slice(b"ping")]))
            .unwrap();

        let (mut accepted, _) = origin.accept().unwrap();
        let completion = next(&rx);
        assert_eq!(completion.key, KEY);
        match completion.operation {
            IoOperation::Connect(op) => {
                assert!(op.connected);
                assert_eq!(op.sent, 4);
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut received = [0; 4];
        accepted.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"ping");

        reactor
            .post_recv(RecvOp {
                socket,
                seq: 1,
                buffer: ByteBuffer::with_capacity(64),
            })
            .unwrap();
        assert!(matches!(
            reactor.post_recv(RecvOp {
                socket,
                seq: 2,
                buffer: ByteBuffer::with_capacity(64),
            }),
            Err(ReactorError::ReceivePending(_))
        ));
        accepted.write_all(b"pong").unwrap();

        let completion = next(&rx);
        assert_eq!(completion.bytes_transferred, 4);
        match completion.operation {
            IoOperation::Recv(op) => {
                assert_eq!(op.seq, 1);
                assert_eq!(op.buffer.filled(), b"pong");
            }
            other => panic!("unexpected {:?}", other),
        }

        reactor
            .post_send(SendOp::new(socket, vec![ByteBuffer::from_slice(b"bye")]))
            .unwrap();
        let completion = next(&rx);
        assert_eq!(completion.bytes_transferred, 3);

        assert!(reactor.shutdown(socket));
        assert!(!reactor.shutdown(socket));
        let mut rest = Vec::new();
        accepted.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"bye");

        reactor.stop();
        handle.join().unwrap();
    }

    #[test]
    fn refused_connect_fails() {
        let (reactor, rx, handle) = reactor();
        // bind then drop to get a port nobody listens on
        let target = StdListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let socket = reactor.associate(unconnected(target), KEY).unwrap();
        match reactor.post_connect(ConnectOp::new(socket, target, Vec::new())) {
            Ok(()) => match next(&rx).operation {
                IoOperation::Connect(op) => assert!(!op.connected),
                other => panic!("unexpected {:?}", other),
            },
            Err(ReactorError::Connect(_)) => {}
            Err(other) => panic!("unexpected {:?}", other),
        }

        reactor.stop();
        handle.join().unwrap();
    }

    #[test]
    fn accept_and_peer_close() {
        let (reactor, rx, handle) = reactor();
        let listener = reactor.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let address = reactor.local_addr(listener).unwrap();
        reactor.post_accept(listener).unwrap();

        let client = std::net::TcpStream::connect(address).unwrap();
        let accepted = match next(&rx).operation {
            IoOperation::Accept(op) => {
                assert_eq!(op.listener, listener);
                assert_eq!(op.peer, client.local_addr().unwrap());
                op.socket
            }
            other => panic!("unexpected {:?}", other),
        };

        reactor.set_key(accepted, KEY).unwrap();
        reactor
            .post_recv(RecvOp {
                socket: accepted,
                seq: 7,
                buffer: ByteBuffer::with_capacity(16),
            })
            .unwrap();
        drop(client);

        let completion = next(&rx);
        assert_eq!(completion.key, KEY);
        assert_eq!(completion.bytes_transferred, 0);

        reactor.stop();
        handle.join().unwrap();
    }

    #[test]
    fn operations_on_closed_socket_are_rejected() {
        let (tx, _rx) = unbounded();
        let reactor = PollReactor::new(tx, Duration::from_secs(1)).unwrap();
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let socket = reactor.associate(unconnected(target), KEY).unwrap();
        assert!(matches!(
            reactor.post_recv(RecvOp {
                socket,
                seq: 0,
                buffer: ByteBuffer::with_capacity(8),
            }),
            Err(ReactorError::InvalidState(_))
        ));
        assert!(reactor.shutdown(socket));
        assert!(matches!(
            reactor.post_send(SendOp::new(socket, Vec::new())),
            Err(ReactorError::UnknownSocket(_))
        ));
    }
}
