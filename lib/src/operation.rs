//! Operations exchanged with the reactor.
//!
//! An operation is owned by exactly one party at a time: the session that
//! builds it, the reactor while it is in flight, then the worker that
//! dequeues its [`Completion`]. Buffers travel inside the operation, so a
//! buffer can never be touched while the kernel may still write into it.
use std::{fmt, net::SocketAddr, time::Instant};

use crate::{buffer::ByteBuffer, dns::ResolveError, pool::Ticket};

/// A socket registered in the reactor. The generation makes ids of closed
/// sockets unusable even when their table slot is reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId {
    pub index: usize,
    pub generation: u64,
}

impl fmt::Debug for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Socket({}/{})", self.index, self.generation)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.generation)
    }
}

/// Routes a completion to its consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    /// listener accepts and the exit sentinel
    System,
    Session(Ticket),
}

/// Which side of a session a socket belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Browser,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Browser => write!(f, "browser"),
            Role::Server => write!(f, "server"),
        }
    }
}

#[derive(Debug)]
pub struct AcceptOp {
    pub listener: SocketId,
    pub socket: SocketId,
    pub peer: SocketAddr,
}

#[derive(Debug)]
pub struct RecvOp {
    pub socket: SocketId,
    /// identifies the posting, a completion with another value is stale
    pub seq: u64,
    pub buffer: ByteBuffer,
}

#[derive(Debug)]
pub struct SendOp {
    pub socket: SocketId,
    pub buffers: Vec<ByteBuffer>,
    pub requested: usize,
    pub sent: usize,
}

impl SendOp {
    pub fn new(socket: SocketId, buffers: Vec<ByteBuffer>) -> SendOp {
        let requested = buffers.iter().map(ByteBuffer::len).sum();
        SendOp {
            socket,
            buffers,
            requested,
            sent: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.sent >= self.requested
    }
}

#[derive(Debug)]
pub struct ConnectOp {
    pub socket: SocketId,
    pub target: SocketAddr,
    /// bytes written right after the connection is established
    pub initial: Vec<ByteBuffer>,
    pub requested: usize,
    pub sent: usize,
    pub connected: bool,
    pub started: Instant,
}

impl ConnectOp {
    pub fn new(socket: SocketId, target: SocketAddr, initial: Vec<ByteBuffer>) -> ConnectOp {
        let requested = initial.iter().map(ByteBuffer::len).sum();
        ConnectOp {
            socket,
            target,
            initial,
            requested,
            sent: 0,
            connected: false,
            started: Instant::now(),
        }
    }
}

/// Result of an asynchronous name resolution
#[derive(Debug)]
pub struct ResolveOp {
    pub query: u64,
    /// `host:port`
    pub key: String,
    pub outcome: Result<Vec<SocketAddr>, ResolveError>,
}

#[derive(Debug)]
pub enum IoOperation {
    Exit,
    Accept(AcceptOp),
    Resolve(ResolveOp),
    Connect(ConnectOp),
    Recv(RecvOp),
    Send(SendOp),
}

impl IoOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            IoOperation::Exit => "exit",
            IoOperation::Accept(_) => "accept",
            IoOperation::Resolve(_) => "resolve",
            IoOperation::Connect(_) => "connect",
            IoOperation::Recv(_) => "recv",
            IoOperation::Send(_) => "send",
        }
    }

    /// the buffers carried by the operation, for recycling
    pub fn into_buffers(self) -> Vec<ByteBuffer> {
        match self {
            IoOperation::Recv(op) => vec![op.buffer],
            IoOperation::Send(op) => op.buffers,
            IoOperation::Connect(op) => op.initial,
            IoOperation::Exit | IoOperation::Accept(_) | IoOperation::Resolve(_) => Vec::new(),
        }
    }
}

/// What a worker dequeues
#[derive(Debug)]
pub struct Completion {
    pub bytes_transferred: usize,
    pub key: RoutingKey,
    pub operation: IoOperation,
}

impl Completion {
    pub fn exit() -> Completion {
        Completion {
            bytes_transferred: 0,
            key: RoutingKey::System,
            operation: IoOperation::Exit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_accounting() {
        let socket = SocketId {
            index: 3,
            generation: 1,
        };
        let mut op = SendOp::new(
            socket,
            vec![ByteBuffer::from_slice(b"abc"), ByteBuffer::from_slice(b"de")],
        );
        assert_eq!(op.requested, 5);
        assert!(!op.is_complete());
        op.sent = 5;
        assert!(op.is_complete());

        let buffers = IoOperation::Send(op).into_buffers();
        assert_eq!(buffers.len(), 2);
        assert!(IoOperation::Exit.into_buffers().is_empty());
    }
}
