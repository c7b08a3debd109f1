//! Completion-based I/O.
//!
//! Sessions post operations and never perform socket I/O themselves. Each
//! posted operation comes back exactly once as a [`Completion`] on the shared
//! completion queue, unless its socket is shut down first, in which case it
//! is silently dropped. Completions for a socket carry the [`RoutingKey`]
//! the socket is associated with.
use std::io;

use crate::operation::{Completion, ConnectOp, RecvOp, RoutingKey, SendOp, SocketId};

pub mod poll;

#[cfg(test)]
pub mod mock;

pub use self::poll::PollReactor;

#[derive(thiserror::Error, Debug)]
pub enum ReactorError {
    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),
    #[error("socket {0} is not in a state allowing this operation")]
    InvalidState(SocketId),
    #[error("a receive is already pending on socket {0}")]
    ReceivePending(SocketId),
    #[error("could not register socket: {0}")]
    Register(io::Error),
    #[error("could not start connecting: {0}")]
    Connect(io::Error),
    #[error("the completion queue is closed")]
    QueueClosed,
}

pub trait Reactor: Send + Sync {
    /// Takes ownership of a freshly created, not yet connected socket
    fn associate(&self, socket: socket2::Socket, key: RoutingKey)
        -> Result<SocketId, ReactorError>;

    /// routes future completions of `socket` to `key`
    fn set_key(&self, socket: SocketId, key: RoutingKey) -> Result<(), ReactorError>;

    /// arms one more accept on a listener
    fn post_accept(&self, listener: SocketId) -> Result<(), ReactorError>;

    fn post_connect(&self, op: ConnectOp) -> Result<(), ReactorError>;

    /// at most one receive may be pending per socket
    fn post_recv(&self, op: RecvOp) -> Result<(), ReactorError>;

    fn post_send(&self, op: SendOp) -> Result<(), ReactorError>;

    /// pushes an arbitrary completion, used to re-inject resolver results
    fn post_completion(&self, completion: Completion) -> Result<(), ReactorError>;

    /// Half-closes, drops pending operations and closes. Returns `false` when
    /// there was nothing left to shut down.
    fn shutdown(&self, socket: SocketId) -> bool;
}
