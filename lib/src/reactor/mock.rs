//! A reactor that performs no I/O and records every posted operation, so
//! tests can complete operations by hand, in any order, as many times as
//! they like.
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{
    operation::{Completion, ConnectOp, RecvOp, RoutingKey, SendOp, SocketId},
    reactor::{Reactor, ReactorError},
};

#[derive(Default)]
pub struct MockState {
    next_index: usize,
    pub keys: HashMap<SocketId, RoutingKey>,
    pub recvs: Vec<RecvOp>,
    pub sends: Vec<SendOp>,
    pub connects: Vec<ConnectOp>,
    pub completions: Vec<Completion>,
    pub shutdowns: Vec<SocketId>,
    pub accepts: usize,
    /// receives posted and not yet taken back by the test, per socket
    pub outstanding_recvs: HashMap<SocketId, usize>,
    pub max_outstanding_recvs: usize,
    pub fail_connects: bool,
    pub fail_recvs: bool,
}

#[derive(Default)]
pub struct MockReactor {
    pub state: Mutex<MockState>,
}

impl MockReactor {
    pub fn new_socket(&self, key: RoutingKey) -> SocketId {
        let mut state = self.state.lock();
        state.next_index += 1;
        let id = SocketId {
            index: state.next_index,
            generation: state.next_index as u64,
        };
        state.keys.insert(id, key);
        id
    }

    pub fn take_recv(&self, socket: SocketId) -> Option<RecvOp> {
        let mut state = self.state.lock();
        let position = state.recvs.iter().position(|op| op.socket == socket)?;
        if let Some(count) = state.outstanding_recvs.get_mut(&socket) {
            *count = count.saturating_sub(1);
        }
        Some(state.recvs.remove(position))
    }

    pub fn has_recv(&self, socket: SocketId) -> bool {
        self.state.lock().recvs.iter().any(|op| op.socket == socket)
    }

    pub fn take_sends(&self, socket: SocketId) -> Vec<SendOp> {
        let mut state = self.state.lock();
        let (taken, kept): (Vec<SendOp>, Vec<SendOp>) = std::mem::take(&mut state.sends)
            .into_iter()
            .partition(|op| op.socket == socket);
        state.sends = kept;
        taken
    }

    pub fn take_connect(&self) -> Option<ConnectOp> {
        let mut state = self.state.lock();
        (!state.connects.is_empty()).then(|| state.connects.remove(0))
    }

    pub fn take_completions(&self) -> Vec<Completion> {
        std::mem::take(&mut self.state.lock().completions)
    }

    pub fn is_shut_down(&self, socket: SocketId) -> bool {
        self.state.lock().shutdowns.contains(&socket)
    }

    pub fn shutdown_count(&self, socket: SocketId) -> usize {
        self.state
            .lock()
            .shutdowns
            .iter()
            .filter(|id| **id == socket)
            .count()
    }
}

impl Reactor for MockReactor {
    fn associate(&self, _socket: socket2::Socket, key: RoutingKey) -> Result<SocketId, ReactorError> {
        Ok(self.new_socket(key))
    }

    fn set_key(&self, socket: SocketId, key: RoutingKey) -> Result<(), ReactorError> {
        let mut state = self.state.lock();
        match state.keys.get_mut(&socket) {
            Some(existing) => {
                *existing = key;
                Ok(())
            }
            None => Err(ReactorError::UnknownSocket(socket)),
        }
    }

    fn post_accept(&self, _listener: SocketId) -> Result<(), ReactorError> {
        self.state.lock().accepts += 1;
        Ok(())
    }

    fn post_connect(&self, op: ConnectOp) -> Result<(), ReactorError> {
        let mut state = self.state.lock();
        if state.fail_connects {
            return Err(ReactorError::Connect(std::io::ErrorKind::ConnectionRefused.into()));
        }
        state.connects.push(op);
        Ok(())
    }

    fn post_recv(&self, op: RecvOp) -> Result<(), ReactorError> {
        let mut state = self.state.lock();
        if state.fail_recvs || state.shutdowns.contains(&op.socket) {
            return Err(ReactorError::UnknownSocket(op.socket));
        }
        let count = state.outstanding_recvs.entry(op.socket).or_insert(0);
        *count += 1;
        let count = *count;
        state.max_outstanding_recvs = state.max_outstanding_recvs.max(count);
        state.recvs.push(op);
        Ok(())
    }

    fn post_send(&self, op: SendOp) -> Result<(), ReactorError> {
        let mut state = self.state.lock();
        if state.shutdowns.contains(&op.socket) {
            return Err(ReactorError::UnknownSocket(op.socket));
        }
        state.sends.push(op);
        Ok(())
    }

    fn post_completion(&self, completion: Completion) -> Result<(), ReactorError> {
        self.state.lock().completions.push(completion);
        Ok(())
    }

    fn shutdown(&self, socket: SocketId) -> bool {
        let mut state = self.state.lock();
        if state.shutdowns.contains(&socket) {
            return false;
        }
        state.shutdowns.push(socket);
        state.recvs.retain(|op| op.socket != socket);
        state.outstanding_recvs.remove(&socket);
        true
    }
}
