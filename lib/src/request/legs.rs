use std::{collections::VecDeque, fmt, net::SocketAddr};

use crate::{dns::cache_key, operation::SocketId};

/// Where the current request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub name: String,
    pub port: u16,
    pub tunnel: bool,
}

impl Destination {
    /// `name:port`, also the DNS cache key
    pub fn full_name(&self) -> String {
        cache_key(&self.name, self.port)
    }

    pub fn same_host(&self, other: &Destination) -> bool {
        self.name == other.name && self.port == other.port
    }
}

#[derive(Debug)]
pub struct BrowserLeg {
    pub socket: SocketId,
    /// sequence number of the outstanding receive
    pub pending_recv: Option<u64>,
}

#[derive(Debug)]
pub struct ServerSocket {
    pub socket: SocketId,
    pub target: SocketAddr,
    pub pending_recv: Option<u64>,
    /// the first bytes of the current response went through
    pub response_seen: bool,
}

/// The upstream side of a request. Only one of "resolving", "connecting" or
/// "connected" can hold at a time.
#[derive(Debug, Default)]
pub enum ServerLeg {
    #[default]
    Idle,
    Resolving {
        query: u64,
    },
    Connecting {
        socket: SocketId,
        target: SocketAddr,
        /// candidates left to try if this one fails
        candidates: VecDeque<SocketAddr>,
    },
    Connected(ServerSocket),
}

impl ServerLeg {
    pub fn connected(&self) -> Option<&ServerSocket> {
        match self {
            ServerLeg::Connected(server) => Some(server),
            _ => None,
        }
    }

    pub fn connected_mut(&mut self) -> Option<&mut ServerSocket> {
        match self {
            ServerLeg::Connected(server) => Some(server),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ServerLeg::Idle)
    }
}

impl fmt::Display for ServerLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerLeg::Idle => write!(f, "<none>"),
            ServerLeg::Resolving { query } => write!(f, "resolving#{query}"),
            ServerLeg::Connecting { socket, target, .. } => {
                write!(f, "connecting({socket}->{target})")
            }
            ServerLeg::Connected(server) => write!(f, "{}->{}", server.socket, server.target),
        }
    }
}
