use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// Identity of a tcp connection, the `local -> remote` 4-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.local, self.remote)
    }
}

/// An established connection owned by the game process.
///
/// Equality and hashing only look at the [`ConnectionId`], two observations of
/// the same socket from different polls compare equal even if the pid was
/// reported differently.
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub pid: u32,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl Connection {
    #[inline]
    pub fn new(pid: u32, local: SocketAddr, remote: SocketAddr) -> Connection {
        Connection { pid, local, remote }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        ConnectionId {
            local: self.local,
            remote: self.remote,
        }
    }

    #[inline]
    pub fn local_address(&self) -> IpAddr {
        self.local.ip()
    }

    #[inline]
    pub fn local_port(&self) -> u16 {
        self.local.port()
    }

    #[inline]
    pub fn remote_port(&self) -> u16 {
        self.remote.port()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Connection) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id().fmt(f)
    }
}
