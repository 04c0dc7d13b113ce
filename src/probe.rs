use crate::errors::*;

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Checks whether the game server still accepts connections on its port.
pub trait ReachabilityProbe: Send + Sync {
    /// `Ok(false)` means the port is unreachable. An `Err` says nothing about
    /// the port and callers treat it as still reachable.
    fn probe(&self, addr: SocketAddr, timeout: Duration) -> Result<bool>;

    fn is_reachable(&self, addr: SocketAddr, timeout: Duration) -> bool {
        match self.probe(addr, timeout) {
            Ok(reachable) => reachable,
            Err(e) => {
                debug!("{}, assuming reachable", e);
                true
            }
        }
    }
}

/// Probes with a short-lived tcp connect.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnectProbe;

impl ReachabilityProbe for TcpConnectProbe {
    fn probe(&self, addr: SocketAddr, timeout: Duration) -> Result<bool> {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => Ok(true),
            Err(e) if unreachable(&e) => Ok(false),
            Err(source) => Err(Error::Probe { addr, source }),
        }
    }
}

fn unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
    )
}
