use crate::connection::Connection;
use crate::errors::*;
use crate::net::{self, ObservedSegment};

use std::time::Duration;

/// Passive view on the frames of a single connection.
pub trait PacketCapture: Send + Sync {
    /// Blocks until `should_stop` returns true, passing every tcp segment
    /// exchanged with `conn.remote` to `observe`.
    fn capture(
        &self,
        conn: &Connection,
        should_stop: &dyn Fn() -> bool,
        observe: &mut dyn FnMut(ObservedSegment),
    ) -> Result<()>;

    /// Whether capturing can work at all on this host.
    fn available(&self) -> bool {
        true
    }
}

/// Host, port and protocol filter for one connection's remote end.
#[inline]
pub fn matches_remote(conn: &Connection, segment: &ObservedSegment) -> bool {
    segment.source == conn.remote || segment.destination == conn.remote
}

/// Live capture on the interface that carries the connection.
#[derive(Debug, Clone)]
pub struct InterfaceCapture {
    interface: Option<String>,
    read_timeout: Duration,
}

impl InterfaceCapture {
    pub fn new(interface: Option<String>) -> InterfaceCapture {
        InterfaceCapture {
            interface,
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl PacketCapture for InterfaceCapture {
    fn available(&self) -> bool {
        net::find_interface(self.interface.as_deref(), None).is_some()
    }

    fn capture(
        &self,
        conn: &Connection,
        should_stop: &dyn Fn() -> bool,
        observe: &mut dyn FnMut(ObservedSegment),
    ) -> Result<()> {
        let interface = net::find_interface(self.interface.as_deref(), Some(conn.local_address()))
            .ok_or_else(|| Error::Capture(format!("no interface to capture {} on", conn)))?;
        debug!("capturing {} on {}", conn, interface.name);

        net::sniff(&interface, self.read_timeout, should_stop, |segment| {
            if matches_remote(conn, &segment) {
                observe(segment);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new(1, "10.0.0.2:50000".parse().unwrap(), "1.2.3.4:6112".parse().unwrap())
    }

    fn segment(source: &str, destination: &str) -> ObservedSegment {
        ObservedSegment {
            source: source.parse().unwrap(),
            destination: destination.parse().unwrap(),
            sequence: 1,
            payload_len: 0,
            rst: false,
        }
    }

    #[test]
    fn both_directions_match() {
        assert!(matches_remote(&conn(), &segment("10.0.0.2:50000", "1.2.3.4:6112")));
        assert!(matches_remote(&conn(), &segment("1.2.3.4:6112", "10.0.0.2:50000")));
    }

    #[test]
    fn other_port_on_same_host_is_filtered() {
        assert!(!matches_remote(&conn(), &segment("10.0.0.2:50000", "1.2.3.4:443")));
        assert!(!matches_remote(&conn(), &segment("10.0.0.2:50000", "5.6.7.8:6112")));
    }
}
