use crate::errors::*;
use crate::gateway::GatewayInfo;
use crate::net::{self, Segment};
use pnet::datalink::DataLinkSender;
use pnet::transport::TransportSender;
use pnet::util::MacAddr;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Raw ip socket, routed by the os.
    Ip,
    /// Complete ethernet frames addressed to the gateway.
    Link,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Ip => write!(f, "ip layer"),
            Layer::Link => write!(f, "link layer"),
        }
    }
}

/// Puts forged segments on the wire.
pub trait FrameTransmitter: Send + Sync {
    fn layer(&self) -> Layer;

    fn transmit(&self, segment: &Segment) -> Result<()>;
}

/// Round robin over a handful of independently locked senders, so burst
/// workers rarely wait on each other.
struct Senders<T> {
    senders: Vec<Mutex<T>>,
    next: AtomicUsize,
}

impl<T> Senders<T> {
    fn new(senders: Vec<T>) -> Senders<T> {
        Senders {
            senders: senders.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> Result<MutexGuard<'_, T>> {
        if self.senders.is_empty() {
            return Err(Error::Transmission("no sockets open".into()));
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[idx]
            .lock()
            .map_err(|_| Error::Transmission("sender lock poisoned".into()))
    }
}

pub struct IpLayerTransmitter {
    senders: Senders<TransportSender>,
}

impl IpLayerTransmitter {
    pub fn open(sockets: usize) -> Result<IpLayerTransmitter> {
        let senders = (0..sockets.max(1))
            .map(|_| net::create_socket())
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| Error::Transmission(format!("could not open raw socket: {}", e)))?;
        Ok(IpLayerTransmitter {
            senders: Senders::new(senders),
        })
    }
}

impl FrameTransmitter for IpLayerTransmitter {
    fn layer(&self) -> Layer {
        Layer::Ip
    }

    fn transmit(&self, segment: &Segment) -> Result<()> {
        let mut tx = self.senders.next()?;
        net::send_ip_segment(&mut tx, segment)
    }
}

pub struct LinkLayerTransmitter {
    source_mac: MacAddr,
    gateway_mac: MacAddr,
    senders: Senders<Box<dyn DataLinkSender>>,
}

impl LinkLayerTransmitter {
    pub fn open(gateway: &GatewayInfo, sockets: usize) -> Result<LinkLayerTransmitter> {
        let interface = net::find_interface(Some(&gateway.interface), None)
            .ok_or_else(|| Error::Transmission(format!("interface {} not found", gateway.interface)))?;
        let senders = (0..sockets.max(1))
            .map(|_| net::open_ethernet(&interface, None).map(|(tx, _rx)| tx))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| Error::Transmission(format!("could not open {}: {}", interface.name, e)))?;
        Ok(LinkLayerTransmitter {
            source_mac: gateway.local_mac,
            gateway_mac: gateway.gateway_mac,
            senders: Senders::new(senders),
        })
    }
}

impl FrameTransmitter for LinkLayerTransmitter {
    fn layer(&self) -> Layer {
        Layer::Link
    }

    fn transmit(&self, segment: &Segment) -> Result<()> {
        let frame = net::build_ethernet_frame(self.source_mac, self.gateway_mac, segment)?;
        let mut tx = self.senders.next()?;
        match tx.send_to(&frame, None) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(Error::Transmission(format!("could not send: {}", e))),
            None => Err(Error::Transmission("send_to returned None".into())),
        }
    }
}
