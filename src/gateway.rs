use crate::errors::*;
use crate::net;
use pnet::datalink::{DataLinkReceiver, DataLinkSender, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::{MutablePacket, Packet};
use pnet::util::MacAddr;

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

const ROUTE_TABLE: &str = "/proc/net/route";
const RTF_UP: u32 = 0x1;
const RTF_GATEWAY: u32 = 0x2;

/// Default gateway as seen from one local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: MacAddr,
    pub interface: String,
    pub local_ip: Ipv4Addr,
    pub local_mac: MacAddr,
}

pub trait Resolve: Send + Sync {
    fn resolve(&self) -> Result<GatewayInfo>;
}

/// Resolves the default gateway's mac address with a broadcast ARP request.
#[derive(Debug, Clone)]
pub struct GatewayResolver {
    pub interface: Option<String>,
    pub timeout: Duration,
    pub attempts: u32,
}

impl Resolve for GatewayResolver {
    fn resolve(&self) -> Result<GatewayInfo> {
        let routes = std::fs::read_to_string(ROUTE_TABLE)
            .map_err(|e| Error::Resolution(format!("could not read {}: {}", ROUTE_TABLE, e)))?;
        let (iface_name, gateway_ip) = parse_default_gateway(&routes, self.interface.as_deref())
            .ok_or_else(|| Error::Resolution("no default gateway in route table".into()))?;

        let interface = net::find_interface(Some(&iface_name), None)
            .ok_or_else(|| Error::Resolution(format!("interface {} not found", iface_name)))?;
        let local_mac = interface
            .mac
            .ok_or_else(|| Error::Resolution(format!("{} has no mac address", iface_name)))?;
        let local_ip = interface_ipv4(&interface)
            .ok_or_else(|| Error::Resolution(format!("{} has no ipv4 address", iface_name)))?;

        debug!("resolving gateway {} on {}", gateway_ip, iface_name);

        let (mut tx, mut rx) = net::open_ethernet(&interface, Some(Duration::from_millis(100)))
            .map_err(|e| Error::Resolution(format!("could not open {}: {}", iface_name, e)))?;

        for attempt in 1..=self.attempts.max(1) {
            send_arp_request(tx.as_mut(), local_mac, local_ip, gateway_ip)
                .map_err(|e| Error::Resolution(format!("arp request failed: {}", e)))?;

            if let Some(gateway_mac) = await_arp_reply(rx.as_mut(), gateway_ip, self.timeout) {
                info!("gateway {} is at {} ({})", gateway_ip, gateway_mac, iface_name);
                return Ok(GatewayInfo {
                    gateway_ip,
                    gateway_mac,
                    interface: iface_name,
                    local_ip,
                    local_mac,
                });
            }
            debug!("no arp reply from {} (attempt {})", gateway_ip, attempt);
        }

        Err(Error::Resolution(format!("arp request for {} timed out", gateway_ip)))
    }
}

/// Finds the first usable default route in `/proc/net/route` content.
///
/// Gateway addresses are stored as little-endian hex. Loopback and zero
/// gateways are skipped.
pub fn parse_default_gateway(content: &str, interface: Option<&str>) -> Option<(String, Ipv4Addr)> {
    for line in content.lines().skip(1) {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        if fields.len() < 4 {
            continue;
        }
        if let Some(interface) = interface {
            if fields[0] != interface {
                continue;
            }
        }

        let flags = u32::from_str_radix(fields[3], 16).unwrap_or(0);
        if fields[1] != "00000000" || flags & (RTF_UP | RTF_GATEWAY) != (RTF_UP | RTF_GATEWAY) {
            continue;
        }

        let gateway = match u32::from_str_radix(fields[2], 16) {
            Ok(gateway) => Ipv4Addr::from(gateway.to_le_bytes()),
            Err(_) => continue,
        };
        if gateway.is_unspecified() || gateway.is_loopback() {
            continue;
        }

        return Some((fields[0].to_string(), gateway));
    }
    None
}

fn interface_ipv4(interface: &NetworkInterface) -> Option<Ipv4Addr> {
    interface.ips.iter().find_map(|net| match net.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    })
}

/// Builds a broadcast ARP request frame asking for `target_ip`.
pub fn arp_request(local_mac: MacAddr, local_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Result<[u8; 42]> {
    let mut buffer = [0u8; 42];
    {
        let mut eth = MutableEthernetPacket::new(&mut buffer)
            .ok_or(Error::InvalidSegment("ethernet buffer too small"))?;
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(local_mac);
        eth.set_ethertype(EtherTypes::Arp);

        let mut arp = MutableArpPacket::new(eth.payload_mut())
            .ok_or(Error::InvalidSegment("arp buffer too small"))?;
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(local_mac);
        arp.set_sender_proto_addr(local_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target_ip);
    }
    Ok(buffer)
}

/// Returns the sender mac if `frame` is an ARP reply from `target_ip`.
pub fn parse_arp_reply(frame: &[u8], target_ip: Ipv4Addr) -> Option<MacAddr> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(eth.payload())?;
    if arp.get_operation() != ArpOperations::Reply || arp.get_sender_proto_addr() != target_ip {
        return None;
    }
    Some(arp.get_sender_hw_addr())
}

fn send_arp_request(
    tx: &mut dyn DataLinkSender,
    local_mac: MacAddr,
    local_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Result<()> {
    let buffer = arp_request(local_mac, local_ip, target_ip)?;
    match tx.send_to(&buffer, None) {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(e.into()),
        None => Err(io::Error::new(io::ErrorKind::Other, "send_to returned None").into()),
    }
}

fn await_arp_reply(rx: &mut dyn DataLinkReceiver, target_ip: Ipv4Addr, timeout: Duration) -> Option<MacAddr> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match rx.next() {
            Ok(frame) => {
                if let Some(mac) = parse_arp_reply(frame, target_ip) {
                    return Some(mac);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => {
                debug!("reading arp reply failed: {}", e);
                return None;
            }
        }
    }
    None
}
