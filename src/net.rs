use crate::connection::Connection;
use crate::errors::*;
use pnet::datalink::Channel::Ethernet;
use pnet::datalink::{self, Config, DataLinkReceiver, DataLinkSender, NetworkInterface};
use pnet::packet::ethernet::{EtherType, EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::tcp::MutableTcpPacket;
use pnet::packet::MutablePacket;
use pnet::transport::TransportChannelType::Layer3;
use pnet::transport::{transport_channel, TransportSender};
use pnet::util::MacAddr;

pub use pnet::packet::tcp::{ipv4_checksum, ipv6_checksum, TcpFlags};

use pktparse::ethernet;
use pktparse::tcp;
use pktparse::{ip, ipv4 as ipv4_parse, ipv6 as ipv6_parse};

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Window advertised by forged segments on the ip layer path.
pub const DEFAULT_WINDOW: u16 = 8192;

const ETHERNET_HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Rst,
    RstAck,
}

impl ResetKind {
    pub const ALL: [ResetKind; 2] = [ResetKind::Rst, ResetKind::RstAck];
}

/// A forged tcp reset, addressed like the client's own traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub kind: ResetKind,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub window: u16,
}

impl Segment {
    #[inline]
    pub fn reset(conn: &Connection, kind: ResetKind, sequence: u32, window: u16) -> Segment {
        Segment {
            source: conn.local,
            destination: conn.remote,
            kind,
            sequence,
            acknowledgement: 0,
            window,
        }
    }
}

/// A tcp segment seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedSegment {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub sequence: u32,
    pub payload_len: u32,
    pub rst: bool,
}

/// Picks the interface by name, or the first usable one carrying `address`,
/// or the first usable one at all.
pub fn find_interface(name: Option<&str>, address: Option<IpAddr>) -> Option<NetworkInterface> {
    let interfaces = datalink::interfaces();

    if let Some(name) = name {
        return interfaces.into_iter().find(|iface| iface.name == name);
    }

    let usable = |iface: &&NetworkInterface| iface.is_up() && !iface.is_loopback() && !iface.ips.is_empty();

    if let Some(address) = address {
        if let Some(iface) = interfaces
            .iter()
            .filter(usable)
            .find(|iface| iface.ips.iter().any(|net| net.ip() == address))
        {
            return Some(iface.clone());
        }
    }

    interfaces.iter().find(usable).cloned()
}

pub fn open_ethernet(
    interface: &NetworkInterface,
    read_timeout: Option<Duration>,
) -> io::Result<(Box<dyn DataLinkSender>, Box<dyn DataLinkReceiver>)> {
    let config = Config {
        read_timeout,
        ..Default::default()
    };
    match datalink::channel(interface, config)? {
        Ethernet(tx, rx) => Ok((tx, rx)),
        _ => Err(io::Error::new(io::ErrorKind::Other, "unhandled channel type")),
    }
}

pub fn create_socket() -> io::Result<TransportSender> {
    let protocol = Layer3(IpNextHeaderProtocols::Tcp);
    let (tx, _rx) = transport_channel(4096, protocol)?;
    Ok(tx)
}

/// Reads frames until `should_stop` returns true, handing every tcp segment
/// to `callback`. The stop predicate is checked between frames and after each
/// read timeout, so a quiet link still notices the stop signal.
pub fn sniff<S, F>(interface: &NetworkInterface, read_timeout: Duration, mut should_stop: S, mut callback: F) -> Result<()>
where
    S: FnMut() -> bool,
    F: FnMut(ObservedSegment),
{
    let (_, mut rx) = open_ethernet(interface, Some(read_timeout))
        .map_err(|e| Error::Capture(format!("could not open {}: {}", interface.name, e)))?;

    while !should_stop() {
        match rx.next() {
            Ok(packet) => {
                if let Some(segment) = parse_frame(packet) {
                    trace!("tcp: {:?}", segment);
                    callback(segment);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => {
                return Err(Error::Capture(format!(
                    "reading from {} failed: {}",
                    interface.name, e
                )))
            }
        }
    }

    Ok(())
}

/// Extracts the tcp header fields of an ethernet frame.
///
/// The payload length comes from the ip length fields rather than the bytes
/// left in the frame, short segments are padded on ethernet.
pub fn parse_frame(frame: &[u8]) -> Option<ObservedSegment> {
    let (remaining, eth_frame) = ethernet::parse_ethernet_frame(frame).ok()?;

    match eth_frame.ethertype {
        ethernet::EtherType::IPv4 => {
            let (after_ip, ip_hdr) = ipv4_parse::parse_ipv4_header(remaining).ok()?;
            if ip_hdr.protocol != ip::IPProtocol::TCP {
                return None;
            }
            let header_len = remaining.len() - after_ip.len();
            let segment_len = usize::from(ip_hdr.length).checked_sub(header_len)?;
            parse_segment(
                IpAddr::V4(ip_hdr.source_addr),
                IpAddr::V4(ip_hdr.dest_addr),
                after_ip,
                segment_len,
            )
        }
        ethernet::EtherType::IPv6 => {
            let (after_ip, ip_hdr) = ipv6_parse::parse_ipv6_header(remaining).ok()?;
            if ip_hdr.next_header != ip::IPProtocol::TCP {
                return None;
            }
            parse_segment(
                IpAddr::V6(ip_hdr.source_addr),
                IpAddr::V6(ip_hdr.dest_addr),
                after_ip,
                usize::from(ip_hdr.length),
            )
        }
        _ => None,
    }
}

fn parse_segment(source: IpAddr, destination: IpAddr, segment: &[u8], segment_len: usize) -> Option<ObservedSegment> {
    let (payload, tcp_hdr) = tcp::parse_tcp_header(segment).ok()?;
    let header_len = segment.len() - payload.len();
    let payload_len = segment_len.saturating_sub(header_len);

    Some(ObservedSegment {
        source: SocketAddr::new(source, tcp_hdr.source_port),
        destination: SocketAddr::new(destination, tcp_hdr.dest_port),
        sequence: tcp_hdr.sequence_no,
        payload_len: payload_len as u32,
        rst: tcp_hdr.flag_rst,
    })
}

/// Builds the ip packet (header and tcp segment) for `segment`.
pub fn build_ip_packet(segment: &Segment) -> Result<Vec<u8>> {
    let mut buf = vec![0; ip_packet_len(segment)?];
    write_ip_packet(&mut buf, segment)?;
    Ok(buf)
}

/// Builds a full ethernet frame carrying `segment`.
pub fn build_ethernet_frame(source_mac: MacAddr, destination_mac: MacAddr, segment: &Segment) -> Result<Vec<u8>> {
    let mut buf = vec![0; ETHERNET_HEADER_LEN + ip_packet_len(segment)?];

    let mut eth = MutableEthernetPacket::new(&mut buf).ok_or(Error::InvalidSegment("ethernet buffer too small"))?;
    eth.set_destination(destination_mac);
    eth.set_source(source_mac);
    eth.set_ethertype(ethertype(segment));
    write_ip_packet(eth.payload_mut(), segment)?;

    Ok(buf)
}

/// Sends `segment` through the raw ipv4 socket from [`create_socket`].
/// IPv6 segments can only go out on the link layer.
pub fn send_ip_segment(tx: &mut TransportSender, segment: &Segment) -> Result<()> {
    if !segment.destination.is_ipv4() {
        return Err(Error::InvalidSegment("raw ip socket is ipv4 only"));
    }

    let buf = build_ip_packet(segment)?;
    let pkt = Ipv4Packet::new(&buf).ok_or(Error::InvalidSegment("ipv4 buffer too small"))?;
    let sent = tx.send_to(pkt, segment.destination.ip());

    match sent {
        Ok(bytes) if bytes == buf.len() => Ok(()),
        Ok(bytes) => Err(Error::Transmission(format!("short send count: {}", bytes))),
        Err(e) => Err(Error::Transmission(format!("could not send: {}", e))),
    }
}

fn ethertype(segment: &Segment) -> EtherType {
    match segment.destination {
        SocketAddr::V4(_) => EtherTypes::Ipv4,
        SocketAddr::V6(_) => EtherTypes::Ipv6,
    }
}

fn ip_packet_len(segment: &Segment) -> Result<usize> {
    let tcp_len = MutableTcpPacket::minimum_packet_size();
    match (segment.source, segment.destination) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) => Ok(MutableIpv4Packet::minimum_packet_size() + tcp_len),
        (SocketAddr::V6(_), SocketAddr::V6(_)) => Ok(MutableIpv6Packet::minimum_packet_size() + tcp_len),
        _ => Err(Error::InvalidSegment("invalid ipv4/ipv6 combination")),
    }
}

fn write_ip_packet(buf: &mut [u8], segment: &Segment) -> Result<()> {
    let tcp_len = MutableTcpPacket::minimum_packet_size();

    match (segment.source, segment.destination) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
            let total_len = MutableIpv4Packet::minimum_packet_size() + tcp_len;
            let ipv4_header_len = match MutableIpv4Packet::minimum_packet_size().checked_div(4) {
                Some(l) => l as u8,
                None => return Err(Error::InvalidSegment("invalid header len")),
            };

            let mut ipv4 = MutableIpv4Packet::new(buf).ok_or(Error::InvalidSegment("ipv4 buffer too small"))?;
            ipv4.set_version(4);
            ipv4.set_header_length(ipv4_header_len);
            ipv4.set_total_length(total_len as u16);
            ipv4.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            ipv4.set_source(*src.ip());
            ipv4.set_destination(*dst.ip());
            ipv4.set_ttl(64);
            ipv4.set_flags(Ipv4Flags::DontFragment);

            gentcp(ipv4.payload_mut(), segment)?;

            let checksum = ipv4::checksum(&ipv4.to_immutable());
            ipv4.set_checksum(checksum);
        }
        (SocketAddr::V6(src), SocketAddr::V6(dst)) => {
            let mut ipv6 = MutableIpv6Packet::new(buf).ok_or(Error::InvalidSegment("ipv6 buffer too small"))?;
            ipv6.set_version(6);
            ipv6.set_payload_length(tcp_len as u16);
            ipv6.set_next_header(IpNextHeaderProtocols::Tcp);
            ipv6.set_hop_limit(64);
            ipv6.set_source(*src.ip());
            ipv6.set_destination(*dst.ip());

            gentcp(ipv6.payload_mut(), segment)?;
        }
        _ => return Err(Error::InvalidSegment("invalid ipv4/ipv6 combination")),
    }

    Ok(())
}

fn gentcp(payload_mut: &mut [u8], segment: &Segment) -> Result<()> {
    let mut tcp = MutableTcpPacket::new(payload_mut).ok_or(Error::InvalidSegment("tcp buffer too small"))?;

    let tcp_header_len = match MutableTcpPacket::minimum_packet_size().checked_div(4) {
        Some(l) => l as u8,
        None => return Err(Error::InvalidSegment("invalid header len")),
    };
    tcp.set_data_offset(tcp_header_len);

    tcp.set_source(segment.source.port());
    tcp.set_destination(segment.destination.port());
    tcp.set_sequence(segment.sequence);
    tcp.set_acknowledgement(segment.acknowledgement);
    match segment.kind {
        ResetKind::Rst => tcp.set_flags(TcpFlags::RST),
        ResetKind::RstAck => tcp.set_flags(TcpFlags::RST | TcpFlags::ACK),
    }
    tcp.set_window(segment.window);

    let chk = match (segment.source, segment.destination) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) => ipv4_checksum(&tcp.to_immutable(), src.ip(), dst.ip()),
        (SocketAddr::V6(src), SocketAddr::V6(dst)) => ipv6_checksum(&tcp.to_immutable(), src.ip(), dst.ip()),
        _ => return Err(Error::InvalidSegment("invalid ipv4/ipv6 combination")),
    };
    tcp.set_checksum(chk);
    Ok(())
}
