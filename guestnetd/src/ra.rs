//! ICMPv6 Router Advertisement responder for a single domain.
//!
//! Advertises every host-flagged IPv6 prefix from the descriptor with the
//! on-link and autonomous flags set, both on a periodic timer and in answer
//! to Router Solicitations. The advertisement's source address is the tap
//! device's link-local address (kernel source selection on the raw socket),
//! which makes the host the guest's default router.

use crate::metadata::{Family, Metadata};
use crate::socket::DeviceSocket;
use socket2::SockAddr;
use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const ICMPV6_ROUTER_SOLICITATION: u8 = 133;
const ICMPV6_ROUTER_ADVERTISEMENT: u8 = 134;

/// All-nodes multicast group, the destination for advertisements.
const ALL_NODES_MULTICAST: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Unsolicited advertisement interval. Doubles as the receive timeout of
/// the responder loop.
const ADVERTISE_INTERVAL: Duration = Duration::from_secs(200);

/// Router lifetime announced to the guest, seconds.
const ROUTER_LIFETIME: u16 = 1800;

/// Advertised prefixes never expire; the descriptor is the single source of
/// truth for the guest's addressing.
const INFINITE_LIFETIME: u32 = u32::MAX;

/// Prefixes advertised to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaConfig {
    pub prefixes: Vec<(Ipv6Addr, u8)>,
}

impl RaConfig {
    /// Host-flagged IPv6 entries that parse cleanly, in document order.
    pub fn from_metadata(meta: &Metadata) -> Self {
        let prefixes = meta
            .host_entries(Family::Ipv6)
            .filter_map(|ip| {
                let addr = ip.address.parse().ok()?;
                let prefix_len: u8 = ip.prefix.parse().ok()?;
                Some((addr, prefix_len))
            })
            .collect();
        RaConfig { prefixes }
    }
}

/// Serve Router Advertisements on the device socket until it is shut down.
///
/// The receive timeout is the periodic advertisement timer; any other
/// receive failure with the closed flag set is normal termination.
pub fn serve(name: &str, socket: Arc<DeviceSocket>, config: RaConfig) {
    let dest = advertisement_destination(socket.interface_index());
    let advertisement = build_router_advertisement(&config);
    let mut buf = [0u8; 1500];

    if let Err(e) = socket.set_read_timeout(Some(ADVERTISE_INTERVAL)) {
        warn!(%name, error = %e, "failed to arm RA timer");
    }

    // Routers announce themselves without waiting to be asked.
    send_advertisement(name, &socket, &advertisement, &dest);

    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, _)) => {
                if socket.is_closed() {
                    debug!(%name, "RA responder socket closed, exiting");
                    return;
                }
                if is_router_solicitation(&buf[..len]) {
                    debug!(%name, "Router Solicitation received");
                    send_advertisement(name, &socket, &advertisement, &dest);
                }
            }
            Err(e) if is_timeout(&e) => {
                send_advertisement(name, &socket, &advertisement, &dest);
            }
            Err(e) => {
                if socket.is_closed() {
                    debug!(%name, "RA responder socket closed, exiting");
                    return;
                }
                warn!(%name, error = %e, "RA receive failed");
            }
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn send_advertisement(name: &str, socket: &DeviceSocket, packet: &[u8], dest: &SockAddr) {
    if let Err(e) = socket.send_to(packet, dest) {
        if !socket.is_closed() {
            warn!(%name, error = %e, "failed to send Router Advertisement");
        }
    }
}

fn advertisement_destination(ifindex: u32) -> SockAddr {
    SocketAddrV6::new(ALL_NODES_MULTICAST, 0, 0, ifindex).into()
}

/// Minimal RS validation: type, code, fixed header length.
pub fn is_router_solicitation(data: &[u8]) -> bool {
    data.len() >= 8 && data[0] == ICMPV6_ROUTER_SOLICITATION && data[1] == 0
}

/// Build the ICMPv6 Router Advertisement payload. The IPv6 header and the
/// checksum are supplied by the kernel on the raw socket.
pub fn build_router_advertisement(config: &RaConfig) -> Vec<u8> {
    // Fixed part: type(1) code(1) checksum(2) hop-limit(1) flags(1)
    // router-lifetime(2) reachable(4) retrans(4) = 16 bytes.
    let mut packet = vec![0u8; 16 + 32 * config.prefixes.len()];

    packet[0] = ICMPV6_ROUTER_ADVERTISEMENT;
    packet[4] = 64; // Cur Hop Limit
    // Flags stay clear: addressing comes from SLAAC, not DHCPv6.
    packet[6..8].copy_from_slice(&ROUTER_LIFETIME.to_be_bytes());
    // Reachable Time and Retrans Timer unspecified.

    for (i, (prefix, prefix_len)) in config.prefixes.iter().enumerate() {
        let opt = &mut packet[16 + 32 * i..16 + 32 * (i + 1)];
        opt[0] = 3; // Prefix Information
        opt[1] = 4; // length in 8-byte units
        opt[2] = *prefix_len;
        opt[3] = 0x80 | 0x40; // L (on-link) | A (autonomous)
        opt[4..8].copy_from_slice(&INFINITE_LIFETIME.to_be_bytes());
        opt[8..12].copy_from_slice(&INFINITE_LIFETIME.to_be_bytes());
        // 4 reserved bytes, then the prefix itself.
        opt[16..32].copy_from_slice(&prefix.octets());
    }

    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    #[test]
    fn advertisement_carries_prefix_with_flags() {
        let config = RaConfig {
            prefixes: vec![("2001:db8::".parse().unwrap(), 64)],
        };
        let packet = build_router_advertisement(&config);

        assert_eq!(packet.len(), 48);
        assert_eq!(packet[0], ICMPV6_ROUTER_ADVERTISEMENT);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4], 64);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 1800);

        // Prefix Information option
        assert_eq!(packet[16], 3);
        assert_eq!(packet[17], 4);
        assert_eq!(packet[18], 64);
        assert_eq!(packet[19] & 0x80, 0x80, "on-link flag");
        assert_eq!(packet[19] & 0x40, 0x40, "autonomous flag");
        let prefix: Ipv6Addr = "2001:db8::".parse().unwrap();
        assert_eq!(&packet[32..48], &prefix.octets());
    }

    #[test]
    fn advertisement_lists_every_prefix() {
        let config = RaConfig {
            prefixes: vec![
                ("2001:db8:1::".parse().unwrap(), 64),
                ("2001:db8:2::".parse().unwrap(), 56),
            ],
        };
        let packet = build_router_advertisement(&config);

        assert_eq!(packet.len(), 16 + 64);
        assert_eq!(packet[18], 64);
        assert_eq!(packet[48 + 2], 56);
        let second: Ipv6Addr = "2001:db8:2::".parse().unwrap();
        assert_eq!(&packet[48 + 16..48 + 32], &second.octets());
    }

    #[test]
    fn advertisement_without_prefixes_is_header_only() {
        let packet = build_router_advertisement(&RaConfig { prefixes: vec![] });
        assert_eq!(packet.len(), 16);
        assert_eq!(packet[0], ICMPV6_ROUTER_ADVERTISEMENT);
    }

    #[test]
    fn router_solicitation_detection() {
        assert!(is_router_solicitation(&[133, 0, 0, 0, 0, 0, 0, 0]));
        // Too short
        assert!(!is_router_solicitation(&[133, 0, 0]));
        // Neighbor solicitation
        assert!(!is_router_solicitation(&[135, 0, 0, 0, 0, 0, 0, 0]));
        // Nonzero code
        assert!(!is_router_solicitation(&[133, 1, 0, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn config_from_metadata_collects_host_ipv6() {
        let meta = Metadata::parse(
            r#"<network>
                 <ip family="ipv4" address="10.0.0.5" prefix="24" host="true"/>
                 <ip family="ipv6" address="2001:db8::" prefix="64" host="true"/>
                 <ip family="ipv6" address="2001:db8:ff::" prefix="48"/>
               </network>"#,
        )
        .unwrap();

        let config = RaConfig::from_metadata(&meta);
        assert_eq!(config.prefixes, vec![("2001:db8::".parse().unwrap(), 64)]);
    }
}
