//! DHCPv4 responder for a single domain.
//!
//! Serves exactly the statically pinned address from the domain descriptor;
//! there is no pool and no lease state. Each exchange is handled
//! independently: DISCOVER is answered with an OFFER of the configured
//! address, a REQUEST for that address with an ACK, a REQUEST for anything
//! else with a NAK.

use crate::metadata::{Family, Metadata};
use crate::socket::DeviceSocket;
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Encodable};
use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tracing::{debug, warn};

const DHCP_CLIENT_PORT: u16 = 68;

/// One legitimate client per device, so the lease never has to expire.
const LEASE_TIME: u32 = u32::MAX;

/// The address this responder hands out, derived from the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpConfig {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
}

impl DhcpConfig {
    /// First host-flagged IPv4 entry that parses cleanly.
    pub fn from_metadata(meta: &Metadata) -> Option<Self> {
        meta.host_entries(Family::Ipv4).find_map(|ip| {
            let address = ip.address.parse().ok()?;
            let prefix_len: u8 = ip.prefix.parse().ok()?;
            let gateway = match &ip.gateway {
                Some(gw) => Some(gw.parse().ok()?),
                None => None,
            };
            Some(DhcpConfig {
                address,
                prefix_len,
                gateway,
            })
        })
    }

    fn netmask(&self) -> Ipv4Addr {
        Ipv4Net::new(self.address, self.prefix_len)
            .map(|net| net.netmask())
            .unwrap_or(Ipv4Addr::BROADCAST)
    }
}

/// Serve DHCPv4 on the device socket until it is shut down.
///
/// Socket shutdown is the only cancellation mechanism: a failed receive
/// with the closed flag set is normal termination.
pub fn serve(name: &str, socket: Arc<DeviceSocket>, config: Option<DhcpConfig>) {
    let mut buf = [0u8; 1500];

    loop {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e) => {
                if socket.is_closed() {
                    debug!(%name, "DHCPv4 responder socket closed, exiting");
                    return;
                }
                warn!(%name, error = %e, "DHCPv4 receive failed");
                continue;
            }
        };
        if socket.is_closed() {
            debug!(%name, "DHCPv4 responder socket closed, exiting");
            return;
        }

        let Some(config) = config else {
            continue;
        };
        let request = match Message::from_bytes(&buf[..len]) {
            Ok(msg) => msg,
            Err(_) => continue,
        };
        let Some(reply) = handle_message(&config, &request) else {
            continue;
        };

        let bytes = match reply.to_vec() {
            Ok(b) => b,
            Err(e) => {
                warn!(%name, error = %e, "failed to encode DHCPv4 reply");
                continue;
            }
        };
        let dest = reply_destination(&request);
        if let Err(e) = socket.send_to(&bytes, &dest.into()) {
            if socket.is_closed() {
                return;
            }
            warn!(%name, error = %e, dest = %dest, "failed to send DHCPv4 reply");
        }
    }
}

/// Per-exchange state machine. Returns the reply, if the datagram warrants
/// one.
pub fn handle_message(config: &DhcpConfig, request: &Message) -> Option<Message> {
    if request.opcode() != Opcode::BootRequest {
        return None;
    }

    let msg_type = match request.opts().get(OptionCode::MessageType) {
        Some(DhcpOption::MessageType(mt)) => *mt,
        _ => return None,
    };

    match msg_type {
        MessageType::Discover => {
            debug!(offered = %config.address, xid = request.xid(), "DISCOVER, sending OFFER");
            Some(build_reply(config, request, MessageType::Offer))
        }
        MessageType::Request => {
            let requested = match request.opts().get(OptionCode::RequestedIpAddress) {
                Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
                _ => None,
            };
            match requested {
                Some(ip) if ip != config.address => {
                    debug!(requested = %ip, configured = %config.address, "wrong address, sending NAK");
                    Some(build_nak(config, request))
                }
                _ => {
                    debug!(assigned = %config.address, xid = request.xid(), "REQUEST, sending ACK");
                    Some(build_reply(config, request, MessageType::Ack))
                }
            }
        }
        _ => None,
    }
}

fn build_reply(config: &DhcpConfig, request: &Message, msg_type: MessageType) -> Message {
    let mut reply = Message::default();
    reply.set_opcode(Opcode::BootReply);
    reply.set_htype(request.htype());
    reply.set_xid(request.xid());
    reply.set_flags(request.flags());
    reply.set_yiaddr(config.address);
    reply.set_siaddr(config.address);
    reply.set_chaddr(request.chaddr());

    let opts = reply.opts_mut();
    opts.insert(DhcpOption::MessageType(msg_type));
    opts.insert(DhcpOption::ServerIdentifier(config.address));
    opts.insert(DhcpOption::AddressLeaseTime(LEASE_TIME));
    opts.insert(DhcpOption::SubnetMask(config.netmask()));
    if let Some(gw) = config.gateway {
        opts.insert(DhcpOption::Router(vec![gw]));
    }

    reply
}

fn build_nak(config: &DhcpConfig, request: &Message) -> Message {
    let mut reply = Message::default();
    reply.set_opcode(Opcode::BootReply);
    reply.set_htype(request.htype());
    reply.set_xid(request.xid());
    reply.set_chaddr(request.chaddr());

    let opts = reply.opts_mut();
    opts.insert(DhcpOption::MessageType(MessageType::Nak));
    opts.insert(DhcpOption::ServerIdentifier(config.address));

    reply
}

/// A client with no committed address cannot receive unicast; reply to the
/// broadcast address unless the request carries a usable `ciaddr`.
fn reply_destination(request: &Message) -> SocketAddrV4 {
    if !request.flags().broadcast() && request.ciaddr() != Ipv4Addr::UNSPECIFIED {
        SocketAddrV4::new(request.ciaddr(), DHCP_CLIENT_PORT)
    } else {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
    }
}
