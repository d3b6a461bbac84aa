//! Device-bound packet sockets for the protocol responders.
//!
//! Every socket here is tied to exactly one interface via `SO_BINDTODEVICE`
//! at construction time. A wildcard socket on the host would observe every
//! domain's tap broadcast/multicast traffic, so device binding is not
//! optional. Sockets are built from the raw syscalls up, which keeps the
//! native descriptor available without any introspection of an opaque
//! handle.

use crate::error::Result;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// All-routers multicast group, the destination of Router Solicitations.
const ALL_ROUTERS_MULTICAST: [u8; 16] = [0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];

/// A packet socket restricted to a single named interface.
///
/// Shared between a responder thread (blocking receives) and the server
/// teardown path: [`DeviceSocket::shutdown`] wakes any pending receive, and
/// the responder treats a failed receive with the closed flag set as normal
/// termination. That is the only cancellation mechanism the responders have.
#[derive(Debug)]
pub struct DeviceSocket {
    sock: Socket,
    ifindex: u32,
    closed: AtomicBool,
}

/// Restrict a socket to one interface. This is the isolation primitive.
fn bind_to_device(sock: &Socket, device: &str) -> io::Result<()> {
    let name = std::ffi::CString::new(device)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name with NUL"))?;
    let ret = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr() as *const libc::c_void,
            name.as_bytes_with_nul().len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn ifindex(device: &str) -> io::Result<u32> {
    nix::net::if_::if_nametoindex(device).map_err(io::Error::from)
}

impl DeviceSocket {
    /// UDP socket for the DHCPv4 responder: bound to `0.0.0.0:port` with
    /// broadcast enabled, restricted to `device`.
    pub fn udp4(device: &str, port: u16) -> Result<Self> {
        let ifindex = ifindex(device)?;
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;
        sock.set_broadcast(true)?;
        sock.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        bind_to_device(&sock, device)?;

        Ok(DeviceSocket {
            sock,
            ifindex,
            closed: AtomicBool::new(false),
        })
    }

    /// Raw ICMPv6 socket for the RA responder: hop limit 255 (required for
    /// NDP), member of the all-routers group so Router Solicitations are
    /// delivered, restricted to `device`. Checksums are left to the kernel.
    pub fn icmp6(device: &str) -> Result<Self> {
        let ifindex = ifindex(device)?;

        let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_RAW, libc::IPPROTO_ICMPV6) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let sock = unsafe { Socket::from_raw_fd(fd) };

        let hops: libc::c_int = 255;
        for opt in [libc::IPV6_MULTICAST_HOPS, libc::IPV6_UNICAST_HOPS] {
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_IPV6,
                    opt,
                    &hops as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }

        bind_to_device(&sock, device)?;

        let mreq = libc::ipv6_mreq {
            ipv6mr_multiaddr: libc::in6_addr {
                s6_addr: ALL_ROUTERS_MULTICAST,
            },
            ipv6mr_interface: ifindex,
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_ADD_MEMBERSHIP,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(DeviceSocket {
            sock,
            ifindex,
            closed: AtomicBool::new(false),
        })
    }

    /// Kernel index of the bound interface.
    pub fn interface_index(&self) -> u32 {
        self.ifindex
    }

    /// Receive one datagram. Blocks until data arrives, the read timeout
    /// elapses, or the socket is shut down.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
        let spare = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
        };
        self.sock.recv_from(spare)
    }

    pub fn send_to(&self, buf: &[u8], addr: &SockAddr) -> io::Result<usize> {
        self.sock.send_to(buf, addr)
    }

    /// Receive timeout; `None` blocks indefinitely. The RA responder uses
    /// this as its periodic advertisement timer.
    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(dur)
    }

    /// Wake any pending receive and mark the socket closed. The descriptor
    /// itself is released when the last holder drops its handle.
    pub fn shutdown(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        match self.sock.shutdown(std::net::Shutdown::Both) {
            Ok(()) => Ok(()),
            // Datagram sockets are unconnected; Linux still wakes blocked
            // receivers before reporting ENOTCONN.
            Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp4_on_missing_interface_fails() {
        let err = DeviceSocket::udp4("guestnet-none0", 67).unwrap_err();
        assert!(matches!(err, crate::error::ServerError::Socket(_)));
    }

    #[test]
    fn icmp6_on_missing_interface_fails() {
        let err = DeviceSocket::icmp6("guestnet-none0").unwrap_err();
        assert!(matches!(err, crate::error::ServerError::Socket(_)));
    }

    #[test]
    fn shutdown_marks_closed() {
        // Loopback always exists, and binding to it needs no privileges.
        let sock = match DeviceSocket::udp4("lo", 0) {
            Ok(s) => s,
            // CAP_NET_RAW-restricted environments skip the live check.
            Err(_) => return,
        };
        assert!(!sock.is_closed());
        sock.shutdown().unwrap();
        assert!(sock.is_closed());
    }
}
