//! Host-side network state: address/route/sysctl mutations and interface
//! address enumeration.
//!
//! All mutations go through the `ip` and `sysctl` binaries. Commands are
//! synchronous; the first failure is returned to the caller and nothing is
//! retried or rolled back.

use crate::error::{Result, ServerError};
use std::process::Command;
use tracing::debug;

/// Routing table receiving the per-domain IPv6 static routes, isolated from
/// the main table.
pub const STATIC_ROUTE_TABLE: &str = "200";

fn run(program: &str, args: &[String], subject: &str) -> Result<()> {
    debug!(%program, ?args, "host mutation");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| ServerError::NetworkMutation {
            subject: subject.to_string(),
            detail: format!("failed to execute {program}: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ServerError::NetworkMutation {
            subject: subject.to_string(),
            detail: stderr.trim().to_string(),
        });
    }
    Ok(())
}

pub(crate) fn addr_add_args(family: &str, cidr: &str, peer: Option<&str>, dev: &str) -> Vec<String> {
    let mut args = vec![family.to_string(), "addr".into(), "add".into(), cidr.into()];
    if let Some(peer) = peer {
        args.push("peer".into());
        args.push(peer.into());
    }
    args.push("dev".into());
    args.push(dev.into());
    args
}

pub(crate) fn route_args(op: &str, cidr: &str, dev: &str) -> Vec<String> {
    [
        "-6", "route", op, cidr, "dev", dev, "proto", "static", "table", STATIC_ROUTE_TABLE,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Add an IPv4 address to an interface, optionally as a point-to-point pair.
pub fn add_address_v4(dev: &str, cidr: &str, peer: Option<&str>) -> Result<()> {
    run("ip", &addr_add_args("-4", cidr, peer, dev), cidr)
}

/// Add an IPv6 address to an interface.
pub fn add_address_v6(dev: &str, cidr: &str) -> Result<()> {
    run("ip", &addr_add_args("-6", cidr, None, dev), cidr)
}

/// Install (or refresh) the static route for a prefix in the dedicated table.
pub fn replace_route_v6(dev: &str, cidr: &str) -> Result<()> {
    run("ip", &route_args("replace", cidr, dev), cidr)
}

/// Remove the static route for a prefix from the dedicated table.
pub fn delete_route_v6(dev: &str, cidr: &str) -> Result<()> {
    run("ip", &route_args("del", cidr, dev), cidr)
}

/// Enable proxy-ARP on an interface so the point-to-point peer resolves
/// without an explicit route on the far side.
pub fn enable_proxy_arp(dev: &str) -> Result<()> {
    let key = format!("net.ipv4.conf.{dev}.proxy_arp=1");
    run("sysctl", &["-w".to_string(), key.clone()], &key)
}

/// List the addresses currently assigned to an interface as
/// `address/prefix` strings, the spelling the kernel reports.
///
/// Lines look like:
/// `2: vlan1001    inet 10.1.2.3/24 brd 10.1.2.255 scope global vlan1001`
pub fn interface_addresses(dev: &str) -> Result<Vec<String>> {
    let output = Command::new("ip")
        .args(["-o", "addr", "show", "dev", dev])
        .output()
        .map_err(|e| ServerError::Interface(dev.to_string(), e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ServerError::Interface(
            dev.to_string(),
            stderr.trim().to_string(),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_addr_show(&stdout))
}

pub(crate) fn parse_addr_show(stdout: &str) -> Vec<String> {
    let mut addrs = Vec::new();
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        // index, name, family, address/prefix
        let family = fields.nth(2);
        if !matches!(family, Some("inet") | Some("inet6")) {
            continue;
        }
        if let Some(addr) = fields.next() {
            addrs.push(addr.to_string());
        }
    }
    addrs
}

/// First IPv4 address on the uplink interface, without its prefix. Used as
/// the point-to-point peer identity for entries that carry none.
pub fn uplink_ipv4(dev: &str) -> Result<Option<String>> {
    Ok(first_ipv4(&interface_addresses(dev)?))
}

pub(crate) fn first_ipv4(addrs: &[String]) -> Option<String> {
    addrs.iter().find_map(|addr| {
        let bare = addr.split('/').next().unwrap_or(addr);
        bare.parse::<std::net::Ipv4Addr>()
            .ok()
            .map(|ip| ip.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_add_with_peer() {
        let args = addr_add_args("-4", "10.0.0.5/24", Some("10.1.2.3"), "tapvm1");
        assert_eq!(
            args,
            vec!["-4", "addr", "add", "10.0.0.5/24", "peer", "10.1.2.3", "dev", "tapvm1"]
        );
    }

    #[test]
    fn addr_add_without_peer() {
        let args = addr_add_args("-6", "2001:db8::/64", None, "tapvm1");
        assert_eq!(args, vec!["-6", "addr", "add", "2001:db8::/64", "dev", "tapvm1"]);
    }

    #[test]
    fn route_replace_uses_dedicated_table() {
        let args = route_args("replace", "2001:db8::/64", "tapvm1");
        assert_eq!(
            args,
            vec![
                "-6",
                "route",
                "replace",
                "2001:db8::/64",
                "dev",
                "tapvm1",
                "proto",
                "static",
                "table",
                STATIC_ROUTE_TABLE
            ]
        );
    }

    #[test]
    fn parse_addr_show_output() {
        let out = "\
2: vlan1001    inet 10.1.2.3/24 brd 10.1.2.255 scope global vlan1001\\       valid_lft forever preferred_lft forever
2: vlan1001    inet6 fe80::1/64 scope link \\       valid_lft forever preferred_lft forever
";
        assert_eq!(parse_addr_show(out), vec!["10.1.2.3/24", "fe80::1/64"]);
    }

    #[test]
    fn parse_addr_show_skips_noise() {
        assert!(parse_addr_show("").is_empty());
        assert!(parse_addr_show("2: eth0 link/ether aa:bb\n").is_empty());
    }

    #[test]
    fn first_ipv4_skips_ipv6() {
        let addrs = vec!["fe80::1/64".to_string(), "10.1.2.3/24".to_string()];
        assert_eq!(first_ipv4(&addrs), Some("10.1.2.3".to_string()));
        assert_eq!(first_ipv4(&["fe80::1/64".to_string()]), None);
        assert_eq!(first_ipv4(&[]), None);
    }
}
