//! Network descriptor model and parsing.
//!
//! The descriptor is a small attribute-only XML document stored in the
//! domain's hypervisor metadata:
//!
//! ```xml
//! <network>
//!   <ip family="ipv4" address="10.0.0.5" prefix="24" gateway="10.0.0.1" host="true"/>
//!   <ip family="ipv6" address="2001:db8::" prefix="64" host="true"/>
//! </network>
//! <cloud-config url="https://example/cc.yml"/>
//! ```
//!
//! Addresses stay textual: the host-state reconciliation compares the
//! literal `address/prefix` string against the tap device's reported
//! addresses, so distinct spellings of the same network are distinct here.

use crate::error::{Result, ServerError};
use xml::reader::{EventReader, XmlEvent};

/// Address family of a descriptor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

/// One `<ip>` element of the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpEntry {
    pub family: Family,
    pub address: String,
    pub prefix: String,
    /// Explicit point-to-point peer. When absent the uplink's own IPv4
    /// address stands in as the peer identity.
    pub peer: Option<String>,
    /// `host="true"` marks an entry that is applied on the host side of the
    /// tap link. Entries without it are guest-informational only and never
    /// reconciled against host state.
    pub host: bool,
    pub gateway: Option<String>,
}

impl IpEntry {
    /// The `address/prefix` spelling used for the idempotence guard.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix)
    }
}

/// Parsed domain network metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// IP entries in document order.
    pub ips: Vec<IpEntry>,
    /// Opaque cloud-config URL, carried through uninterpreted.
    pub cloud_config_url: Option<String>,
}

impl Metadata {
    /// Parse the raw metadata document.
    ///
    /// Unknown elements and attributes are ignored; a structurally broken
    /// document or an `<ip>` element without `family`/`address` is an error.
    pub fn parse(doc: &str) -> Result<Self> {
        let mut meta = Metadata::default();

        for event in EventReader::new(doc.as_bytes()) {
            let event =
                event.map_err(|e| ServerError::Metadata(format!("malformed document: {e}")))?;
            let XmlEvent::StartElement {
                name, attributes, ..
            } = event
            else {
                continue;
            };

            match name.local_name.as_str() {
                "ip" => {
                    let mut family = None;
                    let mut address = None;
                    let mut prefix = String::new();
                    let mut peer = None;
                    let mut host = false;
                    let mut gateway = None;

                    for attr in &attributes {
                        let value = attr.value.clone();
                        match attr.name.local_name.as_str() {
                            "family" => {
                                family = Some(match value.as_str() {
                                    "ipv4" => Family::Ipv4,
                                    "ipv6" => Family::Ipv6,
                                    other => {
                                        return Err(ServerError::Metadata(format!(
                                            "unknown address family '{other}'"
                                        )));
                                    }
                                });
                            }
                            "address" => address = Some(value),
                            "prefix" => prefix = value,
                            "peer" => peer = Some(value),
                            "host" => host = value == "true",
                            "gateway" => gateway = Some(value),
                            _ => {}
                        }
                    }

                    let family = family.ok_or_else(|| {
                        ServerError::Metadata("ip element without family".into())
                    })?;
                    let address = address.ok_or_else(|| {
                        ServerError::Metadata("ip element without address".into())
                    })?;

                    meta.ips.push(IpEntry {
                        family,
                        address,
                        prefix,
                        peer,
                        host,
                        gateway,
                    });
                }
                "cloud-config" => {
                    for attr in &attributes {
                        if attr.name.local_name == "url" {
                            meta.cloud_config_url = Some(attr.value.clone());
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(meta)
    }

    /// Host-flagged entries of one family, in document order.
    pub fn host_entries(&self, family: Family) -> impl Iterator<Item = &IpEntry> {
        self.ips
            .iter()
            .filter(move |ip| ip.host && ip.family == family)
    }
}

/// Drop descriptor entries whose `address/prefix` already exists on the tap
/// device.
///
/// This is the idempotence guard for repeated `Server::start`: whatever the
/// device already carries needs no further mutation. The comparison is a
/// literal string match, each existing address removes at most one entry.
pub fn prune_existing(existing: &[String], entries: &[IpEntry]) -> Vec<IpEntry> {
    let mut remaining: Vec<IpEntry> = entries.to_vec();
    for addr in existing {
        if let Some(pos) = remaining.iter().position(|ip| ip.cidr() == *addr) {
            remaining.remove(pos);
        }
    }
    remaining
}
