//! Per-domain server lifecycle and the process-wide registry.
//!
//! A [`Server`] owns everything one domain needs: the parsed descriptor,
//! the hypervisor connection, and the two responder sockets. `start`
//! reconciles host state and then parks until `stop` is called from
//! another task; the responder threads are cancelled purely by shutting
//! their sockets down.

use crate::dhcp::{self, DhcpConfig};
use crate::error::{Result, ServerError};
use crate::hostnet;
use crate::hypervisor::{METADATA_NAMESPACE, VMM_API_SOCKET, VmmClient};
use crate::metadata::{self, Family, Metadata};
use crate::ra::{self, RaConfig};
use crate::socket::DeviceSocket;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

/// Host uplink carrying the point-to-point peer identity.
pub const UPLINK_IFACE: &str = "vlan1001";

const DHCP_SERVER_PORT: u16 = 67;

/// State owned by the per-server lock. Socket and connection handles are
/// populated only between a successful `start` and the matching `stop`.
#[derive(Debug, Default)]
struct ServerState {
    metadata: Option<Metadata>,
    vmm: Option<VmmClient>,
    dhcp_socket: Option<Arc<DeviceSocket>>,
    ra_socket: Option<Arc<DeviceSocket>>,
}

/// One provisioning server per domain.
#[derive(Debug)]
pub struct Server {
    name: String,
    shutdown: AtomicBool,
    state: Mutex<ServerState>,
    cancel: Notify,
    vmm_socket: PathBuf,
    uplink: String,
}

impl Server {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_paths(name, VMM_API_SOCKET, UPLINK_IFACE)
    }

    pub fn with_paths(
        name: impl Into<String>,
        vmm_socket: impl Into<PathBuf>,
        uplink: impl Into<String>,
    ) -> Self {
        Server {
            name: name.into(),
            shutdown: AtomicBool::new(false),
            state: Mutex::new(ServerState::default()),
            cancel: Notify::new(),
            vmm_socket: vmm_socket.into(),
            uplink: uplink.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host-side interface paired with this domain's NIC.
    pub fn tap_device(&self) -> String {
        format!("tap{}", self.name)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Fetch the descriptor, reconcile host state, spawn both responders,
    /// then park until [`Server::stop`] triggers the cancellation signal.
    ///
    /// Any failure aborts the remaining steps and is returned as the
    /// matching [`ServerError`] stage; host mutations already applied stay
    /// in place, and a re-run relies on the reconciliation guard instead
    /// of rollback.
    pub async fn start(&self) -> Result<()> {
        // Created before setup so a concurrent `stop` cannot signal into
        // the void between lock release and park.
        let cancelled = self.cancel.notified();

        {
            let mut state = self.state.lock().await;
            self.shutdown.store(false, Ordering::SeqCst);
            self.setup(&mut state).await?;
        }

        info!(name = %self.name, "serving");
        cancelled.await;
        Ok(())
    }

    async fn setup(&self, state: &mut ServerState) -> Result<()> {
        if self.name.is_empty() {
            return Err(ServerError::Config("empty domain name".into()));
        }
        let tap = self.tap_device();

        let vmm = VmmClient::connect_read_only(&self.vmm_socket)?;
        let domain = vmm.lookup_domain(&self.name).await?;
        debug!(name = %domain.name, state = %domain.state, "domain found");

        let doc = vmm.domain_metadata(&self.name, METADATA_NAMESPACE).await?;
        let meta = Metadata::parse(&doc)?;
        state.vmm = Some(vmm);
        // Replaced wholesale on every successful start, never merged.
        state.metadata = Some(meta.clone());

        let uplink_peer = hostnet::uplink_ipv4(&self.uplink)?;

        // Idempotence guard: whatever the tap already carries needs no
        // mutation. A missing tap simply reports nothing as existing.
        let existing = match hostnet::interface_addresses(&tap) {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(name = %self.name, error = %e, "tap device not inspectable yet");
                Vec::new()
            }
        };
        let pending = metadata::prune_existing(&existing, &meta.ips);

        for entry in pending.iter().filter(|ip| ip.host && ip.family == Family::Ipv4) {
            let peer = entry.peer.as_deref().or(uplink_peer.as_deref());
            hostnet::add_address_v4(&tap, &entry.cidr(), peer)?;
            info!(name = %self.name, address = %entry.cidr(), "IPv4 address added");
        }

        hostnet::enable_proxy_arp(&tap)?;

        let dhcp_socket = Arc::new(DeviceSocket::udp4(&tap, DHCP_SERVER_PORT)?);
        state.dhcp_socket = Some(Arc::clone(&dhcp_socket));
        spawn_responder(format!("dhcp4-{}", self.name), {
            let name = self.name.clone();
            let config = DhcpConfig::from_metadata(&meta);
            move || dhcp::serve(&name, dhcp_socket, config)
        })?;
        info!(name = %self.name, device = %tap, "DHCPv4 responder started");

        for entry in pending.iter().filter(|ip| ip.host && ip.family == Family::Ipv6) {
            hostnet::add_address_v6(&tap, &entry.cidr())?;
            hostnet::replace_route_v6(&tap, &entry.cidr())?;
            info!(name = %self.name, address = %entry.cidr(), "IPv6 address and route added");
        }

        let ra_socket = Arc::new(DeviceSocket::icmp6(&tap)?);
        state.ra_socket = Some(Arc::clone(&ra_socket));
        spawn_responder(format!("ra-{}", self.name), {
            let name = self.name.clone();
            let config = RaConfig::from_metadata(&meta);
            move || ra::serve(&name, ra_socket, config)
        })?;
        info!(name = %self.name, device = %tap, "RA responder started");

        Ok(())
    }

    /// Tear the server down from another task.
    ///
    /// Releases the hypervisor handle, shuts both responder sockets down
    /// (their blocked receives fail promptly, which is the responders'
    /// only cancellation signal) and deletes the IPv6 static routes
    /// installed by `start`. IPv4 addresses, the proxy-ARP sysctl, and the
    /// IPv6 addresses themselves are deliberately left in place.
    ///
    /// Known gap: the first internal failure is returned immediately and
    /// the remaining cleanup steps (including the cancellation signal for
    /// a parked `start`) are skipped.
    ///
    /// Safe to call on a server that never completed `start`: absent
    /// handles are skipped.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        if let Some(mut vmm) = state.vmm.take() {
            if vmm.is_alive() {
                vmm.close();
            }
        }

        if let Some(sock) = state.dhcp_socket.take() {
            sock.shutdown().map_err(ServerError::Socket)?;
        }
        if let Some(sock) = state.ra_socket.take() {
            sock.shutdown().map_err(ServerError::Socket)?;
        }

        let Some(meta) = state.metadata.as_ref() else {
            self.cancel.notify_waiters();
            return Ok(());
        };

        let tap = self.tap_device();
        for entry in meta.host_entries(Family::Ipv6) {
            hostnet::delete_route_v6(&tap, &entry.cidr())?;
            info!(name = %self.name, address = %entry.cidr(), "IPv6 route removed");
        }

        drop(state);
        self.cancel.notify_waiters();
        info!(name = %self.name, "stopped");
        Ok(())
    }
}

fn spawn_responder(thread_name: String, body: impl FnOnce() + Send + 'static) -> Result<()> {
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(body)
        .map_err(ServerError::Socket)?;
    Ok(())
}

/// Process-wide mapping from domain name to its server.
///
/// Start/Stop for unrelated domains run concurrently, so the map carries
/// its own lock, independent of any per-server state.
pub struct Registry {
    servers: RwLock<HashMap<String, Arc<Server>>>,
    vmm_socket: PathBuf,
    uplink: String,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_config(VMM_API_SOCKET, UPLINK_IFACE)
    }

    pub fn with_config(vmm_socket: impl Into<PathBuf>, uplink: impl Into<String>) -> Self {
        Registry {
            servers: RwLock::new(HashMap::new()),
            vmm_socket: vmm_socket.into(),
            uplink: uplink.into(),
        }
    }

    /// Create and register the server for a domain. Names must be
    /// non-empty and unique.
    pub fn register(&self, name: &str) -> Result<Arc<Server>> {
        if name.is_empty() {
            return Err(ServerError::Config("empty domain name".into()));
        }
        let mut servers = self.servers.write().unwrap();
        if servers.contains_key(name) {
            return Err(ServerError::Config(format!(
                "domain {name} already registered"
            )));
        }
        let server = Arc::new(Server::with_paths(
            name,
            self.vmm_socket.clone(),
            self.uplink.clone(),
        ));
        servers.insert(name.to_string(), Arc::clone(&server));
        Ok(server)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.read().unwrap().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.write().unwrap().remove(name)
    }

    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.servers.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.servers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_SOCKET: &str = "/nonexistent/guestnet-test/vmm.sock";

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let server = Server::with_paths("vm1", NO_SOCKET, "uplink-test0");
        server.stop().await.unwrap();
        assert!(server.is_shutdown());

        // And again: stop is idempotent on an empty server.
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_rejects_empty_name() {
        let server = Server::with_paths("", NO_SOCKET, "uplink-test0");
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[tokio::test]
    async fn start_fails_without_management_socket() {
        let server = Server::with_paths("vm1", NO_SOCKET, "uplink-test0");
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Connection(_)));
    }

    #[tokio::test]
    async fn restart_after_stop_is_permitted() {
        let server = Server::with_paths("vm1", NO_SOCKET, "uplink-test0");
        server.stop().await.unwrap();
        assert!(server.is_shutdown());

        // The restart clears the shutdown flag before failing at the
        // connection stage, well past the lifecycle gate.
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Connection(_)));
        assert!(!server.is_shutdown());
    }

    #[tokio::test]
    async fn concurrent_starts_fail_independently() {
        let registry = Registry::with_config(NO_SOCKET, "uplink-test0");
        let a = registry.register("vm-a").unwrap();
        let b = registry.register("vm-b").unwrap();

        let (ra, rb) = tokio::join!(a.start(), b.start());
        assert!(matches!(ra.unwrap_err(), ServerError::Connection(_)));
        assert!(matches!(rb.unwrap_err(), ServerError::Connection(_)));

        // One domain's failure does not disturb the other's entry.
        assert_eq!(registry.len(), 2);
        assert!(registry.get("vm-a").is_some());
        assert!(registry.get("vm-b").is_some());
    }

    #[test]
    fn registry_rejects_empty_and_duplicate_names() {
        let registry = Registry::with_config(NO_SOCKET, "uplink-test0");
        assert!(matches!(
            registry.register("").unwrap_err(),
            ServerError::Config(_)
        ));

        registry.register("vm1").unwrap();
        assert!(matches!(
            registry.register("vm1").unwrap_err(),
            ServerError::Config(_)
        ));
    }

    #[test]
    fn registry_lookup_and_remove() {
        let registry = Registry::with_config(NO_SOCKET, "uplink-test0");
        assert!(registry.is_empty());

        let server = registry.register("vm1").unwrap();
        assert_eq!(server.tap_device(), "tapvm1");
        assert_eq!(registry.get("vm1").unwrap().name(), "vm1");
        assert!(registry.get("vm2").is_none());

        assert!(registry.remove("vm1").is_some());
        assert!(registry.remove("vm1").is_none());
        assert!(registry.is_empty());
    }
}
