use clap::Parser;
use guestnetd::hypervisor::{VMM_API_SOCKET, VmmClient};
use guestnetd::server::{Registry, UPLINK_IFACE};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

/// Per-guest network provisioning agent.
///
/// Starts one provisioning server per running domain: host-side tap
/// reconciliation plus DHCPv4 and ICMPv6 RA responders bound to the
/// domain's tap device.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Management socket of the host VMM daemon
    #[arg(long, default_value = VMM_API_SOCKET)]
    vmm_socket: PathBuf,

    /// Host uplink interface providing the point-to-point peer identity
    #[arg(long, default_value = UPLINK_IFACE)]
    uplink: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let vmm = VmmClient::connect_read_only(&args.vmm_socket)?;
    let domains = vmm.list_domains().await?;

    let registry = Arc::new(Registry::with_config(&args.vmm_socket, &args.uplink));

    for domain in domains.iter().filter(|d| d.is_running()) {
        let server = match registry.register(&domain.name) {
            Ok(server) => server,
            Err(e) => {
                error!(name = %domain.name, error = %e, "failed to register domain");
                continue;
            }
        };
        tokio::spawn(async move {
            info!(name = %server.name(), "starting server");
            if let Err(e) = server.start().await {
                error!(name = %server.name(), error = %e, "server failed");
            }
        });
    }

    info!(domains = registry.len(), "agent running");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }

    for server in registry.servers() {
        if let Err(e) = server.stop().await {
            error!(name = %server.name(), error = %e, "stop failed");
        }
    }

    info!("agent stopped");
    Ok(())
}
