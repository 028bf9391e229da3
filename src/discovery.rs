//! Zero-configuration peer discovery over the link-local multicast
//! service directory.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use log::{debug, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::error::Result;

pub const SERVICE_TYPE: &str = "_synapse._tcp.local.";
pub const SERVICE_VERSION: &str = "1.0";
pub const DEFAULT_BROWSE_TIMEOUT: Duration = Duration::from_secs(3);

/// A sender observed on the local network. Transient: records live
/// only as long as the browse that produced them.
#[derive(Debug, Clone)]
pub struct Peer {
    pub instance_name: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub port: u16,
}

impl Peer {
    /// Dialable endpoint, preferring IPv4.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        if let Some(ip) = self.ipv4 {
            return Some(SocketAddr::new(IpAddr::V4(ip), self.port));
        }
        self.ipv6.map(|ip| SocketAddr::new(IpAddr::V6(ip), self.port))
    }
}

/// Instance name published for this device. The directory appends a
/// numeric disambiguator on collision.
pub fn instance_name(device_name: &str) -> String {
    format!("{device_name}-synapse")
}

/// A live service registration; dropping it without calling
/// [`Announcement::shutdown`] leaves the record to expire on its own.
pub struct Announcement {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Announcement {
    pub fn shutdown(self) {
        if let Ok(receiver) = self.daemon.unregister(&self.fullname) {
            let _ = receiver.recv_timeout(Duration::from_secs(1));
        } else {
            warn!("failed to unregister {}", self.fullname);
        }
        let _ = self.daemon.shutdown();
    }
}

/// Publishes this sender under `_synapse._tcp` with a version TXT
/// record.
pub fn announce(device_name: &str, port: u16) -> Result<Announcement> {
    let daemon = ServiceDaemon::new()?;
    let instance = instance_name(device_name);
    let host = format!("{device_name}.local.");
    let properties = [("version", SERVICE_VERSION)];
    let service = ServiceInfo::new(SERVICE_TYPE, &instance, &host, "", port, &properties[..])?
        .enable_addr_auto();
    let fullname = service.get_fullname().to_string();
    daemon.register(service)?;
    debug!("announced {fullname} on port {port}");
    Ok(Announcement { daemon, fullname })
}

/// Browses for peers until the deadline passes. Answers arrive in
/// resolution order; nothing is cached between calls.
pub async fn scan_peers(timeout: Duration) -> Result<Vec<Peer>> {
    let daemon = ServiceDaemon::new()?;
    let browser = daemon.browse(SERVICE_TYPE)?;
    let deadline = tokio::time::Instant::now() + timeout;

    let mut peers = Vec::new();
    loop {
        let event = match tokio::time::timeout_at(deadline, browser.recv_async()).await {
            Ok(Ok(event)) => event,
            // Deadline reached or the daemon channel closed.
            _ => break,
        };
        if let ServiceEvent::ServiceResolved(info) = event {
            let mut ipv4 = None;
            let mut ipv6 = None;
            for addr in info.get_addresses() {
                match addr {
                    IpAddr::V4(v4) if ipv4.is_none() => ipv4 = Some(*v4),
                    IpAddr::V6(v6) if ipv6.is_none() => ipv6 = Some(*v6),
                    _ => {}
                }
            }
            let name = info
                .get_fullname()
                .strip_suffix(&format!(".{SERVICE_TYPE}"))
                .unwrap_or(info.get_fullname())
                .to_string();
            debug!("resolved peer {name} on port {}", info.get_port());
            peers.push(Peer {
                instance_name: name,
                ipv4,
                ipv6,
                port: info.get_port(),
            });
        }
    }

    let _ = daemon.stop_browse(SERVICE_TYPE);
    let _ = daemon.shutdown();
    Ok(peers)
}
