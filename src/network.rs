use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use crate::error::VirtupError;

/// One entry of the host's IPv4 neighbor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub ip: IpAddr,
    /// Lowercased hardware address.
    pub mac: String,
}

/// Host-side network observations used to find and check guest addresses.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Probe {
    async fn neighbors(&self) -> Result<Vec<Neighbor>, VirtupError>;
    /// Single liveness check (one ICMP echo).
    async fn is_alive(&self, ip: IpAddr) -> bool;
    /// IPv4 addresses currently resolved for `hostname`.
    async fn resolve(&self, hostname: &str) -> Vec<IpAddr>;
    async fn port_open(&self, ip: IpAddr, port: u16) -> bool;
}

/// Parse `/proc/net/arp`. Incomplete entries (all-zero hardware address) are
/// dropped.
pub fn parse_arp_table(contents: &str) -> Vec<Neighbor> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let ip = cols.next()?.parse().ok()?;
            let mac = cols.nth(2)?.to_ascii_lowercase();
            (mac != "00:00:00:00:00:00").then_some(Neighbor { ip, mac })
        })
        .collect()
}

pub struct HostNetwork {
    pub connect_timeout: Duration,
}

impl Default for HostNetwork {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl Probe for HostNetwork {
    async fn neighbors(&self) -> Result<Vec<Neighbor>, VirtupError> {
        let contents = tokio::fs::read_to_string("/proc/net/arp")
            .await
            .map_err(|e| VirtupError::Io {
                context: "reading /proc/net/arp".into(),
                source: e,
            })?;
        Ok(parse_arp_table(&contents))
    }

    async fn is_alive(&self, ip: IpAddr) -> bool {
        tokio::process::Command::new("ping")
            .args(["-c", "1", "-W", "1"])
            .arg(ip.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|s| s.success())
    }

    async fn resolve(&self, hostname: &str) -> Vec<IpAddr> {
        match tokio::net::lookup_host((hostname, 0)).await {
            Ok(addrs) => addrs.map(|a| a.ip()).filter(IpAddr::is_ipv4).collect(),
            Err(e) => {
                tracing::debug!(hostname, "lookup failed: {e}");
                Vec::new()
            }
        }
    }

    async fn port_open(&self, ip: IpAddr, port: u16) -> bool {
        let addr = SocketAddr::new(ip, port);
        matches!(
            tokio::time::timeout(self.connect_timeout, tokio::net::TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}
