use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::backend::{Hypervisor, LeaseSource};
use crate::config::Retry;
use crate::error::VirtupError;
use crate::metadata::{Metadata, MetadataStore};
use crate::network::Probe;
use crate::power;

/// How an instance's IPv4 address is discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSource {
    /// Ask qemu-guest-agent inside the guest.
    Agent,
    /// DHCP leases of the libvirt network.
    Lease,
    /// Host neighbor table, matched on the domain's MAC addresses.
    Arp,
    /// Resolve the recorded hostname.
    Dns,
}

impl FromStr for AddressSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "lease" => Ok(Self::Lease),
            "arp" => Ok(Self::Arp),
            "dns" => Ok(Self::Dns),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for AddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Agent => "agent",
            Self::Lease => "lease",
            Self::Arp => "arp",
            Self::Dns => "dns",
        })
    }
}

/// Finds, caches and returns the address of an instance.
pub struct AddressResolver<'a, H, P> {
    hv: &'a H,
    probe: &'a P,
    store: &'a MetadataStore,
    retry: Retry,
}

fn usable(ip: &IpAddr) -> bool {
    ip.is_ipv4() && !ip.is_loopback()
}

impl<'a, H: Hypervisor, P: Probe> AddressResolver<'a, H, P> {
    pub fn new(hv: &'a H, probe: &'a P, store: &'a MetadataStore, retry: Retry) -> Self {
        Self {
            hv,
            probe,
            store,
            retry,
        }
    }

    /// The cached address, or a freshly discovered one which is then
    /// recorded. Starts the instance if needed.
    pub async fn resolve(&self, name: &str) -> Result<String, VirtupError> {
        let meta = self
            .store
            .read(name)?
            .ok_or_else(|| VirtupError::NotFound { name: name.into() })?;
        if let Some(address) = meta.address.as_deref().filter(|a| !a.is_empty()) {
            return Ok(address.to_string());
        }

        let source_name = meta.address_source.as_deref().unwrap_or("agent");
        let source: AddressSource =
            source_name
                .parse()
                .map_err(|_| VirtupError::InvalidAddressSource {
                    name: name.into(),
                    source_name: source_name.into(),
                })?;

        power::start(self.hv, name, self.retry).await?;

        tracing::info!(name, %source, "waiting for instance address");
        let address = self.discover(name, &meta, source).await?.to_string();

        self.store
            .update(name, |m| m.address = Some(address.clone()))?;
        tracing::info!(name, %address, "instance has address");
        Ok(address)
    }

    async fn discover(
        &self,
        name: &str,
        meta: &Metadata,
        source: AddressSource,
    ) -> Result<IpAddr, VirtupError> {
        // Inputs that never change between attempts are checked up front.
        let macs = match source {
            AddressSource::Arp => self.hv.describe(name)?.macs,
            _ => Vec::new(),
        };
        let hostname = match source {
            AddressSource::Dns => Some(meta.hostname.clone().ok_or_else(|| {
                VirtupError::MissingLineage {
                    name: name.into(),
                    field: "hostname".into(),
                }
            })?),
            _ => None,
        };

        for attempt in 1..=self.retry.attempts {
            let found = match source {
                AddressSource::Agent => self.from_interfaces(name, LeaseSource::Agent)?,
                AddressSource::Lease => self.from_interfaces(name, LeaseSource::Lease)?,
                AddressSource::Arp => self.from_arp(&macs).await?,
                AddressSource::Dns => match hostname.as_deref() {
                    Some(h) => self.from_dns(h).await,
                    None => None,
                },
            };
            if let Some(ip) = found {
                return Ok(ip);
            }
            let remaining = self.retry.attempts - attempt;
            if remaining > 0 {
                tracing::debug!(name, remaining, "address not available yet");
                tokio::time::sleep(self.retry.interval).await;
            }
        }
        Err(VirtupError::AddressNotFound { name: name.into() })
    }

    fn from_interfaces(
        &self,
        name: &str,
        source: LeaseSource,
    ) -> Result<Option<IpAddr>, VirtupError> {
        let ifaces = match self.hv.interface_addresses(name, source) {
            Ok(ifaces) => ifaces,
            Err(VirtupError::AgentUnresponsive { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        for iface in &ifaces {
            tracing::trace!(iface = %iface.name, hwaddr = %iface.hwaddr, addrs = ?iface.addrs, "interface");
        }
        Ok(ifaces
            .iter()
            .flat_map(|i| i.addrs.iter())
            .copied()
            .find(usable))
    }

    async fn from_arp(&self, macs: &[String]) -> Result<Option<IpAddr>, VirtupError> {
        let candidates: Vec<IpAddr> = self
            .probe
            .neighbors()
            .await?
            .into_iter()
            .filter(|n| macs.iter().any(|m| m.eq_ignore_ascii_case(&n.mac)))
            .map(|n| n.ip)
            .filter(usable)
            .collect();
        for ip in candidates {
            if self.probe.is_alive(ip).await {
                return Ok(Some(ip));
            }
            tracing::debug!(%ip, "stale neighbor entry");
        }
        Ok(None)
    }

    async fn from_dns(&self, hostname: &str) -> Option<IpAddr> {
        for ip in self.probe.resolve(hostname).await {
            if usable(&ip) && self.probe.is_alive(ip).await {
                return Some(ip);
            }
        }
        None
    }
}
