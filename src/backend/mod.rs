pub mod libvirt;

use std::net::IpAddr;
use std::path::{Path, PathBuf};

pub use crate::domain_xml::DomainInfo;
use crate::error::VirtupError;

/// Where the hypervisor should ask for guest addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseSource {
    /// qemu-guest-agent inside the guest
    Agent,
    /// DHCP leases of the libvirt network
    Lease,
}

/// One guest network interface as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInterface {
    pub name: String,
    pub hwaddr: String,
    pub addrs: Vec<IpAddr>,
}

/// Operations virt-up needs from the hypervisor.
///
/// Every call is self-contained: implementations open a connection, do the
/// work and release the connection before returning, on success or error.
/// A missing domain is reported as `VirtupError::NotFound`.
pub trait Hypervisor {
    fn domain_exists(&self, name: &str) -> Result<bool, VirtupError>;
    fn list_domains(&self) -> Result<Vec<String>, VirtupError>;
    fn describe(&self, name: &str) -> Result<DomainInfo, VirtupError>;
    fn is_active(&self, name: &str) -> Result<bool, VirtupError>;
    /// Power on. `OperationInvalid` when the domain is already running.
    fn start(&self, name: &str) -> Result<(), VirtupError>;
    /// Request a graceful shutdown. `OperationInvalid` when already off.
    fn shutdown(&self, name: &str) -> Result<(), VirtupError>;
    /// Hard power-off.
    fn destroy(&self, name: &str) -> Result<(), VirtupError>;
    fn undefine(&self, name: &str) -> Result<(), VirtupError>;
    /// `AgentUnresponsive` while the guest agent is not up yet.
    fn interface_addresses(
        &self,
        name: &str,
        source: LeaseSource,
    ) -> Result<Vec<GuestInterface>, VirtupError>;
    /// Target directory of a storage pool.
    fn pool_path(&self, pool: &str) -> Result<PathBuf, VirtupError>;
    /// Delete a storage volume by path. `Ok(false)` if no volume has that path.
    fn delete_volume(&self, path: &Path) -> Result<bool, VirtupError>;
}
