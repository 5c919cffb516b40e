use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{self as virt_error, ErrorNumber};
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;

use super::{GuestInterface, Hypervisor, LeaseSource};
use crate::domain_xml::{self, DomainInfo};
use crate::error::VirtupError;

struct ConnGuard {
    conn: Connect,
    closes: Arc<AtomicUsize>,
}

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.conn
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.conn.close().ok();
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Opens scoped connections to one libvirt URI and counts them.
pub struct ConnectionFactory {
    uri: String,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl ConnectionFactory {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.into(),
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn open(&self) -> Result<ConnGuard, VirtupError> {
        // Keep libvirt from printing its own errors to stderr; they surface
        // through Result instead.
        virt_error::clear_error_callback();

        let conn = Connect::open(Some(&self.uri)).map_err(|e| VirtupError::Libvirt {
            message: format!("failed to connect to libvirt: {e}"),
            hint: format!(
                "ensure libvirtd is running and you have access to {}",
                self.uri
            ),
        })?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(ConnGuard {
            conn,
            closes: self.closes.clone(),
        })
    }

    /// Connections currently open.
    pub fn outstanding(&self) -> usize {
        self.opens.load(Ordering::SeqCst) - self.closes.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

pub struct LibvirtHypervisor {
    connections: ConnectionFactory,
}

impl LibvirtHypervisor {
    pub fn new(uri: &str) -> Self {
        Self {
            connections: ConnectionFactory::new(uri),
        }
    }

    pub fn connections(&self) -> &ConnectionFactory {
        &self.connections
    }

    fn lookup(conn: &Connect, name: &str) -> Result<Domain, VirtupError> {
        Domain::lookup_by_name(conn, name).map_err(|e| libvirt_error(name, &e, "domain lookup failed"))
    }
}

fn libvirt_error(name: &str, e: &virt_error::Error, what: &str) -> VirtupError {
    match e.code() {
        ErrorNumber::NoDomain => VirtupError::NotFound { name: name.into() },
        ErrorNumber::OperationInvalid => VirtupError::OperationInvalid {
            name: name.into(),
            message: e.to_string(),
        },
        ErrorNumber::AgentUnresponsive => VirtupError::AgentUnresponsive { name: name.into() },
        _ => VirtupError::Libvirt {
            message: format!("{what} for '{name}': {e}"),
            hint: "check `virsh` for details and libvirt permissions".into(),
        },
    }
}

impl Hypervisor for LibvirtHypervisor {
    fn domain_exists(&self, name: &str) -> Result<bool, VirtupError> {
        let conn = self.connections.open()?;
        match Self::lookup(&conn, name) {
            Ok(_) => Ok(true),
            Err(VirtupError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list_domains(&self) -> Result<Vec<String>, VirtupError> {
        let conn = self.connections.open()?;
        let domains = conn.list_all_domains(0).map_err(|e| VirtupError::Libvirt {
            message: format!("failed to list domains: {e}"),
            hint: format!("check access to {}", self.connections.uri()),
        })?;
        let mut names: Vec<String> = domains.iter().filter_map(|d| d.get_name().ok()).collect();
        names.sort();
        Ok(names)
    }

    fn describe(&self, name: &str) -> Result<DomainInfo, VirtupError> {
        let conn = self.connections.open()?;
        let dom = Self::lookup(&conn, name)?;
        let xml = dom
            .get_xml_desc(0)
            .map_err(|e| libvirt_error(name, &e, "failed to read domain XML"))?;
        domain_xml::parse_domain(&xml)
    }

    fn is_active(&self, name: &str) -> Result<bool, VirtupError> {
        let conn = self.connections.open()?;
        let dom = Self::lookup(&conn, name)?;
        dom.is_active()
            .map_err(|e| libvirt_error(name, &e, "failed to query state"))
    }

    fn start(&self, name: &str) -> Result<(), VirtupError> {
        let conn = self.connections.open()?;
        let dom = Self::lookup(&conn, name)?;
        dom.create()
            .map(|_| ())
            .map_err(|e| libvirt_error(name, &e, "failed to start domain"))
    }

    fn shutdown(&self, name: &str) -> Result<(), VirtupError> {
        let conn = self.connections.open()?;
        let dom = Self::lookup(&conn, name)?;
        dom.shutdown()
            .map(|_| ())
            .map_err(|e| libvirt_error(name, &e, "shutdown failed"))
    }

    fn destroy(&self, name: &str) -> Result<(), VirtupError> {
        let conn = self.connections.open()?;
        let dom = Self::lookup(&conn, name)?;
        dom.destroy()
            .map_err(|e| libvirt_error(name, &e, "force stop failed"))
    }

    fn undefine(&self, name: &str) -> Result<(), VirtupError> {
        let conn = self.connections.open()?;
        let dom = Self::lookup(&conn, name)?;
        dom.undefine()
            .map_err(|e| libvirt_error(name, &e, "failed to undefine domain"))
    }

    fn interface_addresses(
        &self,
        name: &str,
        source: LeaseSource,
    ) -> Result<Vec<GuestInterface>, VirtupError> {
        let conn = self.connections.open()?;
        let dom = Self::lookup(&conn, name)?;
        let src = match source {
            LeaseSource::Agent => virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT,
            LeaseSource::Lease => virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE,
        };
        let ifaces = dom
            .interface_addresses(src, 0)
            .map_err(|e| libvirt_error(name, &e, "failed to query interface addresses"))?;

        Ok(ifaces
            .into_iter()
            .map(|iface| GuestInterface {
                name: iface.name,
                hwaddr: iface.hwaddr.to_ascii_lowercase(),
                addrs: iface
                    .addrs
                    .iter()
                    .filter_map(|a| a.addr.parse::<IpAddr>().ok())
                    .collect(),
            })
            .collect())
    }

    fn pool_path(&self, pool: &str) -> Result<PathBuf, VirtupError> {
        let conn = self.connections.open()?;
        let sp = StoragePool::lookup_by_name(&conn, pool).map_err(|e| VirtupError::Libvirt {
            message: format!("storage pool '{pool}' not found: {e}"),
            hint: "set `pool` in settings to an existing directory pool".into(),
        })?;
        let xml = sp.get_xml_desc(0).map_err(|e| VirtupError::Libvirt {
            message: format!("failed to read storage pool '{pool}': {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        domain_xml::parse_pool_path(&xml).map(PathBuf::from)
    }

    fn delete_volume(&self, path: &Path) -> Result<bool, VirtupError> {
        let conn = self.connections.open()?;
        let path_str = path.display().to_string();
        let vol = match StorageVol::lookup_by_path(&conn, &path_str) {
            Ok(vol) => vol,
            Err(e) if matches!(e.code(), ErrorNumber::NoStorageVolume) => return Ok(false),
            Err(e) => {
                return Err(VirtupError::Libvirt {
                    message: format!("volume lookup failed for {path_str}: {e}"),
                    hint: "refresh the storage pool with `virsh pool-refresh`".into(),
                });
            }
        };
        vol.delete(0).map_err(|e| VirtupError::Libvirt {
            message: format!("failed to delete volume {path_str}: {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        Ok(true)
    }
}
