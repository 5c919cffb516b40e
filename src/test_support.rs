//! In-memory hypervisor, tool chain and network for unit tests.
//!
//! All three fakes share one `FakeWorld`, so a domain imported by
//! `FakeTools` is visible to `FakeHypervisor` and its address to `FakeProbe`.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::backend::{DomainInfo, GuestInterface, Hypervisor, LeaseSource};
use crate::config::Retry;
use crate::error::VirtupError;
use crate::metadata::{Metadata, MetadataStore};
use crate::network::{Neighbor, Probe};
use crate::tools::{BuildImage, CopyDisk, ImportDomain, Sysprep, Toolchain};

pub type World = Rc<RefCell<FakeWorld>>;

pub fn quick_retry() -> Retry {
    Retry {
        attempts: 3,
        interval: Duration::ZERO,
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeDomain {
    pub active: bool,
    pub macs: Vec<String>,
    pub disks: Vec<String>,
    pub addrs: Vec<IpAddr>,
    pending_start: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub name: String,
    pub mac_hint: Option<String>,
}

/// Work another invocation finishes while this one waits for the build lock.
#[derive(Debug, Clone)]
pub enum Concurrent {
    /// An image left behind without a domain.
    Image(PathBuf),
    /// A complete instance: image, domain and metadata record.
    Instance {
        name: String,
        image: PathBuf,
        store: PathBuf,
    },
}

#[derive(Debug, Default)]
pub struct FakeWorld {
    pub domains: BTreeMap<String, FakeDomain>,
    pub pool: PathBuf,
    /// `is_active` polls that still report "off" after `start`.
    pub start_delay: u32,
    /// Shutdown requests the guest ignores before powering off.
    pub shutdowns_ignored: u32,
    /// Agent queries answered with "agent unresponsive".
    pub agent_unresponsive: u32,
    pub neighbors: Vec<Neighbor>,
    pub alive: BTreeSet<IpAddr>,
    pub dns: BTreeMap<String, Vec<IpAddr>>,
    /// Name of a tool call that fails.
    pub fail_tool: Option<&'static str>,
    pub imports: Vec<ImportRecord>,
    pub copies: Vec<(PathBuf, PathBuf, bool)>,
    /// Applied at the first `domain_exists` after the next `pool_path`.
    pub concurrent: Option<Concurrent>,
    armed: bool,
    next_host: u8,
    calls: Vec<&'static str>,
}

impl FakeWorld {
    pub fn shared() -> World {
        Rc::new(RefCell::new(FakeWorld::default()))
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.iter().filter(|c| **c == op).count()
    }

    pub fn tool_calls(&self) -> usize {
        ["build_image", "import_domain", "copy_disk", "sysprep"]
            .iter()
            .map(|op| self.calls(op))
            .sum()
    }

    fn record(&mut self, op: &'static str) {
        self.calls.push(op);
    }

    /// Hand out a fresh MAC and guest address; the address answers pings.
    fn allocate(&mut self) -> (String, IpAddr) {
        self.next_host += 1;
        let n = self.next_host;
        let ip: IpAddr = format!("192.168.122.{}", 10 + n).parse().unwrap();
        self.alive.insert(ip);
        (format!("52:54:00:00:00:{n:02x}"), ip)
    }

    pub fn add_domain(&mut self, name: &str, active: bool) {
        let (mac, ip) = self.allocate();
        self.domains.insert(
            name.into(),
            FakeDomain {
                active,
                macs: vec![mac],
                addrs: vec![ip],
                ..Default::default()
            },
        );
    }

    pub fn domain(&self, name: &str) -> Option<&FakeDomain> {
        self.domains.get(name)
    }

    pub fn domain_mut(&mut self, name: &str) -> Option<&mut FakeDomain> {
        self.domains.get_mut(name)
    }

    pub fn guest_addrs(&mut self, name: &str, addrs: Vec<IpAddr>) {
        if let Some(d) = self.domains.get_mut(name) {
            d.addrs = addrs;
        }
    }

    fn lookup(&mut self, name: &str) -> Result<&mut FakeDomain, VirtupError> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| VirtupError::NotFound { name: name.into() })
    }

    fn run_concurrent(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        match self.concurrent.take() {
            Some(Concurrent::Image(path)) => {
                std::fs::write(&path, "concurrent").unwrap();
            }
            Some(Concurrent::Instance { name, image, store }) => {
                std::fs::write(&image, "concurrent").unwrap();
                self.add_domain(&name, true);
                let meta = Metadata {
                    disk: Some(image.display().to_string()),
                    ..Default::default()
                };
                MetadataStore::new(&store).write(&name, &meta).unwrap();
            }
            None => {}
        }
    }

    fn maybe_fail(&self, op: &'static str) -> Result<(), VirtupError> {
        if self.fail_tool == Some(op) {
            return Err(VirtupError::ExternalCommand {
                command: op.into(),
                message: "simulated failure".into(),
            });
        }
        Ok(())
    }
}

fn invalid(name: &str, message: &str) -> VirtupError {
    VirtupError::OperationInvalid {
        name: name.into(),
        message: message.into(),
    }
}

// ── hypervisor ───────────────────────────────────────────

pub struct FakeHypervisor {
    world: World,
}

impl FakeHypervisor {
    pub fn new(world: &World) -> Self {
        Self {
            world: world.clone(),
        }
    }
}

impl Hypervisor for FakeHypervisor {
    fn domain_exists(&self, name: &str) -> Result<bool, VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("domain_exists");
        w.run_concurrent();
        Ok(w.domains.contains_key(name))
    }

    fn list_domains(&self) -> Result<Vec<String>, VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("list_domains");
        Ok(w.domains.keys().cloned().collect())
    }

    fn describe(&self, name: &str) -> Result<DomainInfo, VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("describe");
        let d = w.lookup(name)?;
        Ok(DomainInfo {
            macs: d.macs.clone(),
            disks: d.disks.clone(),
        })
    }

    fn is_active(&self, name: &str) -> Result<bool, VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("is_active");
        let d = w.lookup(name)?;
        match d.pending_start {
            Some(0) => {
                d.pending_start = None;
                d.active = true;
            }
            Some(n) => d.pending_start = Some(n - 1),
            None => {}
        }
        Ok(d.active)
    }

    fn start(&self, name: &str) -> Result<(), VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("start");
        let delay = w.start_delay;
        let d = w.lookup(name)?;
        if d.active {
            return Err(invalid(name, "domain is already running"));
        }
        if delay == 0 {
            d.active = true;
        } else {
            d.pending_start = Some(delay);
        }
        Ok(())
    }

    fn shutdown(&self, name: &str) -> Result<(), VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("shutdown");
        let ignore = w.shutdowns_ignored > 0;
        if ignore {
            w.shutdowns_ignored -= 1;
        }
        let d = w.lookup(name)?;
        if !d.active {
            return Err(invalid(name, "domain is not running"));
        }
        if !ignore {
            d.active = false;
        }
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<(), VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("destroy");
        let d = w.lookup(name)?;
        if !d.active {
            return Err(invalid(name, "domain is not running"));
        }
        d.active = false;
        Ok(())
    }

    fn undefine(&self, name: &str) -> Result<(), VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("undefine");
        w.domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| VirtupError::NotFound { name: name.into() })
    }

    fn interface_addresses(
        &self,
        name: &str,
        source: LeaseSource,
    ) -> Result<Vec<GuestInterface>, VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("interface_addresses");
        if source == LeaseSource::Agent && w.agent_unresponsive > 0 {
            w.agent_unresponsive -= 1;
            return Err(VirtupError::AgentUnresponsive { name: name.into() });
        }
        let d = w.lookup(name)?;
        if !d.active {
            return Ok(Vec::new());
        }
        Ok(vec![GuestInterface {
            name: "eth0".into(),
            hwaddr: d.macs.first().cloned().unwrap_or_default(),
            addrs: d.addrs.clone(),
        }])
    }

    fn pool_path(&self, _pool: &str) -> Result<PathBuf, VirtupError> {
        let mut w = self.world.borrow_mut();
        w.armed = w.concurrent.is_some();
        Ok(w.pool.clone())
    }

    fn delete_volume(&self, path: &Path) -> Result<bool, VirtupError> {
        self.world.borrow_mut().record("delete_volume");
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

// ── tools ────────────────────────────────────────────────

pub struct FakeTools {
    world: World,
}

impl FakeTools {
    pub fn new(world: &World) -> Self {
        Self {
            world: world.clone(),
        }
    }
}

fn touch(path: &Path, contents: &str) -> Result<(), VirtupError> {
    std::fs::write(path, contents).map_err(|e| VirtupError::Io {
        context: format!("writing {}", path.display()),
        source: e,
    })
}

impl Toolchain for FakeTools {
    async fn build_image(&self, req: &BuildImage<'_>) -> Result<(), VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("build_image");
        w.maybe_fail("build_image")?;
        touch(req.image, req.os_version)
    }

    async fn import_domain(&self, req: &ImportDomain<'_>) -> Result<(), VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("import_domain");
        w.maybe_fail("import_domain")?;
        w.imports.push(ImportRecord {
            name: req.name.into(),
            mac_hint: req.mac.map(String::from),
        });
        let (generated, ip) = w.allocate();
        let mac = req.mac.map(String::from).unwrap_or(generated);
        w.domains.insert(
            req.name.into(),
            FakeDomain {
                active: true,
                macs: vec![mac],
                disks: vec![req.image.display().to_string()],
                addrs: vec![ip],
                pending_start: None,
            },
        );
        Ok(())
    }

    async fn copy_disk(&self, req: &CopyDisk<'_>) -> Result<(), VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("copy_disk");
        w.maybe_fail("copy_disk")?;
        w.copies
            .push((req.source.into(), req.target.into(), req.linked));
        touch(req.target, "copy")
    }

    async fn sysprep(&self, _req: &Sysprep<'_>) -> Result<(), VirtupError> {
        let mut w = self.world.borrow_mut();
        w.record("sysprep");
        w.maybe_fail("sysprep")
    }
}

// ── network ──────────────────────────────────────────────

pub struct FakeProbe {
    world: World,
}

impl FakeProbe {
    pub fn new(world: &World) -> Self {
        Self {
            world: world.clone(),
        }
    }
}

impl Probe for FakeProbe {
    async fn neighbors(&self) -> Result<Vec<Neighbor>, VirtupError> {
        Ok(self.world.borrow().neighbors.clone())
    }

    async fn is_alive(&self, ip: IpAddr) -> bool {
        self.world.borrow().alive.contains(&ip)
    }

    async fn resolve(&self, hostname: &str) -> Vec<IpAddr> {
        self.world
            .borrow()
            .dns
            .get(hostname)
            .cloned()
            .unwrap_or_default()
    }

    async fn port_open(&self, ip: IpAddr, _port: u16) -> bool {
        self.world.borrow().alive.contains(&ip)
    }
}
