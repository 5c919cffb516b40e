//! Instance lifecycle: build, clone, start, stop, delete, and the
//! commands that run against a live instance.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::address::AddressResolver;
use crate::backend::Hypervisor;
use crate::backend::libvirt::LibvirtHypervisor;
use crate::config::{Retry, Settings, TemplateSettings, Tool};
use crate::creds::{CredentialIssuer, generate_password};
use crate::error::VirtupError;
use crate::inventory;
use crate::lock::BuildLock;
use crate::logging::utc_timestamp;
use crate::macaddrs::MacRegistry;
use crate::metadata::{Creds, Metadata, MetadataStore};
use crate::network::{HostNetwork, Probe};
use crate::paths::Paths;
use crate::power;
use crate::ssh::{self, LoginMode};
use crate::tools::{self, BuildImage, CopyDisk, HostTools, ImportDomain, Sysprep, Toolchain};
use crate::util::{parse_size, sanitize_name, validate_name};

/// Resolved paths and settings for one invocation.
pub struct Context {
    pub paths: Paths,
    pub settings: Settings,
}

/// Options for building a template instance.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub template: String,
    /// Instance name; derived from the template when absent.
    pub name: Option<String>,
    pub prefix: String,
    pub size: Option<String>,
    pub memory: Option<u64>,
    pub vcpus: Option<u32>,
    pub graphics: Option<String>,
    pub root_password: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub dns_domain: Option<String>,
    pub inventory: bool,
}

/// Overrides applied when cloning.
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    pub memory: Option<u64>,
    pub vcpus: Option<u32>,
    pub graphics: Option<String>,
    pub root_password: Option<String>,
    pub dns_domain: Option<String>,
    pub inventory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub name: String,
    pub template: Option<String>,
    pub from: Option<String>,
    pub is_clone: bool,
    pub active: bool,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Whether an instance name is taken, and by what.
enum Presence {
    Absent,
    Complete,
}

pub struct Lifecycle<H, T, P> {
    ctx: Context,
    hv: H,
    tools: T,
    probe: P,
    store: MetadataStore,
}

pub type HostLifecycle = Lifecycle<LibvirtHypervisor, HostTools, HostNetwork>;

impl HostLifecycle {
    pub fn host(ctx: Context) -> Self {
        let hv = LibvirtHypervisor::new(&ctx.settings.site().libvirt_uri);
        Lifecycle::new(ctx, hv, HostTools, HostNetwork::default())
    }
}

/// Name of the template instance built from `template`.
pub fn template_instance_name(prefix: &str, template: &str) -> String {
    format!("{prefix}{}", sanitize_name(template))
}

fn check_access(path: &Path) -> Result<(), VirtupError> {
    let denied = || VirtupError::PermissionDenied {
        path: path.display().to_string(),
    };
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| denied())?;
    // SAFETY: `c_path` is a valid NUL-terminated string for the duration of
    // the call.
    let rc = unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) };
    if rc != 0 {
        return Err(denied());
    }
    Ok(())
}

fn ensure_no_image(image: &Path) -> Result<(), VirtupError> {
    if image.exists() {
        return Err(VirtupError::ImageExists {
            path: image.display().to_string(),
        });
    }
    Ok(())
}

fn hostname_for(name: &str, tmpl: &TemplateSettings, dns_domain: Option<&str>) -> String {
    match dns_domain.filter(|d| !d.is_empty()) {
        Some(domain) => format!("{name}.{domain}"),
        None => tmpl.hostname(name),
    }
}

impl<H: Hypervisor, T: Toolchain, P: Probe> Lifecycle<H, T, P> {
    pub fn new(ctx: Context, hv: H, tools: T, probe: P) -> Self {
        let store = MetadataStore::new(&ctx.paths.instance_dir());
        Self {
            ctx,
            hv,
            tools,
            probe,
            store,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    fn retry(&self) -> Retry {
        self.ctx.settings.retry()
    }

    fn resolver(&self) -> AddressResolver<'_, H, P> {
        AddressResolver::new(&self.hv, &self.probe, &self.store, self.retry())
    }

    /// An instance exists when both its domain and its metadata do.
    pub fn exists(&self, name: &str) -> Result<bool, VirtupError> {
        validate_name(name)?;
        Ok(self.store.exists(name) && self.hv.domain_exists(name)?)
    }

    /// Either half without the other is an error.
    fn presence(&self, name: &str) -> Result<Presence, VirtupError> {
        validate_name(name)?;
        let has_domain = self.hv.domain_exists(name)?;
        let has_meta = self.store.exists(name);
        match (has_meta, has_domain) {
            (true, true) => Ok(Presence::Complete),
            (false, false) => Ok(Presence::Absent),
            (false, true) => Err(VirtupError::DomainExists { name: name.into() }),
            (true, false) => Err(VirtupError::Inconsistent {
                name: name.into(),
                detail: "metadata exists but the domain does not".into(),
            }),
        }
    }

    fn require(&self, name: &str) -> Result<Metadata, VirtupError> {
        match self.presence(name) {
            Ok(Presence::Complete) => self
                .store
                .read(name)?
                .ok_or_else(|| VirtupError::NotFound { name: name.into() }),
            Ok(Presence::Absent) => Err(VirtupError::NotFound { name: name.into() }),
            Err(e) => Err(e),
        }
    }

    fn pool_dir(&self, tmpl: &TemplateSettings) -> Result<PathBuf, VirtupError> {
        let path = self.hv.pool_path(&tmpl.site.pool)?;
        check_access(&path)?;
        Ok(path)
    }

    /// Presence and image checks, repeated once the build lock is held.
    /// `true` when another invocation completed the instance meanwhile.
    fn completed_meanwhile(&self, name: &str, image: &Path) -> Result<bool, VirtupError> {
        if let Presence::Complete = self.presence(name)? {
            tracing::info!(name, "instance was created while waiting for the lock");
            return Ok(true);
        }
        ensure_no_image(image)?;
        Ok(false)
    }

    fn issuer(&self) -> CredentialIssuer {
        CredentialIssuer::new(
            &self.ctx.paths.sshkeys_dir(),
            self.ctx.settings.site().password_length,
        )
    }

    fn remember_mac(&self, name: &str) -> Result<(), VirtupError> {
        let info = self.hv.describe(name)?;
        if let Some(mac) = info.macs.first() {
            let mut registry = MacRegistry::load(&self.ctx.paths.macaddrs_file())?;
            registry.update(name, mac)?;
        }
        Ok(())
    }

    fn refresh_inventory(&self) -> Result<(), VirtupError> {
        inventory::write_inventory(&self.store, &self.ctx.paths.inventory_file())?;
        Ok(())
    }

    // ── build ──────────────────────────────────────────────

    /// Build a template instance with the image builder and import it.
    /// Returns the instance name. Building an instance that already exists
    /// does nothing.
    pub async fn build(&self, opts: &BuildOptions) -> Result<String, VirtupError> {
        let name = match &opts.name {
            Some(n) => n.clone(),
            None => template_instance_name(&opts.prefix, &opts.template),
        };
        validate_name(&name)?;
        if let Presence::Complete = self.presence(&name)? {
            tracing::info!(name = %name, "instance already exists");
            return Ok(name);
        }

        let tmpl = self.ctx.settings.template(&opts.template)?;
        let os_version = tmpl.os_version.clone().ok_or_else(|| VirtupError::Validation {
            message: format!("os_version is not defined for template '{}'", tmpl.name),
        })?;
        let os_variant = tmpl.os_variant.clone().ok_or_else(|| VirtupError::Validation {
            message: format!("os_variant is not defined for template '{}'", tmpl.name),
        })?;
        let size = opts.size.as_deref().map(parse_size).transpose()?;

        let pool = self.pool_dir(&tmpl)?;
        let format = tmpl.image_format.clone();
        let image = pool.join(format!("{name}.{format}"));
        ensure_no_image(&image)?;

        let memory = opts.memory.unwrap_or(tmpl.memory);
        let vcpus = opts.vcpus.unwrap_or(tmpl.vcpus);
        let graphics = opts.graphics.clone().unwrap_or_else(|| tmpl.graphics.clone());
        let hostname = hostname_for(&name, &tmpl, opts.dns_domain.as_deref());
        let username = opts
            .username
            .clone()
            .unwrap_or_else(|| tmpl.site.username.clone());

        let issuer = self.issuer();
        let root = issuer.issue("root", opts.root_password.as_deref())?;
        let user = issuer.issue(&username, opts.password.as_deref())?;
        let public_key = PathBuf::from(format!("{}.pub", user.ssh_identity));

        let builder_extra = tmpl.extra_args(Tool::VirtBuilder)?;
        let install_extra = tmpl.extra_args(Tool::VirtInstall)?;
        let registry = MacRegistry::load(&self.ctx.paths.macaddrs_file())?;
        let mac_hint = registry.lookup(&name);

        {
            let _lock = BuildLock::acquire(&self.ctx.paths.lock_file)?;
            if self.completed_meanwhile(&name, &image)? {
                return Ok(name);
            }
            tracing::info!(name = %name, image = %image.display(), "building image");
            self.tools
                .build_image(&BuildImage {
                    os_version: &os_version,
                    image: &image,
                    format: &format,
                    size: size.as_deref(),
                    hostname: &hostname,
                    root_password: &root.password,
                    username: &username,
                    public_key: &public_key,
                    extra_args: &builder_extra,
                })
                .await?;

            tracing::info!(name = %name, "importing instance");
            let imported = self
                .tools
                .import_domain(&ImportDomain {
                    name: &name,
                    image: &image,
                    memory,
                    vcpus,
                    graphics: &graphics,
                    os_variant: &os_variant,
                    mac: mac_hint,
                    extra_args: &install_extra,
                })
                .await;
            if let Err(e) = imported {
                self.discard_image(&name, &image);
                return Err(e);
            }
        }

        let meta = Metadata {
            template: Some(tmpl.name.clone()),
            created: Some(utc_timestamp()),
            os_version: Some(os_version),
            os_variant: Some(os_variant),
            disk: Some(image.display().to_string()),
            disk_format: Some(format),
            memory: Some(memory),
            vcpus: Some(vcpus),
            graphics: Some(graphics),
            size,
            hostname: Some(hostname),
            root: Some(root),
            user: Some(user),
            address_source: Some(tmpl.address_source.to_string()),
            ssh_options: ssh::common_options(&self.ctx.paths.control_dir()),
            inventory: (!opts.inventory).then_some(false),
            ..Default::default()
        };
        self.store.write(&name, &meta)?;
        self.remember_mac(&name)?;

        self.resolver().resolve(&name).await?;
        self.refresh_inventory()?;
        Ok(name)
    }

    /// Remove a freshly built image whose import failed, so a retry is not
    /// blocked by it.
    fn discard_image(&self, name: &str, image: &Path) {
        if matches!(self.hv.domain_exists(name), Ok(false))
            && let Err(e) = std::fs::remove_file(image)
        {
            tracing::warn!(name, image = %image.display(), "could not remove image: {e}");
        }
    }

    // ── clone ──────────────────────────────────────────────

    /// Clone `source` into a new instance `target`. The source is stopped
    /// first. Cloning onto an existing instance does nothing.
    pub async fn clone_instance(
        &self,
        source: &str,
        target: &str,
        opts: &CloneOptions,
    ) -> Result<(), VirtupError> {
        validate_name(target)?;
        if let Presence::Complete = self.presence(target)? {
            tracing::info!(name = target, "instance already exists");
            return Ok(());
        }

        let src = self.require(source)?;
        let lineage = |field: &str| VirtupError::MissingLineage {
            name: source.into(),
            field: field.into(),
        };
        let os_version = src.os_version.clone().ok_or_else(|| lineage("os_version"))?;
        let os_variant = src.os_variant.clone().ok_or_else(|| lineage("os_variant"))?;
        let source_disk = src.disk.clone().ok_or_else(|| lineage("disk"))?;
        let template = src.template.clone().ok_or_else(|| lineage("template"))?;

        let tmpl = self.ctx.settings.template(&template)?;
        let pool = self.pool_dir(&tmpl)?;
        let format = src
            .disk_format
            .clone()
            .unwrap_or_else(|| tmpl.image_format.clone());
        let image = pool.join(format!("{target}.{format}"));
        ensure_no_image(&image)?;
        let linked = tmpl.site.linked_clones && tools::supports_linked_copy(&format);

        let memory = opts.memory.or(src.memory).unwrap_or(tmpl.memory);
        let vcpus = opts.vcpus.or(src.vcpus).unwrap_or(tmpl.vcpus);
        let graphics = opts
            .graphics
            .clone()
            .or_else(|| src.graphics.clone())
            .unwrap_or_else(|| tmpl.graphics.clone());
        let hostname = hostname_for(target, &tmpl, opts.dns_domain.as_deref());

        let root_password = match &opts.root_password {
            Some(p) => p.clone(),
            None => generate_password(tmpl.site.password_length),
        };
        let root = match &src.root {
            Some(r) => Creds {
                password: root_password,
                ..r.clone()
            },
            None => self.issuer().issue("root", Some(root_password.as_str()))?,
        };

        let cp_extra = tmpl.extra_args(Tool::Cp)?;
        let sysprep_extra = tmpl.extra_args(Tool::VirtSysprep)?;
        let install_extra = tmpl.extra_args(Tool::VirtInstall)?;
        let registry = MacRegistry::load(&self.ctx.paths.macaddrs_file())?;
        let mac_hint = registry.lookup(target);

        power::stop(&self.hv, source, self.retry()).await?;

        {
            let _lock = BuildLock::acquire(&self.ctx.paths.lock_file)?;
            if self.completed_meanwhile(target, &image)? {
                return Ok(());
            }
            tracing::info!(source, target, linked, "copying disk");
            self.tools
                .copy_disk(&CopyDisk {
                    source: Path::new(&source_disk),
                    target: &image,
                    format: &format,
                    linked,
                    extra_args: &cp_extra,
                })
                .await?;

            tracing::info!(name = target, "preparing image");
            let prepared = self
                .tools
                .sysprep(&Sysprep {
                    image: &image,
                    hostname: &hostname,
                    root_password: &root.password,
                    extra_args: &sysprep_extra,
                })
                .await;
            let imported = match prepared {
                Ok(()) => {
                    tracing::info!(name = target, "importing instance");
                    self.tools
                        .import_domain(&ImportDomain {
                            name: target,
                            image: &image,
                            memory,
                            vcpus,
                            graphics: &graphics,
                            os_variant: &os_variant,
                            mac: mac_hint,
                            extra_args: &install_extra,
                        })
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = imported {
                self.discard_image(target, &image);
                return Err(e);
            }
        }

        let now = utc_timestamp();
        let meta = Metadata {
            created: Some(now.clone()),
            cloned: Some(now),
            from: Some(source.into()),
            os_version: Some(os_version),
            os_variant: Some(os_variant),
            disk: Some(image.display().to_string()),
            disk_format: Some(format),
            linked,
            memory: Some(memory),
            vcpus: Some(vcpus),
            graphics: Some(graphics),
            hostname: Some(hostname),
            root: Some(root),
            address: None,
            inventory: (!opts.inventory).then_some(false),
            ..src
        };
        self.store.write(target, &meta)?;
        self.remember_mac(target)?;

        self.resolver().resolve(target).await?;
        self.refresh_inventory()?;
        Ok(())
    }

    // ── delete ─────────────────────────────────────────────

    /// Names of instances whose disks are overlays on `name`'s disk.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        let mut clones: Vec<String> = self
            .store
            .records()
            .filter(|(_, meta)| meta.depends_on(name))
            .map(|(clone, _)| clone)
            .collect();
        clones.sort();
        clones
    }

    /// Delete the domain, its volumes and its metadata. Refused while linked
    /// clones depend on it. The MAC registry entry is kept for rebuilds.
    pub async fn delete(&self, name: &str) -> Result<(), VirtupError> {
        validate_name(name)?;
        let meta = self.store.read(name)?;
        let has_domain = self.hv.domain_exists(name)?;
        if meta.is_none() && !has_domain {
            return Err(VirtupError::NotFound { name: name.into() });
        }

        let clones = self.dependents(name);
        if !clones.is_empty() {
            return Err(VirtupError::HasDependents {
                name: name.into(),
                clones,
            });
        }

        let mut disks = if has_domain {
            self.hv.describe(name)?.disks
        } else {
            Vec::new()
        };
        if let Some(disk) = meta.as_ref().and_then(|m| m.disk.clone())
            && !disks.contains(&disk)
        {
            disks.push(disk);
        }

        tracing::info!(name, "deleting instance");
        self.store.delete(name)?;

        let inconsistent = |e: VirtupError| VirtupError::Inconsistent {
            name: name.into(),
            detail: e.to_string(),
        };
        if has_domain && self.hv.is_active(name).map_err(inconsistent)? {
            match self.hv.destroy(name) {
                Ok(()) | Err(VirtupError::OperationInvalid { .. }) => {}
                Err(e) => return Err(inconsistent(e)),
            }
        }
        for disk in &disks {
            let path = Path::new(disk);
            if self.hv.delete_volume(path).map_err(inconsistent)? {
                tracing::info!(name, volume = %disk, "deleted volume");
            } else if path.exists() {
                tracing::warn!(name, disk = %disk, "not a storage volume, leaving it in place");
            }
        }
        if has_domain {
            self.hv.undefine(name).map_err(inconsistent)?;
        }

        self.refresh_inventory()?;
        Ok(())
    }

    /// Delete every recorded instance, clones before the instances they were
    /// cloned from. Returns the names deleted.
    pub async fn delete_all(&self) -> Result<Vec<String>, VirtupError> {
        let mut remaining: Vec<(String, Metadata)> = self.store.records().collect();
        remaining.sort_by(|(a, am), (b, bm)| {
            bm.is_clone().cmp(&am.is_clone()).then_with(|| a.cmp(b))
        });

        let mut deleted = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|(name, _)| !remaining.iter().any(|(_, m)| m.depends_on(name)))
                .map(|(name, _)| name.clone())
                .collect();
            if ready.is_empty() {
                let (name, _) = &remaining[0];
                return Err(VirtupError::HasDependents {
                    name: name.clone(),
                    clones: self.dependents(name),
                });
            }
            for name in &ready {
                self.delete(name).await?;
                deleted.push(name.clone());
            }
            remaining.retain(|(name, _)| !ready.contains(name));
        }
        Ok(deleted)
    }

    // ── power ──────────────────────────────────────────────

    pub async fn start(&self, name: &str) -> Result<(), VirtupError> {
        self.require(name)?;
        let clones = self.dependents(name);
        if !clones.is_empty() {
            tracing::warn!(
                name,
                clones = %clones.join(", "),
                "starting the base of linked clones; writes to its disk will corrupt them"
            );
        }
        power::start(&self.hv, name, self.retry()).await
    }

    pub async fn stop(&self, name: &str) -> Result<(), VirtupError> {
        self.require(name)?;
        power::stop(&self.hv, name, self.retry()).await
    }

    // ── queries ────────────────────────────────────────────

    /// Instances present in both the hypervisor and the metadata store.
    /// Only clones unless `all`.
    pub fn list(&self, all: bool) -> Result<Vec<InstanceSummary>, VirtupError> {
        let mut out = Vec::new();
        for name in self.hv.list_domains()? {
            let Some(meta) = self.store.read(&name)? else {
                continue;
            };
            if !all && !meta.is_clone() {
                continue;
            }
            out.push(InstanceSummary {
                active: self.hv.is_active(&name)?,
                is_clone: meta.is_clone(),
                template: meta.template,
                from: meta.from,
                address: meta.address,
                name,
            });
        }
        Ok(out)
    }

    pub async fn address(&self, name: &str) -> Result<String, VirtupError> {
        self.require(name)?;
        self.resolver().resolve(name).await
    }

    /// Forget the cached address and discover it again.
    pub async fn refresh_address(&self, name: &str) -> Result<String, VirtupError> {
        self.require(name)?;
        self.store.update(name, |m| m.address = None)?;
        self.resolver().resolve(name).await
    }

    /// Poll until `port` accepts TCP connections on the instance address.
    pub async fn wait_for_port(&self, name: &str, port: u16) -> Result<(), VirtupError> {
        let address = self.address(name).await?;
        let ip = address.parse().map_err(|_| VirtupError::Validation {
            message: format!("recorded address '{address}' of '{name}' is not an IP address"),
        })?;
        let retry = self.retry();
        for attempt in 1..=retry.attempts {
            if self.probe.port_open(ip, port).await {
                return Ok(());
            }
            let remaining = retry.attempts - attempt;
            if remaining > 0 {
                tracing::debug!(name, port, remaining, "waiting for open port");
                tokio::time::sleep(retry.interval).await;
            }
        }
        Err(VirtupError::Timeout {
            name: name.into(),
            what: format!("port {port} on {address}"),
        })
    }

    // ── remote access ──────────────────────────────────────

    fn login_target(&self, name: &str, meta: &Metadata) -> Result<(Creds, Vec<String>), VirtupError> {
        let user = meta.user.clone().ok_or_else(|| VirtupError::MissingLineage {
            name: name.into(),
            field: "user".into(),
        })?;
        let options = if meta.ssh_options.is_empty() {
            ssh::common_options(&self.ctx.paths.control_dir())
        } else {
            meta.ssh_options.clone()
        };
        std::fs::create_dir_all(self.ctx.paths.control_dir()).map_err(|e| VirtupError::Io {
            context: format!("creating {}", self.ctx.paths.control_dir().display()),
            source: e,
        })?;
        Ok((user, options))
    }

    /// Interactive ssh/sftp session or a one-off command with the terminal
    /// attached. Returns the remote exit code.
    pub async fn login(&self, name: &str, mode: &LoginMode) -> Result<i32, VirtupError> {
        self.start(name).await?;
        let address = self.refresh_address(name).await?;
        self.wait_for_port(name, 22).await?;
        let meta = self.require(name)?;
        let (user, options) = self.login_target(name, &meta)?;

        let program = ssh::program(mode);
        let args = ssh::login_args(&user.ssh_identity, &options, &user.username, &address, mode);
        tracing::debug!(name, program, "connecting");
        let status = tokio::process::Command::new(program)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| VirtupError::Io {
                context: format!("running {program}"),
                source: e,
            })?;
        Ok(status.code().unwrap_or(255))
    }

    /// Run `command` on the instance and capture its output.
    pub async fn run_command(
        &self,
        name: &str,
        command: &str,
        use_sudo: bool,
    ) -> Result<CommandOutput, VirtupError> {
        let address = self.address(name).await?;
        let meta = self.require(name)?;
        let (user, options) = self.login_target(name, &meta)?;
        let command = if use_sudo {
            ssh::sudo(command)
        } else {
            command.to_string()
        };
        let mode = LoginMode::Command(command);
        let args = ssh::login_args(&user.ssh_identity, &options, &user.username, &address, &mode);
        let output = tokio::process::Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| VirtupError::Io {
                context: "running ssh".into(),
                source: e,
            })?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(255),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Playbook path as given, else relative to the playbooks directory.
    pub fn playbook_path(&self, playbook: &Path) -> PathBuf {
        if playbook.is_absolute() || playbook.exists() {
            return playbook.to_path_buf();
        }
        self.ctx.paths.playbooks_dir().join(playbook)
    }

    /// Run an ansible playbook against one instance from the inventory.
    pub async fn run_playbook(&self, name: &str, playbook: &Path) -> Result<(), VirtupError> {
        self.address(name).await?;
        self.refresh_inventory()?;
        let playbook = self.playbook_path(playbook);
        if !playbook.exists() {
            return Err(VirtupError::Validation {
                message: format!("playbook '{}' not found", playbook.display()),
            });
        }
        let inventory = self.ctx.paths.inventory_file();
        tracing::info!(name, playbook = %playbook.display(), "running playbook");
        let status = tokio::process::Command::new("ansible-playbook")
            .arg("-i")
            .arg(&inventory)
            .args(["--limit", name])
            .arg(&playbook)
            .status()
            .await
            .map_err(|e| VirtupError::Io {
                context: "running ansible-playbook".into(),
                source: e,
            })?;
        if !status.success() {
            return Err(VirtupError::ExternalCommand {
                command: "ansible-playbook".into(),
                message: format!("exited with {status}"),
            });
        }
        Ok(())
    }
}
