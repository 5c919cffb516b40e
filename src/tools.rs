//! The external image tools: virt-builder, virt-install, virt-sysprep and the
//! disk copy (qemu-img overlay or cp).

use std::path::Path;

use crate::error::VirtupError;
use crate::logging;

pub struct BuildImage<'a> {
    pub os_version: &'a str,
    pub image: &'a Path,
    pub format: &'a str,
    pub size: Option<&'a str>,
    pub hostname: &'a str,
    pub root_password: &'a str,
    pub username: &'a str,
    pub public_key: &'a Path,
    pub extra_args: &'a [String],
}

pub struct ImportDomain<'a> {
    pub name: &'a str,
    pub image: &'a Path,
    pub memory: u64,
    pub vcpus: u32,
    pub graphics: &'a str,
    pub os_variant: &'a str,
    /// Previously assigned address to ask for; the hypervisor may ignore it.
    pub mac: Option<&'a str>,
    pub extra_args: &'a [String],
}

pub struct CopyDisk<'a> {
    pub source: &'a Path,
    pub target: &'a Path,
    pub format: &'a str,
    /// Create a copy-on-write overlay backed by `source` instead of a full copy.
    pub linked: bool,
    pub extra_args: &'a [String],
}

pub struct Sysprep<'a> {
    pub image: &'a Path,
    pub hostname: &'a str,
    pub root_password: &'a str,
    pub extra_args: &'a [String],
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Toolchain {
    async fn build_image(&self, req: &BuildImage<'_>) -> Result<(), VirtupError>;
    async fn import_domain(&self, req: &ImportDomain<'_>) -> Result<(), VirtupError>;
    async fn copy_disk(&self, req: &CopyDisk<'_>) -> Result<(), VirtupError>;
    async fn sysprep(&self, req: &Sysprep<'_>) -> Result<(), VirtupError>;
}

// ── argument construction ─────────────────────────────────

fn path_arg(p: &Path) -> String {
    p.display().to_string()
}

pub fn builder_args(req: &BuildImage<'_>) -> Vec<String> {
    let user = req.username;
    let mut args = vec![
        req.os_version.to_string(),
        "--output".into(),
        path_arg(req.image),
        "--format".into(),
        req.format.into(),
    ];
    if let Some(size) = req.size {
        args.extend(["--size".into(), size.into()]);
    }
    args.extend([
        "--hostname".into(),
        req.hostname.into(),
        "--root-password".into(),
        format!("password:{}", req.root_password),
        "--run-command".into(),
        "ssh-keygen -A".into(),
        "--run-command".into(),
        format!("id -u {user} || useradd -m -s /bin/bash {user}"),
        "--ssh-inject".into(),
        format!("{user}:file:{}", req.public_key.display()),
        "--run-command".into(),
        "mkdir -p /etc/sudoers.d".into(),
        "--write".into(),
        format!("/etc/sudoers.d/99-virt-up:{user} ALL=(ALL) NOPASSWD: ALL"),
    ]);
    args.extend(req.extra_args.iter().cloned());
    args
}

pub fn install_args(req: &ImportDomain<'_>) -> Vec<String> {
    let mut args = vec![
        "--import".into(),
        "--name".into(),
        req.name.into(),
        "--disk".into(),
        path_arg(req.image),
        "--memory".into(),
        req.memory.to_string(),
        "--vcpus".into(),
        req.vcpus.to_string(),
        "--graphics".into(),
        req.graphics.into(),
        "--os-variant".into(),
        req.os_variant.into(),
        "--noautoconsole".into(),
    ];
    if let Some(mac) = req.mac {
        args.extend(["--mac".into(), mac.into()]);
    }
    args.extend(req.extra_args.iter().cloned());
    args
}

pub fn sysprep_args(req: &Sysprep<'_>) -> Vec<String> {
    let mut args = vec![
        "--quiet".into(),
        "--add".into(),
        path_arg(req.image),
        "--operations".into(),
        "defaults,-ssh-userdir".into(),
        "--hostname".into(),
        req.hostname.into(),
        "--root-password".into(),
        format!("password:{}", req.root_password),
    ];
    args.extend(req.extra_args.iter().cloned());
    args
}

/// Program and arguments for a disk copy.
pub fn copy_command(req: &CopyDisk<'_>) -> (&'static str, Vec<String>) {
    if req.linked {
        (
            "qemu-img",
            vec![
                "create".into(),
                "-f".into(),
                req.format.into(),
                "-b".into(),
                path_arg(req.source),
                "-F".into(),
                req.format.into(),
                path_arg(req.target),
            ],
        )
    } else {
        let mut args: Vec<String> = req.extra_args.to_vec();
        args.extend([path_arg(req.source), path_arg(req.target)]);
        ("cp", args)
    }
}

/// Linked copies need a backing-file capable image format.
pub fn supports_linked_copy(format: &str) -> bool {
    format == "qcow2"
}

// ── host implementation ───────────────────────────────────

/// Runs the real tools on this host.
pub struct HostTools;

async fn run(program: &str, args: &[String]) -> Result<(), VirtupError> {
    tracing::debug!(program, argc = args.len(), "running external command");
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| VirtupError::Io {
            context: format!("running {program}"),
            source: e,
        })?;

    logging::log_output(program, &output.stdout, &output.stderr);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = match stderr.trim() {
            "" => format!("exited with {}", output.status),
            s => s.to_string(),
        };
        return Err(VirtupError::ExternalCommand {
            command: program.into(),
            message,
        });
    }
    Ok(())
}

async fn ensure_parent(path: &Path) -> Result<(), VirtupError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VirtupError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }
    Ok(())
}

impl Toolchain for HostTools {
    async fn build_image(&self, req: &BuildImage<'_>) -> Result<(), VirtupError> {
        ensure_parent(req.image).await?;
        run("virt-builder", &builder_args(req)).await?;
        tracing::info!(path = %req.image.display(), "built image");
        Ok(())
    }

    async fn import_domain(&self, req: &ImportDomain<'_>) -> Result<(), VirtupError> {
        run("virt-install", &install_args(req)).await?;
        tracing::info!(name = req.name, "imported domain");
        Ok(())
    }

    async fn copy_disk(&self, req: &CopyDisk<'_>) -> Result<(), VirtupError> {
        ensure_parent(req.target).await?;
        let (program, args) = copy_command(req);
        run(program, &args).await?;
        tracing::info!(
            source = %req.source.display(),
            target = %req.target.display(),
            linked = req.linked,
            "copied disk"
        );
        Ok(())
    }

    async fn sysprep(&self, req: &Sysprep<'_>) -> Result<(), VirtupError> {
        run("virt-sysprep", &sysprep_args(req)).await?;
        tracing::info!(path = %req.image.display(), "prepared image");
        Ok(())
    }
}
