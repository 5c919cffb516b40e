use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::DEFAULT_SETTINGS;
use crate::error::VirtupError;
use crate::paths::Paths;

struct Asset {
    path: &'static str,
    contents: &'static str,
    executable: bool,
}

const ASSETS: &[Asset] = &[
    Asset {
        path: "settings.toml",
        contents: DEFAULT_SETTINGS,
        executable: false,
    },
    Asset {
        path: "scripts/fixup-network-interfaces.sh",
        contents: include_str!("../assets/scripts/fixup-network-interfaces.sh"),
        executable: true,
    },
    Asset {
        path: "scripts/fixup-netplan-netcfg.sh",
        contents: include_str!("../assets/scripts/fixup-netplan-netcfg.sh"),
        executable: true,
    },
    Asset {
        path: "playbooks/devel-debian.yaml",
        contents: include_str!("../assets/playbooks/devel-debian.yaml"),
        executable: false,
    },
    Asset {
        path: "playbooks/devel-redhat.yaml",
        contents: include_str!("../assets/playbooks/devel-redhat.yaml"),
        executable: false,
    },
];

/// Where `init` writes: the system directory for root, else the user's.
pub fn target_dir(paths: &Paths) -> &Path {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } == 0 {
        &paths.system_config
    } else {
        &paths.config_home
    }
}

/// Write the default settings, helper scripts and playbooks below `dir`.
/// Nothing is written if any of them exists, unless `force`.
pub fn write_defaults(dir: &Path, force: bool) -> Result<Vec<PathBuf>, VirtupError> {
    if !force {
        let existing: Vec<String> = ASSETS
            .iter()
            .map(|a| dir.join(a.path))
            .filter(|p| p.exists())
            .map(|p| p.display().to_string())
            .collect();
        if !existing.is_empty() {
            return Err(VirtupError::Validation {
                message: format!(
                    "{} already exists (use --force to overwrite)",
                    existing.join(", ")
                ),
            });
        }
    }

    let mut written = Vec::new();
    for asset in ASSETS {
        let path = dir.join(asset.path);
        let io_err = |e: std::io::Error| VirtupError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(&path, asset.contents).map_err(io_err)?;
        if asset.executable {
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).map_err(io_err)?;
        }
        tracing::debug!(path = %path.display(), "wrote default file");
        written.push(path);
    }
    Ok(written)
}

pub fn run(paths: &Paths, force: bool) -> Result<(), VirtupError> {
    let dir = target_dir(paths);
    for path in write_defaults(dir, force)? {
        println!("Created {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_settings;

    #[test]
    fn writes_settings_scripts_and_playbooks() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_defaults(dir.path(), false).unwrap();
        assert_eq!(written.len(), ASSETS.len());

        let settings = fs::read_to_string(dir.path().join("settings.toml")).unwrap();
        parse_settings(&settings, "settings.toml").unwrap();

        let script = dir.path().join("scripts/fixup-netplan-netcfg.sh");
        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(dir.path().join("playbooks/devel-debian.yaml").exists());
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("settings.toml"), "# mine\n").unwrap();

        let err = write_defaults(dir.path(), false).unwrap_err();
        assert!(matches!(err, VirtupError::Validation { .. }));
        assert_eq!(
            fs::read_to_string(dir.path().join("settings.toml")).unwrap(),
            "# mine\n"
        );
        assert!(!dir.path().join("scripts").exists());
    }

    #[test]
    fn force_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("settings.toml"), "# mine\n").unwrap();
        write_defaults(dir.path(), true).unwrap();
        let settings = fs::read_to_string(dir.path().join("settings.toml")).unwrap();
        assert_eq!(settings, DEFAULT_SETTINGS);
    }
}
