use std::path::{Path, PathBuf};

/// Resolved configuration and data locations for one invocation.
///
/// Built once in `main` (or per test from a scratch directory) and handed to
/// every component that touches the filesystem.
#[derive(Debug, Clone)]
pub struct Paths {
    /// User settings: `$VIRTUP_CONFIG_HOME` or `~/.config/virt-up/`
    pub config_home: PathBuf,
    /// Instance state: `$VIRTUP_DATA_HOME` or `~/.local/share/virt-up/`
    pub data_home: PathBuf,
    /// System-wide settings: `$VIRTUP_SYSTEM_CONFIG` or `/etc/virt-up/`
    pub system_config: PathBuf,
    /// Build lock file, shared by every invocation of this user.
    pub lock_file: PathBuf,
}

impl Paths {
    pub fn from_env() -> Self {
        let config_home = std::env::var_os("VIRTUP_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join("virt-up")
            });
        let data_home = std::env::var_os("VIRTUP_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join("virt-up")
            });
        let lock_file = dirs::runtime_dir()
            .map(|d| d.join("virt-up.lock"))
            .unwrap_or_else(|| PathBuf::from("/tmp/virt-up.lock"));

        Self {
            config_home,
            data_home,
            system_config: std::env::var_os("VIRTUP_SYSTEM_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/etc/virt-up")),
            lock_file,
        }
    }

    /// Everything below a single root. Used by tests and `--root`-style setups.
    pub fn under(root: &Path) -> Self {
        Self {
            config_home: root.join("config"),
            data_home: root.join("data"),
            system_config: root.join("etc"),
            lock_file: root.join("virt-up.lock"),
        }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_home.join("settings.toml")
    }

    pub fn system_settings_file(&self) -> PathBuf {
        self.system_config.join("settings.toml")
    }

    /// Drop-in template definitions: `<config>/templates.d/*.toml`
    pub fn templates_dir(&self) -> PathBuf {
        self.config_home.join("templates.d")
    }

    pub fn playbooks_dir(&self) -> PathBuf {
        self.config_home.join("playbooks")
    }

    /// Directory of per-instance metadata records.
    pub fn instance_dir(&self) -> PathBuf {
        self.data_home.join("instance")
    }

    pub fn sshkeys_dir(&self) -> PathBuf {
        self.data_home.join("sshkeys")
    }

    pub fn macaddrs_file(&self) -> PathBuf {
        self.data_home.join("macaddrs.json")
    }

    pub fn inventory_file(&self) -> PathBuf {
        self.data_home.join("inventory.yaml")
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_home.join("virt-up.log")
    }

    /// ssh ControlPath sockets for connection multiplexing.
    pub fn control_dir(&self) -> PathBuf {
        self.data_home.join("ssh-control")
    }
}
