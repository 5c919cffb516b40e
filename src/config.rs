use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use facet::Facet;

use crate::address::AddressSource;
use crate::error::VirtupError;
use crate::paths::Paths;

/// Built-in settings, loaded beneath every settings file and written out by
/// `virt-up init`.
pub const DEFAULT_SETTINGS: &str = r#"# virt-up settings
#
# [site] applies to every template; [templates.<name>] entries override it.
# Extra argument strings may use {scripts}, {playbooks} and {config}.

[site]
libvirt_uri = "qemu:///session"
pool = "default"
username = "virt"
image_format = "qcow2"
linked_clones = true
address_source = "agent"
memory = 512
vcpus = 1
graphics = "none"
password_length = 24
retry_attempts = 120
retry_interval_secs = 2

[templates.generic-centos-8]
desc = "CentOS 8.2"
os_version = "centos-8.2"
os_type = "linux"
os_variant = "centos8"
arch = "x86_64"
virt_builder_args = '--firstboot-command "systemctl enable serial-getty@ttyS0.service" --firstboot-command "systemctl start serial-getty@ttyS0.service" --install "sudo,python3" --selinux-relabel'
virt_sysprep_args = "--selinux-relabel"

[templates.generic-centos-7]
desc = "CentOS 7.8"
os_version = "centos-7.8"
os_type = "linux"
os_variant = "centos7.0"
arch = "x86_64"
virt_builder_args = '--firstboot-command "systemctl enable serial-getty@ttyS0.service" --firstboot-command "systemctl start serial-getty@ttyS0.service" --install "sudo,python3" --selinux-relabel'
virt_sysprep_args = "--selinux-relabel"

[templates.generic-fedora-32]
desc = "Fedora 32"
os_version = "fedora-32"
os_type = "linux"
os_variant = "fedora32"
arch = "x86_64"
address_source = "arp"
virt_builder_args = '--firstboot-command "systemctl enable serial-getty@ttyS0.service" --firstboot-command "systemctl start serial-getty@ttyS0.service" --selinux-relabel'
virt_sysprep_args = "--selinux-relabel"

[templates.generic-debian-10]
desc = "Debian 10 (buster)"
os_version = "debian-10"
os_type = "linux"
os_variant = "debian10"
arch = "x86_64"
virt_builder_args = '--install "sudo,qemu-guest-agent" --firstboot "{scripts}/fixup-network-interfaces.sh"'
virt_sysprep_args = '--run-command "/usr/sbin/dpkg-reconfigure -f noninteractive openssh-server"'

[templates.generic-debian-9]
desc = "Debian 9 (stretch)"
os_version = "debian-9"
os_type = "linux"
os_variant = "debian9"
arch = "x86_64"
virt_builder_args = '--install "sudo,qemu-guest-agent" --firstboot "{scripts}/fixup-network-interfaces.sh"'
virt_sysprep_args = '--run-command "/usr/sbin/dpkg-reconfigure -f noninteractive openssh-server"'

[templates.generic-opensuse-42]
desc = "openSUSE Leap 42.1"
os_version = "opensuse-42.1"
os_type = "linux"
os_variant = "opensuse42.1"
arch = "x86_64"
virt_builder_args = '--install "sudo,qemu-guest-agent"'
virt_install_args = "--channel unix,target_type=virtio,name=org.qemu.guest_agent.0"

[templates.generic-ubuntu-18]
desc = "Ubuntu 18.04"
os_version = "ubuntu-18.04"
os_type = "linux"
os_variant = "ubuntu18.04"
arch = "x86_64"
virt_builder_args = '--install "sudo,policykit-1,qemu-guest-agent" --firstboot "{scripts}/fixup-netplan-netcfg.sh"'
virt_sysprep_args = '--run-command "/usr/sbin/dpkg-reconfigure -f noninteractive openssh-server"'
virt_install_args = "--channel unix,target_type=virtio,name=org.qemu.guest_agent.0"
"#;

// ── file model ───────────────────────────────────────────

/// One parsed settings file. Every key is optional so files can be layered.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct SettingsFile {
    #[facet(default)]
    pub site: SiteConfig,
    #[facet(default)]
    pub templates: BTreeMap<String, TemplateConfig>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct SiteConfig {
    pub libvirt_uri: Option<String>,
    pub pool: Option<String>,
    pub username: Option<String>,
    pub template: Option<String>,
    pub image_format: Option<String>,
    pub linked_clones: Option<bool>,
    pub dns_domain: Option<String>,
    pub address_source: Option<String>,
    pub memory: Option<u64>,
    pub vcpus: Option<u32>,
    pub graphics: Option<String>,
    pub password_length: Option<usize>,
    pub retry_attempts: Option<u32>,
    pub retry_interval_secs: Option<u64>,
    pub virt_builder_args: Option<String>,
    pub virt_install_args: Option<String>,
    pub virt_sysprep_args: Option<String>,
    pub cp_args: Option<String>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct TemplateConfig {
    pub desc: Option<String>,
    pub os_version: Option<String>,
    pub os_type: Option<String>,
    pub os_variant: Option<String>,
    pub arch: Option<String>,
    pub address_source: Option<String>,
    pub image_format: Option<String>,
    pub memory: Option<u64>,
    pub vcpus: Option<u32>,
    pub graphics: Option<String>,
    pub virt_builder_args: Option<String>,
    pub virt_install_args: Option<String>,
    pub virt_sysprep_args: Option<String>,
    pub cp_args: Option<String>,
}

impl SiteConfig {
    /// Field-wise overlay: values set in `upper` win.
    fn overlay(self, upper: SiteConfig) -> SiteConfig {
        SiteConfig {
            libvirt_uri: upper.libvirt_uri.or(self.libvirt_uri),
            pool: upper.pool.or(self.pool),
            username: upper.username.or(self.username),
            template: upper.template.or(self.template),
            image_format: upper.image_format.or(self.image_format),
            linked_clones: upper.linked_clones.or(self.linked_clones),
            dns_domain: upper.dns_domain.or(self.dns_domain),
            address_source: upper.address_source.or(self.address_source),
            memory: upper.memory.or(self.memory),
            vcpus: upper.vcpus.or(self.vcpus),
            graphics: upper.graphics.or(self.graphics),
            password_length: upper.password_length.or(self.password_length),
            retry_attempts: upper.retry_attempts.or(self.retry_attempts),
            retry_interval_secs: upper.retry_interval_secs.or(self.retry_interval_secs),
            virt_builder_args: upper.virt_builder_args.or(self.virt_builder_args),
            virt_install_args: upper.virt_install_args.or(self.virt_install_args),
            virt_sysprep_args: upper.virt_sysprep_args.or(self.virt_sysprep_args),
            cp_args: upper.cp_args.or(self.cp_args),
        }
    }
}

impl TemplateConfig {
    /// Field-wise overlay, as for [`SiteConfig`].
    fn overlay(self, upper: TemplateConfig) -> TemplateConfig {
        TemplateConfig {
            desc: upper.desc.or(self.desc),
            os_version: upper.os_version.or(self.os_version),
            os_type: upper.os_type.or(self.os_type),
            os_variant: upper.os_variant.or(self.os_variant),
            arch: upper.arch.or(self.arch),
            address_source: upper.address_source.or(self.address_source),
            image_format: upper.image_format.or(self.image_format),
            memory: upper.memory.or(self.memory),
            vcpus: upper.vcpus.or(self.vcpus),
            graphics: upper.graphics.or(self.graphics),
            virt_builder_args: upper.virt_builder_args.or(self.virt_builder_args),
            virt_install_args: upper.virt_install_args.or(self.virt_install_args),
            virt_sysprep_args: upper.virt_sysprep_args.or(self.virt_sysprep_args),
            cp_args: upper.cp_args.or(self.cp_args),
        }
    }
}

// ── resolved settings ────────────────────────────────────

/// Fixed attempt ceiling and sleep interval shared by every polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: 120,
            interval: Duration::from_secs(2),
        }
    }
}

/// External tools that accept extra arguments from settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    VirtBuilder,
    VirtInstall,
    VirtSysprep,
    Cp,
}

impl Tool {
    fn pick<'a>(
        self,
        builder: &'a Option<String>,
        install: &'a Option<String>,
        sysprep: &'a Option<String>,
        cp: &'a Option<String>,
    ) -> Option<&'a str> {
        match self {
            Tool::VirtBuilder => builder.as_deref(),
            Tool::VirtInstall => install.as_deref(),
            Tool::VirtSysprep => sysprep.as_deref(),
            Tool::Cp => cp.as_deref(),
        }
    }
}

/// Site values with defaults filled in.
#[derive(Debug, Clone)]
pub struct Site {
    pub libvirt_uri: String,
    pub pool: String,
    pub username: String,
    pub template: Option<String>,
    pub image_format: String,
    pub linked_clones: bool,
    pub dns_domain: Option<String>,
    pub address_source: String,
    pub memory: u64,
    pub vcpus: u32,
    pub graphics: String,
    pub password_length: usize,
    pub retry: Retry,
}

/// Everything needed to build one template: site defaults merged with the
/// template's own overrides.
#[derive(Debug, Clone)]
pub struct TemplateSettings {
    pub name: String,
    pub site: Site,
    pub desc: String,
    pub os_version: Option<String>,
    pub os_variant: Option<String>,
    pub address_source: AddressSource,
    pub image_format: String,
    pub memory: u64,
    pub vcpus: u32,
    pub graphics: String,
    site_raw: SiteConfig,
    template_raw: TemplateConfig,
    vars: BTreeMap<&'static str, String>,
}

impl TemplateSettings {
    /// Extra command line arguments for `tool`: site arguments first, then the
    /// template's, with `{scripts}`-style variables substituted.
    pub fn extra_args(&self, tool: Tool) -> Result<Vec<String>, VirtupError> {
        let site = &self.site_raw;
        let tmpl = &self.template_raw;
        let sources = [
            tool.pick(
                &site.virt_builder_args,
                &site.virt_install_args,
                &site.virt_sysprep_args,
                &site.cp_args,
            ),
            tool.pick(
                &tmpl.virt_builder_args,
                &tmpl.virt_install_args,
                &tmpl.virt_sysprep_args,
                &tmpl.cp_args,
            ),
        ];

        let mut args = Vec::new();
        for raw in sources.into_iter().flatten() {
            let expanded = expand_vars(raw, &self.vars);
            let split = shell_words::split(&expanded).map_err(|e| VirtupError::Validation {
                message: format!("cannot parse extra arguments for '{}': {e}", self.name),
            })?;
            args.extend(split);
        }
        Ok(args)
    }

    /// `<name>.<dns_domain>` when a DNS domain is configured.
    pub fn hostname(&self, name: &str) -> String {
        match self.site.dns_domain.as_deref() {
            Some(domain) if !domain.is_empty() => format!("{name}.{domain}"),
            _ => name.to_string(),
        }
    }
}

fn expand_vars(raw: &str, vars: &BTreeMap<&'static str, String>) -> String {
    let mut out = raw.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// All settings layers merged, with every known template.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    site: SiteConfig,
    templates: BTreeMap<String, TemplateConfig>,
    vars: BTreeMap<&'static str, String>,
}

impl Settings {
    /// Layer files lowest-priority first.
    pub fn from_layers(layers: Vec<SettingsFile>) -> Self {
        let mut site = SiteConfig::default();
        let mut templates: BTreeMap<String, TemplateConfig> = BTreeMap::new();
        for layer in layers {
            site = site.overlay(layer.site);
            for (name, upper) in layer.templates {
                let merged = templates.remove(&name).unwrap_or_default().overlay(upper);
                templates.insert(name, merged);
            }
        }
        Self {
            site,
            templates,
            vars: BTreeMap::new(),
        }
    }

    /// User files win; fall back to what a root `init` put under /etc.
    fn with_vars(mut self, paths: &Paths) -> Self {
        let config = if !paths.config_home.exists() && paths.system_config.exists() {
            &paths.system_config
        } else {
            &paths.config_home
        };
        self.vars
            .insert("scripts", config.join("scripts").display().to_string());
        self.vars
            .insert("playbooks", config.join("playbooks").display().to_string());
        self.vars.insert("config", config.display().to_string());
        self
    }

    pub fn site(&self) -> Site {
        let s = &self.site;
        let retry = Retry {
            attempts: s.retry_attempts.unwrap_or(Retry::default().attempts),
            interval: s
                .retry_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(Retry::default().interval),
        };
        Site {
            libvirt_uri: s
                .libvirt_uri
                .clone()
                .unwrap_or_else(|| "qemu:///session".into()),
            pool: s.pool.clone().unwrap_or_else(|| "default".into()),
            username: s.username.clone().unwrap_or_else(|| "virt".into()),
            template: s.template.clone(),
            image_format: s.image_format.clone().unwrap_or_else(|| "qcow2".into()),
            linked_clones: s.linked_clones.unwrap_or(true),
            dns_domain: s.dns_domain.clone().filter(|d| !d.is_empty()),
            address_source: s
                .address_source
                .clone()
                .unwrap_or_else(|| "agent".into()),
            memory: s.memory.unwrap_or(512),
            vcpus: s.vcpus.unwrap_or(1),
            graphics: s.graphics.clone().unwrap_or_else(|| "none".into()),
            password_length: s.password_length.unwrap_or(24),
            retry,
        }
    }

    pub fn retry(&self) -> Retry {
        self.site().retry
    }

    pub fn templates(&self) -> impl Iterator<Item = (&String, &TemplateConfig)> {
        self.templates.iter()
    }

    /// Resolve one template. Unknown names and bad address sources are
    /// configuration errors.
    pub fn template(&self, name: &str) -> Result<TemplateSettings, VirtupError> {
        let tmpl = self
            .templates
            .get(name)
            .ok_or_else(|| VirtupError::TemplateNotFound { name: name.into() })?;
        let site = self.site();

        let source_name = tmpl
            .address_source
            .clone()
            .unwrap_or_else(|| site.address_source.clone());
        let address_source =
            source_name
                .parse::<AddressSource>()
                .map_err(|_| VirtupError::InvalidAddressSource {
                    name: name.into(),
                    source_name: source_name.clone(),
                })?;

        Ok(TemplateSettings {
            name: name.into(),
            desc: tmpl.desc.clone().unwrap_or_default(),
            os_version: tmpl.os_version.clone().filter(|v| !v.is_empty()),
            os_variant: tmpl.os_variant.clone().filter(|v| !v.is_empty()),
            address_source,
            image_format: tmpl
                .image_format
                .clone()
                .unwrap_or_else(|| site.image_format.clone()),
            memory: tmpl.memory.unwrap_or(site.memory),
            vcpus: tmpl.vcpus.unwrap_or(site.vcpus),
            graphics: tmpl.graphics.clone().unwrap_or_else(|| site.graphics.clone()),
            site,
            site_raw: self.site.clone(),
            template_raw: tmpl.clone(),
            vars: self.vars.clone(),
        })
    }
}

// ── validation ────────────────────────────────────────────

fn validate_settings(file: &SettingsFile, path: &str) -> Result<(), VirtupError> {
    if let Some(0) = file.site.vcpus {
        return Err(VirtupError::Validation {
            message: format!("{path}: vcpus must be at least 1"),
        });
    }
    if let Some(memory) = file.site.memory
        && memory < 128
    {
        return Err(VirtupError::Validation {
            message: format!("{path}: memory must be at least 128 (MiB)"),
        });
    }
    if let Some(0) = file.site.password_length {
        return Err(VirtupError::Validation {
            message: format!("{path}: password_length must be at least 1"),
        });
    }
    if let Some(0) = file.site.retry_attempts {
        return Err(VirtupError::Validation {
            message: format!("{path}: retry_attempts must be at least 1"),
        });
    }
    for (name, tmpl) in &file.templates {
        if let Some(0) = tmpl.vcpus {
            return Err(VirtupError::Validation {
                message: format!("{path}: template '{name}': vcpus must be at least 1"),
            });
        }
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn parse_settings(contents: &str, path: &str) -> Result<SettingsFile, VirtupError> {
    let file: SettingsFile =
        facet_toml::from_str(contents).map_err(|e| VirtupError::ConfigParse {
            path: path.into(),
            message: e.to_string(),
        })?;
    validate_settings(&file, path)?;
    Ok(file)
}

/// Read one layer; a missing file is an empty layer.
fn read_layer(path: &Path) -> Result<Option<SettingsFile>, VirtupError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_settings(&contents, &path.display().to_string()).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(VirtupError::ConfigLoad {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Load built-in defaults, then system, user and `templates.d` files.
pub fn load_settings(paths: &Paths) -> Result<Settings, VirtupError> {
    let mut layers = vec![parse_settings(DEFAULT_SETTINGS, "<built-in>")?];

    for path in [paths.system_settings_file(), paths.settings_file()] {
        if let Some(layer) = read_layer(&path)? {
            tracing::debug!(path = %path.display(), "loaded settings");
            layers.push(layer);
        }
    }

    let dropins = paths.templates_dir();
    if let Ok(entries) = std::fs::read_dir(&dropins) {
        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        files.sort();
        for path in files {
            if let Some(layer) = read_layer(&path)? {
                tracing::debug!(path = %path.display(), "loaded template definitions");
                layers.push(layer);
            }
        }
    }

    Ok(Settings::from_layers(layers).with_vars(paths))
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn builtin() -> Settings {
        Settings::from_layers(vec![parse_settings(DEFAULT_SETTINGS, "<built-in>").unwrap()])
    }

    #[test]
    fn builtin_defaults_parse() {
        let settings = builtin();
        let site = settings.site();
        assert_eq!(site.pool, "default");
        assert_eq!(site.username, "virt");
        assert_eq!(site.image_format, "qcow2");
        assert_eq!(site.retry, Retry::default());
        assert!(settings.templates().count() >= 5);
    }

    #[test]
    fn template_inherits_site_address_source() {
        let tmpl = builtin().template("generic-centos-8").unwrap();
        assert_eq!(tmpl.os_variant.as_deref(), Some("centos8"));
        assert_eq!(tmpl.address_source, AddressSource::Agent);
    }

    #[test]
    fn template_overrides_address_source() {
        let tmpl = builtin().template("generic-fedora-32").unwrap();
        assert_eq!(tmpl.address_source, AddressSource::Arp);
    }

    #[test]
    fn unknown_template_is_an_error() {
        let err = builtin().template("no-such-template").unwrap_err();
        assert!(matches!(err, VirtupError::TemplateNotFound { .. }));
    }

    #[test]
    fn bad_address_source_is_an_error() {
        let toml = r#"
[templates.broken]
os_version = "x"
os_variant = "y"
address_source = "carrier-pigeon"
"#;
        let settings = Settings::from_layers(vec![parse_settings(toml, "t").unwrap()]);
        let err = settings.template("broken").unwrap_err();
        assert!(matches!(err, VirtupError::InvalidAddressSource { .. }));
    }

    #[test]
    fn later_layers_override_site_fields() {
        let upper = r#"
[site]
pool = "fast"
memory = 2048
"#;
        let settings = Settings::from_layers(vec![
            parse_settings(DEFAULT_SETTINGS, "<built-in>").unwrap(),
            parse_settings(upper, "user").unwrap(),
        ]);
        let site = settings.site();
        assert_eq!(site.pool, "fast");
        assert_eq!(site.memory, 2048);
        // untouched fields survive from the lower layer
        assert_eq!(site.username, "virt");
    }

    #[test]
    fn later_layers_override_single_template_fields() {
        let upper = r#"
[templates.generic-centos-8]
address_source = "arp"
"#;
        let settings = Settings::from_layers(vec![
            parse_settings(DEFAULT_SETTINGS, "<built-in>").unwrap(),
            parse_settings(upper, "user").unwrap(),
        ]);
        let tmpl = settings.template("generic-centos-8").unwrap();
        assert_eq!(tmpl.address_source, AddressSource::Arp);
        assert_eq!(tmpl.os_version.as_deref(), Some("centos-8.2"));
        assert_eq!(tmpl.os_variant.as_deref(), Some("centos8"));
        assert_eq!(tmpl.desc, "CentOS 8.2");
    }

    #[test]
    fn extra_args_site_then_template_with_vars() {
        let toml = r#"
[site]
virt_builder_args = "--smp 2"

[templates.t]
os_version = "debian-10"
os_variant = "debian10"
virt_builder_args = '--firstboot "{scripts}/fix net.sh" --install "sudo,git"'
"#;
        let paths = Paths::under(Path::new("/cfg"));
        let settings = Settings::from_layers(vec![parse_settings(toml, "t").unwrap()]).with_vars(&paths);
        let args = settings
            .template("t")
            .unwrap()
            .extra_args(Tool::VirtBuilder)
            .unwrap();
        assert_eq!(
            args,
            vec![
                "--smp",
                "2",
                "--firstboot",
                "/cfg/config/scripts/fix net.sh",
                "--install",
                "sudo,git",
            ]
        );
    }

    #[test]
    fn extra_args_absent_is_empty() {
        let tmpl = builtin().template("generic-centos-8").unwrap();
        assert!(tmpl.extra_args(Tool::Cp).unwrap().is_empty());
    }

    #[test]
    fn hostname_uses_dns_domain() {
        let toml = r#"
[site]
dns_domain = "lab.example"

[templates.t]
os_version = "x"
os_variant = "y"
"#;
        let settings = Settings::from_layers(vec![parse_settings(toml, "t").unwrap()]);
        let tmpl = settings.template("t").unwrap();
        assert_eq!(tmpl.hostname("worker-1"), "worker-1.lab.example");
        assert_eq!(builtin().template("generic-centos-8").unwrap().hostname("a"), "a");
    }

    #[test]
    fn zero_vcpus_rejected() {
        assert!(parse_settings("[site]\nvcpus = 0\n", "t").is_err());
    }

    #[test]
    fn load_reads_user_file_and_dropins() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::under(dir.path());
        std::fs::create_dir_all(paths.templates_dir()).unwrap();
        std::fs::write(paths.settings_file(), "[site]\nusername = \"alice\"\n").unwrap();
        std::fs::write(
            paths.templates_dir().join("lab.toml"),
            "[templates.lab]\nos_version = \"debian-10\"\nos_variant = \"debian10\"\n",
        )
        .unwrap();

        let settings = load_settings(&paths).unwrap();
        assert_eq!(settings.site().username, "alice");
        assert!(settings.template("lab").is_ok());
        assert!(settings.template("generic-centos-8").is_ok());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::under(dir.path());
        std::fs::create_dir_all(&paths.config_home).unwrap();
        std::fs::write(paths.settings_file(), "[site\n").unwrap();
        let err = load_settings(&paths).unwrap_err();
        assert!(matches!(err, VirtupError::ConfigParse { ref path, .. } if path.ends_with("settings.toml")));
    }
}
