//! Ansible inventory generated from instance metadata.

use std::collections::BTreeMap;
use std::path::Path;

use facet::Facet;

use crate::error::VirtupError;
use crate::metadata::{Metadata, MetadataStore};

// ── YAML model ─────────────────────────────────────────────

#[derive(Debug, Facet)]
struct Inventory {
    all: AllGroup,
}

#[derive(Debug, Facet)]
struct AllGroup {
    children: Children,
}

#[derive(Debug, Facet)]
struct Children {
    virtup_clones: HostGroup,
    virtup_templates: HostGroup,
}

#[derive(Debug, Default, Facet)]
struct HostGroup {
    hosts: BTreeMap<String, HostVars>,
}

/// Connection facts for one inventory host.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct HostVars {
    pub ansible_host: String,
    pub ansible_user: String,
    pub ansible_ssh_private_key_file: String,
    pub ansible_ssh_common_args: String,
}

// ── projection ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub name: String,
    pub is_clone: bool,
    pub vars: HostVars,
}

fn entry(name: String, meta: &Metadata) -> Option<InventoryEntry> {
    if !meta.in_inventory() {
        return None;
    }
    let Some(address) = meta.address.clone() else {
        tracing::warn!(name = %name, "no address recorded, leaving it out of the inventory");
        return None;
    };
    let user = meta.user.clone().unwrap_or_default();
    Some(InventoryEntry {
        vars: HostVars {
            ansible_host: address,
            ansible_user: user.username,
            ansible_ssh_private_key_file: user.ssh_identity,
            ansible_ssh_common_args: meta.ssh_options.join(" "),
        },
        is_clone: meta.is_clone(),
        name,
    })
}

/// Inventory hosts, one per recorded instance with an address. Lazy; each
/// call rescans the metadata directory.
pub fn entries(store: &MetadataStore) -> impl Iterator<Item = InventoryEntry> + '_ {
    store.records().filter_map(|(name, meta)| entry(name, &meta))
}

pub fn render(entries: impl IntoIterator<Item = InventoryEntry>) -> Result<String, VirtupError> {
    let mut clones = HostGroup::default();
    let mut templates = HostGroup::default();
    for e in entries {
        let group = if e.is_clone { &mut clones } else { &mut templates };
        group.hosts.insert(e.name, e.vars);
    }
    let inventory = Inventory {
        all: AllGroup {
            children: Children {
                virtup_clones: clones,
                virtup_templates: templates,
            },
        },
    };
    let yaml = facet_yaml::to_string(&inventory).map_err(|e| VirtupError::Serialize {
        path: "inventory".into(),
        message: e.to_string(),
    })?;
    Ok(yaml.strip_prefix("---\n").unwrap_or(&yaml).to_string())
}

/// Rewrite the inventory file from the current metadata. Returns the number
/// of hosts written.
pub fn write_inventory(store: &MetadataStore, path: &Path) -> Result<usize, VirtupError> {
    let hosts: Vec<_> = entries(store).collect();
    let count = hosts.len();
    let yaml = render(hosts)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| VirtupError::Io {
            context: format!("creating {}", parent.display()),
            source: e,
        })?;
    }
    std::fs::write(path, yaml).map_err(|e| VirtupError::Io {
        context: format!("writing {}", path.display()),
        source: e,
    })?;
    tracing::debug!(path = %path.display(), hosts = count, "inventory written");
    Ok(count)
}
