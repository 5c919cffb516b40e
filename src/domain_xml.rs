//! The parts of libvirt domain and storage-pool XML that virt-up reads back,
//! deserialized with facet-xml.

use facet::Facet;
use facet_xml as xml;

use crate::error::VirtupError;

// ── domain ─────────────────────────────────────────────────

#[derive(Debug, Default, Facet)]
#[facet(rename = "domain", default)]
struct DomainDef {
    #[facet(default)]
    name: String,
    #[facet(default)]
    devices: Devices,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct Devices {
    #[facet(xml::elements, rename = "disk", default)]
    disks: Vec<DiskDef>,
    #[facet(xml::elements, rename = "interface", default)]
    interfaces: Vec<InterfaceDef>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct DiskDef {
    #[facet(xml::attribute, default)]
    device: String,
    #[facet(default)]
    source: Option<FileSource>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct FileSource {
    #[facet(xml::attribute, default)]
    file: Option<String>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct InterfaceDef {
    #[facet(default)]
    mac: Option<MacDef>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct MacDef {
    #[facet(xml::attribute, default)]
    address: String,
}

// ── storage pool ───────────────────────────────────────────

#[derive(Debug, Default, Facet)]
#[facet(rename = "pool", default)]
struct PoolDef {
    #[facet(default)]
    target: Option<PoolTarget>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct PoolTarget {
    #[facet(default)]
    path: String,
}

// ── public API ─────────────────────────────────────────────

/// Hardware addresses and backing files of one domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainInfo {
    /// Lowercased interface MAC addresses, in definition order.
    pub macs: Vec<String>,
    /// Source files of `device='disk'` disks. CD-ROMs are not included.
    pub disks: Vec<String>,
}

pub fn parse_domain(xml_desc: &str) -> Result<DomainInfo, VirtupError> {
    let def: DomainDef = facet_xml::from_str(xml_desc).map_err(|e| VirtupError::Libvirt {
        message: format!("cannot parse domain XML: {e}"),
        hint: "inspect the definition with `virsh dumpxml`".into(),
    })?;

    let macs = def
        .devices
        .interfaces
        .into_iter()
        .filter_map(|i| i.mac)
        .map(|m| m.address.to_ascii_lowercase())
        .filter(|m| !m.is_empty())
        .collect();
    let disks = def
        .devices
        .disks
        .into_iter()
        .filter(|d| d.device.is_empty() || d.device == "disk")
        .filter_map(|d| d.source.and_then(|s| s.file))
        .collect();

    Ok(DomainInfo { macs, disks })
}

/// Target directory of a storage pool.
pub fn parse_pool_path(xml_desc: &str) -> Result<String, VirtupError> {
    let def: PoolDef = facet_xml::from_str(xml_desc).map_err(|e| VirtupError::Libvirt {
        message: format!("cannot parse storage pool XML: {e}"),
        hint: "inspect the pool with `virsh pool-dumpxml`".into(),
    })?;
    def.target
        .map(|t| t.path)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| VirtupError::Libvirt {
            message: "storage pool has no target path".into(),
            hint: "only directory-backed pools are supported".into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = r#"<domain type="kvm">
  <name>TEMPLATE-generic-centos-8</name>
  <devices>
    <disk type="file" device="disk">
      <source file="/var/lib/libvirt/images/TEMPLATE-generic-centos-8.qcow2"/>
    </disk>
    <disk type="file" device="cdrom">
      <source file="/tmp/seed.iso"/>
    </disk>
    <interface type="network">
      <mac address="52:54:00:AB:CD:EF"/>
    </interface>
    <interface type="network">
      <mac address="52:54:00:12:34:56"/>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn domain_disks_exclude_cdrom() {
        let info = parse_domain(DOMAIN).unwrap();
        assert_eq!(
            info.disks,
            vec!["/var/lib/libvirt/images/TEMPLATE-generic-centos-8.qcow2"]
        );
    }

    #[test]
    fn domain_macs_are_lowercased() {
        let info = parse_domain(DOMAIN).unwrap();
        assert_eq!(info.macs, vec!["52:54:00:ab:cd:ef", "52:54:00:12:34:56"]);
    }

    #[test]
    fn pool_target_path() {
        let xml = r#"<pool type="dir">
  <name>default</name>
  <target>
    <path>/home/user/.local/share/libvirt/images</path>
  </target>
</pool>"#;
        assert_eq!(
            parse_pool_path(xml).unwrap(),
            "/home/user/.local/share/libvirt/images"
        );
    }
}
