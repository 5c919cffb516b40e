use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::VirtupError;

/// Login details for one principal on an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
#[facet(default)]
pub struct Creds {
    pub username: String,
    pub password: String,
    /// Private key path; the public half is `<ssh_identity>.pub`.
    pub ssh_identity: String,
}

/// Everything virt-up knows about an instance beyond the libvirt domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
#[facet(default)]
pub struct Metadata {
    pub template: Option<String>,
    pub created: Option<String>,
    pub cloned: Option<String>,
    /// Source instance of a clone.
    pub from: Option<String>,
    pub os_version: Option<String>,
    pub os_variant: Option<String>,
    pub disk: Option<String>,
    pub disk_format: Option<String>,
    /// The disk is a copy-on-write overlay backed by the source's disk.
    pub linked: bool,
    pub memory: Option<u64>,
    pub vcpus: Option<u32>,
    pub graphics: Option<String>,
    pub size: Option<String>,
    pub hostname: Option<String>,
    pub root: Option<Creds>,
    pub user: Option<Creds>,
    pub address_source: Option<String>,
    pub address: Option<String>,
    pub ssh_options: Vec<String>,
    pub inventory: Option<bool>,
}

macro_rules! changed_fields {
    ($old:expr, $new:expr; $($field:ident),+ $(,)?) => {{
        let mut changed = Vec::new();
        $(
            if $old.$field != $new.$field {
                changed.push(stringify!($field));
            }
        )+
        changed
    }};
}

impl Metadata {
    pub fn is_clone(&self) -> bool {
        self.cloned.is_some()
    }

    /// Whether deleting `source` would break this instance's disk.
    pub fn depends_on(&self, source: &str) -> bool {
        self.linked && self.from.as_deref() == Some(source)
    }

    pub fn in_inventory(&self) -> bool {
        self.inventory != Some(false)
    }

    /// Names of the fields that differ between two records.
    pub fn diff(&self, other: &Metadata) -> Vec<&'static str> {
        changed_fields!(self, other;
            template, created, cloned, from, os_version, os_variant, disk,
            disk_format, linked, memory, vcpus, graphics, size, hostname,
            root, user, address_source, address, ssh_options, inventory,
        )
    }
}

/// One JSON file per instance under `<data-home>/instance/`.
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    /// A missing record is `Ok(None)`.
    pub fn read(&self, name: &str) -> Result<Option<Metadata>, VirtupError> {
        let path = self.path(name);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(VirtupError::Io {
                    context: format!("reading {}", path.display()),
                    source: e,
                });
            }
        };
        facet_json::from_str(&contents)
            .map(Some)
            .map_err(|e| VirtupError::MetadataParse {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }

    /// Replace the record. Written to a temporary file first, owner-only,
    /// then renamed into place.
    pub fn write(&self, name: &str, meta: &Metadata) -> Result<(), VirtupError> {
        let io_err = |context: String| move |e: std::io::Error| VirtupError::Io { context, source: e };

        fs::create_dir_all(&self.dir)
            .map_err(io_err(format!("creating {}", self.dir.display())))?;

        let path = self.path(name);
        let tmp = self.dir.join(format!(".{name}.json.tmp"));
        let json = facet_json::to_string(meta).map_err(|e| VirtupError::Serialize {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)
            .map_err(io_err(format!("creating {}", tmp.display())))?;
        file.write_all(json.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(io_err(format!("writing {}", tmp.display())))?;
        fs::rename(&tmp, &path).map_err(io_err(format!("replacing {}", path.display())))?;
        Ok(())
    }

    /// Apply `change` to the stored record and persist it only when a field
    /// actually changed. Returns the changed field names.
    pub fn update(
        &self,
        name: &str,
        change: impl FnOnce(&mut Metadata),
    ) -> Result<Vec<&'static str>, VirtupError> {
        let old = self
            .read(name)?
            .ok_or_else(|| VirtupError::NotFound { name: name.into() })?;
        let mut new = old.clone();
        change(&mut new);
        let changed = old.diff(&new);
        if !changed.is_empty() {
            self.write(name, &new)?;
            tracing::debug!(name, ?changed, "metadata updated");
        }
        Ok(changed)
    }

    /// Returns whether a record was removed.
    pub fn delete(&self, name: &str) -> Result<bool, VirtupError> {
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VirtupError::Io {
                context: format!("removing {}", path.display()),
                source: e,
            }),
        }
    }

    /// Instance names with a record, in directory order. Each call starts a
    /// fresh scan.
    pub fn names(&self) -> impl Iterator<Item = String> + use<> {
        fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name().into_string().ok()?;
                let name = file_name.strip_suffix(".json")?;
                (!name.starts_with('.')).then(|| name.to_string())
            })
    }

    /// Records for every name, skipping unreadable ones with a warning.
    pub fn records(&self) -> impl Iterator<Item = (String, Metadata)> + '_ {
        self.names().filter_map(|name| match self.read(&name) {
            Ok(Some(meta)) => Some((name, meta)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(name = %name, "skipping unreadable metadata: {e}");
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(&dir.path().join("instance"));
        (dir, store)
    }

    fn sample() -> Metadata {
        Metadata {
            template: Some("generic-debian-10".into()),
            os_version: Some("debian-10".into()),
            os_variant: Some("debian10".into()),
            disk: Some("/pool/vm.qcow2".into()),
            memory: Some(512),
            user: Some(Creds {
                username: "virt".into(),
                password: "pw".into(),
                ssh_identity: "/keys/virt".into(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn missing_record_reads_as_none() {
        let (_dir, store) = store();
        assert_eq!(store.read("nope").unwrap(), None);
        assert!(!store.exists("nope"));
    }

    #[test]
    fn write_then_read_back() {
        let (_dir, store) = store();
        store.write("vm", &sample()).unwrap();
        assert_eq!(store.read("vm").unwrap(), Some(sample()));
    }

    #[test]
    fn records_are_owner_only() {
        let (_dir, store) = store();
        store.write("vm", &sample()).unwrap();
        let mode = fs::metadata(store.path("vm")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn update_reports_changed_fields_only() {
        let (_dir, store) = store();
        store.write("vm", &sample()).unwrap();
        let changed = store
            .update("vm", |m| {
                m.address = Some("192.168.122.10".into());
                m.memory = Some(512);
            })
            .unwrap();
        assert_eq!(changed, vec!["address"]);
        assert_eq!(
            store.read("vm").unwrap().unwrap().address.as_deref(),
            Some("192.168.122.10")
        );
    }

    #[test]
    fn update_without_change_does_not_write() {
        let (_dir, store) = store();
        store.write("vm", &sample()).unwrap();
        let before = fs::metadata(store.path("vm")).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let changed = store.update("vm", |m| m.memory = Some(512)).unwrap();
        assert!(changed.is_empty());
        let after = fs::metadata(store.path("vm")).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn update_of_missing_record_is_not_found() {
        let (_dir, store) = store();
        let err = store.update("ghost", |m| m.linked = true).unwrap_err();
        assert!(matches!(err, VirtupError::NotFound { .. }));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        store.write("vm", &sample()).unwrap();
        assert!(store.delete("vm").unwrap());
        assert!(!store.delete("vm").unwrap());
    }

    #[test]
    fn names_are_restartable() {
        let (_dir, store) = store();
        store.write("a", &sample()).unwrap();
        store.write("b", &sample()).unwrap();
        let mut first: Vec<_> = store.names().collect();
        let mut second: Vec<_> = store.names().collect();
        first.sort();
        second.sort();
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(first, second);
    }

    #[test]
    fn corrupt_record_is_a_parse_error() {
        let (_dir, store) = store();
        fs::create_dir_all(store.path("x").parent().unwrap()).unwrap();
        fs::write(store.path("x"), "{not json").unwrap();
        assert!(matches!(
            store.read("x").unwrap_err(),
            VirtupError::MetadataParse { .. }
        ));
        assert_eq!(store.records().count(), 0);
    }

    #[test]
    fn dependency_requires_linked_disk() {
        let mut clone = sample();
        clone.from = Some("base".into());
        assert!(!clone.depends_on("base"));
        clone.linked = true;
        assert!(clone.depends_on("base"));
        assert!(!clone.depends_on("other"));
    }
}
