use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::VirtupError;

/// Last hardware address libvirt assigned to each instance name.
///
/// Rebuilding an instance under the same name asks for the same MAC so the
/// guest tends to get the same DHCP lease. The entry is only a hint.
pub struct MacRegistry {
    path: PathBuf,
    addrs: BTreeMap<String, String>,
}

impl MacRegistry {
    pub fn load(path: &Path) -> Result<Self, VirtupError> {
        let addrs = match fs::read_to_string(path) {
            Ok(contents) => {
                facet_json::from_str(&contents).map_err(|e| VirtupError::MetadataParse {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(VirtupError::Io {
                    context: format!("reading {}", path.display()),
                    source: e,
                });
            }
        };
        Ok(Self {
            path: path.into(),
            addrs,
        })
    }

    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.addrs.get(name).map(String::as_str)
    }

    /// Record `mac` for `name`; the file is rewritten only on change.
    pub fn update(&mut self, name: &str, mac: &str) -> Result<(), VirtupError> {
        if self.lookup(name) == Some(mac) {
            return Ok(());
        }
        self.addrs.insert(name.into(), mac.into());
        self.save()
    }

    /// Forget `name`. Instance deletion leaves entries in place.
    pub fn erase(&mut self, name: &str) -> Result<(), VirtupError> {
        if self.addrs.remove(name).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<(), VirtupError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| VirtupError::Io {
                context: format!("creating {}", parent.display()),
                source: e,
            })?;
        }
        let json = facet_json::to_string(&self.addrs).map_err(|e| VirtupError::Serialize {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        fs::write(&self.path, json).map_err(|e| VirtupError::Io {
            context: format!("writing {}", self.path.display()),
            source: e,
        })
    }
}
