use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use rand_core::{OsRng, RngCore};
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use crate::error::VirtupError;
use crate::metadata::Creds;

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Random password of exactly `len` ASCII letters and digits.
pub fn generate_password(len: usize) -> String {
    // Largest multiple of the alphabet size that fits in a byte; anything at
    // or above it is rejected so every character is equally likely.
    let limit = (256 / ALPHANUMERIC.len() * ALPHANUMERIC.len()) as u8;
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        OsRng.fill_bytes(&mut buf);
        for &b in &buf {
            if b < limit && out.len() < len {
                out.push(ALPHANUMERIC[b as usize % ALPHANUMERIC.len()] as char);
            }
        }
    }
    out
}

/// Hands out credential sets; ssh keys are generated once per principal and
/// kept under `<data-home>/sshkeys/`.
pub struct CredentialIssuer {
    keys_dir: PathBuf,
    password_length: usize,
}

impl CredentialIssuer {
    pub fn new(keys_dir: &Path, password_length: usize) -> Self {
        Self {
            keys_dir: keys_dir.into(),
            password_length,
        }
    }

    pub fn issue(&self, username: &str, password: Option<&str>) -> Result<Creds, VirtupError> {
        let password = match password {
            Some(p) => p.to_string(),
            None => generate_password(self.password_length),
        };
        let identity = self.ensure_ssh_keys(username)?;
        Ok(Creds {
            username: username.into(),
            password,
            ssh_identity: identity.display().to_string(),
        })
    }

    /// Path of the private key for `name`, generating the pair if absent.
    /// A private key without its `.pub` half is an error, never regenerated.
    pub fn ensure_ssh_keys(&self, name: &str) -> Result<PathBuf, VirtupError> {
        let private = self.keys_dir.join(name);
        let public = self.keys_dir.join(format!("{name}.pub"));

        if private.exists() {
            if !public.exists() {
                return Err(VirtupError::MissingPublicKey {
                    path: public.display().to_string(),
                });
            }
            tracing::debug!(path = %private.display(), "reusing ssh key");
            return Ok(private);
        }

        tracing::info!(path = %private.display(), "generating ssh key pair");
        fs::create_dir_all(&self.keys_dir).map_err(|e| VirtupError::Io {
            context: format!("creating {}", self.keys_dir.display()),
            source: e,
        })?;
        // A stale public half would not match the new key.
        let _ = fs::remove_file(&public);

        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|e| {
            VirtupError::SshKey {
                message: format!("generating key: {e}"),
            }
        })?;
        let private_pem = key.to_openssh(LineEnding::LF).map_err(|e| VirtupError::SshKey {
            message: format!("encoding private key: {e}"),
        })?;
        let public_line = key
            .public_key()
            .to_openssh()
            .map_err(|e| VirtupError::SshKey {
                message: format!("encoding public key: {e}"),
            })?;

        write_file(&private, private_pem.as_bytes(), 0o600)?;
        write_file(&public, format!("{public_line}\n").as_bytes(), 0o644)?;
        Ok(private)
    }
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), VirtupError> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .and_then(|mut f| f.write_all(contents))
        .map_err(|e| VirtupError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })
}
