//! Per-job SSH key material.
//!
//! Multi-node jobs fan MPI work out from the rank-0 container over SSH, so
//! each such job gets its own RSA key pair on shared storage. If the private
//! key file already exists the pair is loaded rather than regenerated; both
//! files are deleted when the job reaches a terminal state.

use crate::job::{JobError, Result};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default basename for the private key file.
pub const DEFAULT_KEY_NAME: &str = "id_rsa";

const KEY_BITS: usize = 2048;

/// Handle to a job's RSA key pair on disk.
///
/// Only the location is persisted with the job; the key material itself
/// lives in the files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaKeyPair {
    pub directory: PathBuf,
    pub name: String,
}

impl RsaKeyPair {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self::with_name(directory, DEFAULT_KEY_NAME)
    }

    pub fn with_name(directory: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            name: name.into(),
        }
    }

    /// Path of the private key file (same basename as the pair's name).
    pub fn private_key_file(&self) -> PathBuf {
        self.directory.join(&self.name)
    }

    /// Path of the public key file.
    pub fn public_key_file(&self) -> PathBuf {
        self.directory.join(format!("{}.pub", self.name))
    }

    /// Ensure key material exists on disk.
    ///
    /// Loads the existing private key when its file is present (writing the
    /// public key file if missing); otherwise generates a fresh pair.
    pub fn ensure_generated(&self) -> Result<()> {
        let private_path = self.private_key_file();
        if private_path.exists() {
            debug!(path = %private_path.display(), "loading existing private key");
            let private = RsaPrivateKey::read_pkcs8_pem_file(&private_path)
                .map_err(|err| JobError::KeyPair(err.to_string()))?;
            if !self.public_key_file().exists() {
                self.write_public_key(&RsaPublicKey::from(&private))?;
            }
            return Ok(());
        }

        std::fs::create_dir_all(&self.directory)
            .map_err(|err| JobError::KeyPair(err.to_string()))?;
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|err| JobError::KeyPair(err.to_string()))?;
        private
            .write_pkcs8_pem_file(&private_path, LineEnding::LF)
            .map_err(|err| JobError::KeyPair(err.to_string()))?;
        restrict_permissions(&private_path)?;
        self.write_public_key(&RsaPublicKey::from(&private))?;
        info!(path = %private_path.display(), "generated key pair");
        Ok(())
    }

    fn write_public_key(&self, public: &RsaPublicKey) -> Result<()> {
        public
            .write_public_key_pem_file(self.public_key_file(), LineEnding::LF)
            .map_err(|err| JobError::KeyPair(err.to_string()))
    }

    /// The private key PEM text, for injection into worker containers.
    pub fn private_key_pem(&self) -> Result<String> {
        std::fs::read_to_string(self.private_key_file())
            .map_err(|err| JobError::KeyPair(err.to_string()))
    }

    /// Remove both key files. Missing files are not an error.
    pub fn delete_files(&self) -> Result<()> {
        for path in [self.private_key_file(), self.public_key_file()] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed key file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(JobError::KeyPair(err.to_string())),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|err| JobError::KeyPair(err.to_string()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
