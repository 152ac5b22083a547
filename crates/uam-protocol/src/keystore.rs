use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto::Keypair;
use crate::error::UamProtocolError;

/// Environment variable supplying a base64 seed, bypassing disk.
pub const SEED_ENV: &str = "UAM_SEED";

/// Persistent storage for the agent's identity and bearer token.
///
/// Layout under the configured directory: `{name}.key` (base64 seed,
/// owner-only), `{name}.pub` (base64 verify key), `{name}.token`
/// (bearer token, with a legacy `{name}.token.txt` fallback read path).
/// The seed is written once on first run and never rotates here.
pub struct KeyStore {
    dir: PathBuf,
    name: String,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join(format!("{}.key", self.name))
    }

    fn pub_path(&self) -> PathBuf {
        self.dir.join(format!("{}.pub", self.name))
    }

    fn token_path(&self) -> PathBuf {
        self.dir.join(format!("{}.token", self.name))
    }

    fn legacy_token_path(&self) -> PathBuf {
        self.dir.join(format!("{}.token.txt", self.name))
    }

    /// Load the agent keypair, generating and persisting one on first
    /// run. A `UAM_SEED` environment override bypasses disk entirely.
    pub fn load_or_generate(&self) -> Result<Keypair, UamProtocolError> {
        if let Ok(seed_b64) = std::env::var(SEED_ENV) {
            tracing::debug!("keystore: using seed from {SEED_ENV}");
            return Keypair::from_seed_b64(seed_b64.trim());
        }
        self.load_from_disk()
    }

    fn load_from_disk(&self) -> Result<Keypair, UamProtocolError> {
        let key_path = self.key_path();
        if key_path.exists() {
            let seed_b64 = fs::read_to_string(&key_path).map_err(io_err)?;
            return Keypair::from_seed_b64(seed_b64.trim());
        }

        let keypair = Keypair::generate();
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        fs::write(&key_path, keypair.seed_b64()).map_err(io_err)?;
        fs::write(self.pub_path(), keypair.public_key_b64()).map_err(io_err)?;
        restrict_permissions(&key_path);
        tracing::info!(
            "keystore: generated new identity {} at {}",
            keypair.fingerprint(),
            key_path.display()
        );
        Ok(keypair)
    }

    /// Read the stored bearer token, trying the legacy path as fallback.
    pub fn token(&self) -> Option<String> {
        for path in [self.token_path(), self.legacy_token_path()] {
            if let Ok(token) = fs::read_to_string(&path) {
                let token = token.trim().to_string();
                if !token.is_empty() {
                    return Some(token);
                }
            }
        }
        None
    }

    /// Persist the bearer token, owner-only.
    pub fn store_token(&self, token: &str) -> Result<(), UamProtocolError> {
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let path = self.token_path();
        fs::write(&path, token).map_err(io_err)?;
        restrict_permissions(&path);
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> UamProtocolError {
    UamProtocolError::Keystore(e.to_string())
}

/// Owner-only read/write on POSIX; best-effort elsewhere.
#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!("keystore: could not restrict {}: {e}", path.display());
    }
}

#[cfg(not(unix))]
fn restrict_permissions(path: &Path) {
    tracing::warn!(
        "keystore: cannot restrict permissions on this platform; {} may be readable by other users",
        path.display()
    );
}
