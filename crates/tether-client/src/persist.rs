//! Durable storage for the pairing secret.
//!
//! The file variant keeps a hex-encoded JSON blob under the user config dir
//! (mode 0600 on Unix). The memory variant exists purely for tests and is
//! interchangeable: the client never knows which one it has.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tether_core::crypto::SymmetricKey;
use tether_core::pairing::PairingSecret;

pub const PAIRING_FILE_NAME: &str = "pairing.json";

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state exists but cannot be decoded. The client fails closed
    /// on this rather than operating on a half-loaded secret.
    #[error("corrupt pairing state: {0}")]
    Corrupt(String),
}

pub trait Persister: Send + Sync {
    fn save(&self, pairing: &PairingSecret) -> Result<(), PersistError>;

    /// `Ok(None)` when nothing was ever persisted.
    fn load(&self) -> Result<Option<PairingSecret>, PersistError>;

    fn clear(&self) -> Result<(), PersistError>;
}

/// On-disk JSON shape. Key material is hex, like every other secret we store.
#[derive(Serialize, Deserialize)]
struct StoredPairing {
    queue: String,
    workstation_pub_hex: String,
    symmetric_hex: Option<String>,
}

impl StoredPairing {
    fn from_pairing(pairing: &PairingSecret) -> Self {
        Self {
            queue: pairing.queue().to_string(),
            workstation_pub_hex: hex::encode(pairing.workstation_public()),
            symmetric_hex: pairing
                .symmetric_key()
                .map(|k| hex::encode(k.as_bytes())),
        }
    }

    fn into_pairing(self) -> Result<PairingSecret, PersistError> {
        let decode32 = |label: &str, s: &str| -> Result<[u8; 32], PersistError> {
            let bytes =
                hex::decode(s).map_err(|e| PersistError::Corrupt(format!("{label}: {e}")))?;
            bytes
                .try_into()
                .map_err(|_| PersistError::Corrupt(format!("{label}: wrong length")))
        };

        let workstation_public = decode32("workstation key", &self.workstation_pub_hex)?;
        let symmetric_key = match &self.symmetric_hex {
            Some(s) => Some(SymmetricKey::from_bytes(decode32("symmetric key", s)?)),
            None => None,
        };

        Ok(PairingSecret::from_parts(
            self.queue,
            workstation_public,
            symmetric_key,
        ))
    }
}

/// Durable persister writing under `<config dir>/tether/`.
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `~/.config/tether/pairing.json` (platform equivalent via `dirs`).
    #[must_use]
    pub fn default_path() -> PathBuf {
        let mut p = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        p.push("tether");
        p.push(PAIRING_FILE_NAME);
        p
    }
}

impl Default for FilePersister {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

impl Persister for FilePersister {
    fn save(&self, pairing: &PairingSecret) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let stored = StoredPairing::from_pairing(pairing);
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| PersistError::Corrupt(e.to_string()))?;

        fs::write(&self.path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            let _ = fs::set_permissions(&self.path, perms);
        }
        Ok(())
    }

    fn load(&self) -> Result<Option<PairingSecret>, PersistError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stored: StoredPairing =
            serde_json::from_str(&json).map_err(|e| PersistError::Corrupt(e.to_string()))?;
        stored.into_pairing().map(Some)
    }

    fn clear(&self) -> Result<(), PersistError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory persister for tests.
#[derive(Default)]
pub struct MemoryPersister {
    slot: Mutex<Option<PairingSecret>>,
}

impl Persister for MemoryPersister {
    fn save(&self, pairing: &PairingSecret) -> Result<(), PersistError> {
        *self.slot.lock().expect("persister lock") = Some(pairing.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<PairingSecret>, PersistError> {
        Ok(self.slot.lock().expect("persister lock").clone())
    }

    fn clear(&self) -> Result<(), PersistError> {
        *self.slot.lock().expect("persister lock") = None;
        Ok(())
    }
}
