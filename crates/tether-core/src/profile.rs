//! The enclave's identity as cached on the workstation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity material returned by a successful Me request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Human-readable name of the paired device.
    pub device_name: String,

    /// Wire-encoded public key held by the enclave (hex in JSON).
    #[serde(with = "crate::protocol::hex_bytes")]
    pub public_key_wire: Vec<u8>,
}

impl Profile {
    /// SHA-256 fingerprint of the wire-encoded public key. Sign requests
    /// address the enclave key by this fingerprint.
    #[must_use]
    pub fn public_key_fingerprint(&self) -> [u8; 32] {
        let digest = Sha256::digest(&self.public_key_wire);
        digest.into()
    }
}
